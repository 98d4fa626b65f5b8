//! Configuration management for Tollbooth.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TollboothError};
use crate::ratelimit::FailurePolicy;
use crate::store::RedisStoreOptions;

/// Prefix for environment variable overrides, e.g. `TOLLBOOTH__LIMITER__CAPACITY`.
const ENV_PREFIX: &str = "TOLLBOOTH";

/// Main configuration for the Tollbooth service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollboothConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Token bucket configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Bucket storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// API key callers must present; checks are open when unset
    #[serde(default)]
    pub api_key: Option<String>,

    /// Collector that receives `POST /api/log` payloads; logs stay local when unset
    #[serde(default)]
    pub log_forward_url: Option<String>,

    /// Sent to the collector as `x-api-key`
    #[serde(default)]
    pub log_forward_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            api_key: None,
            log_forward_url: None,
            log_forward_key: None,
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

/// Token bucket configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Maximum tokens per identity
    #[serde(default = "default_capacity")]
    pub capacity: f64,

    /// Tokens granted per second
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,

    /// Answer given when the store cannot be read
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_rate: default_refill_rate(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

fn default_capacity() -> f64 {
    10.0
}

fn default_refill_rate() -> f64 {
    1.0
}

/// Which bucket store backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process memory; state is lost on restart and not shared
    #[default]
    Memory,
    /// Shared Redis instance
    Redis,
}

/// Bucket storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Selected backend
    #[serde(default)]
    pub backend: StorageBackend,

    /// Redis connection URL, required for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix for Redis keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Bucket expiry in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Redis call timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            ttl_secs: default_ttl_secs(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_key_prefix() -> String {
    "rate".to_string()
}

fn default_ttl_secs() -> u64 {
    60 * 60 * 24
}

fn default_timeout_ms() -> u64 {
    500
}

impl StorageConfig {
    /// Options for the Redis store.
    pub fn redis_options(&self) -> RedisStoreOptions {
        RedisStoreOptions {
            key_prefix: self.key_prefix.clone(),
            ttl: Duration::from_secs(self.ttl_secs),
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

impl TollboothConfig {
    /// Load configuration from an optional YAML file, overridden by
    /// `TOLLBOOTH__<SECTION>__<KEY>` environment variables.
    ///
    /// Not validated, so callers can layer further overrides first.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(::config::File::from(path).format(::config::FileFormat::Yaml));
        }

        let config: TollboothConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TollboothError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollboothConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TollboothError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot produce a working limiter.
    pub fn validate(&self) -> Result<()> {
        if !(self.limiter.capacity.is_finite() && self.limiter.capacity > 0.0) {
            return Err(TollboothError::Config(
                "limiter.capacity must be greater than zero".to_string(),
            ));
        }
        if !(self.limiter.refill_rate.is_finite() && self.limiter.refill_rate > 0.0) {
            return Err(TollboothError::Config(
                "limiter.refill_rate must be greater than zero".to_string(),
            ));
        }
        if self.storage.backend == StorageBackend::Redis && self.storage.redis_url.is_none() {
            return Err(TollboothError::Config(
                "storage.redis_url is required for the redis backend".to_string(),
            ));
        }
        if self.storage.key_prefix.is_empty() {
            return Err(TollboothError::Config(
                "storage.key_prefix must not be empty".to_string(),
            ));
        }
        if self.storage.ttl_secs == 0 {
            return Err(TollboothError::Config(
                "storage.ttl_secs must be at least one second".to_string(),
            ));
        }
        if self.storage.timeout_ms == 0 {
            return Err(TollboothError::Config(
                "storage.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if let Some(url) = &self.server.log_forward_url {
            reqwest::Url::parse(url).map_err(|e| {
                TollboothError::Config(format!("server.log_forward_url is not a valid URL: {e}"))
            })?;
        }
        Ok(())
    }
}
