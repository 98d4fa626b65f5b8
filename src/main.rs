use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollbooth::config::{StorageBackend, TollboothConfig};
use tollbooth::http::{AppState, HttpServer, LogForwarder};
use tollbooth::metrics::MetricsRegistry;
use tollbooth::ratelimit::RateLimiter;
use tollbooth::store::{BucketStore, MemoryBucketStore, RedisBucketStore};

/// Token bucket admission control service.
#[derive(Debug, Parser)]
#[command(name = "tollbooth", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "TOLLBOOTH_CONFIG")]
    config: Option<PathBuf>,

    /// Address to serve HTTP on
    #[arg(long, env = "TOLLBOOTH_HTTP_ADDR")]
    http_addr: Option<SocketAddr>,

    /// Bucket capacity in tokens
    #[arg(long, env = "RL_LIMIT")]
    capacity: Option<f64>,

    /// Tokens refilled per second
    #[arg(long, env = "RL_REFILL")]
    refill_rate: Option<f64>,

    /// Share bucket state through this Redis server
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// API key required on admission checks
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Relay client logs to this collector URL
    #[arg(long, env = "LOG_FORWARD_URL")]
    log_forward_url: Option<String>,

    /// API key sent to the log collector
    #[arg(long, env = "LOG_FORWARD_KEY", hide_env_values = true)]
    log_forward_key: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut TollboothConfig) {
        if let Some(addr) = self.http_addr {
            config.server.http_addr = addr;
        }
        if let Some(capacity) = self.capacity {
            config.limiter.capacity = capacity;
        }
        if let Some(refill_rate) = self.refill_rate {
            config.limiter.refill_rate = refill_rate;
        }
        if let Some(url) = self.redis_url.as_ref().filter(|u| !u.is_empty()) {
            config.storage.backend = StorageBackend::Redis;
            config.storage.redis_url = Some(url.clone());
        }
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            config.server.api_key = Some(key.clone());
        }
        if let Some(url) = self.log_forward_url.as_ref().filter(|u| !u.is_empty()) {
            config.server.log_forward_url = Some(url.clone());
        }
        if let Some(key) = self.log_forward_key.as_ref().filter(|k| !k.is_empty()) {
            config.server.log_forward_key = Some(key.clone());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Tollbooth Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TollboothConfig::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);
    config.validate()?;
    info!(
        http_addr = %config.server.http_addr,
        capacity = config.limiter.capacity,
        refill_rate = config.limiter.refill_rate,
        backend = ?config.storage.backend,
        failure_policy = ?config.limiter.failure_policy,
        "Configuration loaded"
    );

    let store: Arc<dyn BucketStore> = match config.storage.backend {
        StorageBackend::Memory => Arc::new(MemoryBucketStore::new()),
        StorageBackend::Redis => {
            let url = config
                .storage
                .redis_url
                .as_deref()
                .context("storage.redis_url is required for the redis backend")?;
            let store = RedisBucketStore::connect(url, config.storage.redis_options())
                .await
                .context("failed to connect to redis")?;
            Arc::new(store)
        }
    };

    let metrics = Arc::new(MetricsRegistry::new()?);
    let limiter = RateLimiter::new(
        config.limiter.capacity,
        config.limiter.refill_rate,
        store,
        metrics.clone(),
    )?
    .with_failure_policy(config.limiter.failure_policy);
    info!("Rate limiter initialized");

    let mut state = AppState::new(Arc::new(limiter), metrics, config.server.api_key.clone());
    if let Some(url) = &config.server.log_forward_url {
        let forwarder = LogForwarder::new(url.clone(), config.server.log_forward_key.clone())?;
        info!(url = %url, "Forwarding client logs");
        state = state.with_log_forwarder(forwarder);
    }
    let server = HttpServer::new(config.server.http_addr, state);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Tollbooth Rate Limiting Service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
