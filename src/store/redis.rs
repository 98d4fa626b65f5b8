//! Redis-backed bucket store.
//!
//! Buckets are stored as JSON strings under `<prefix>:<identity>` with an
//! expiry, so identities that stop calling are reclaimed by Redis itself.

use std::future::Future;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client, RedisResult, Script};
use async_trait::async_trait;
use tracing::trace;

use super::{Applied, BucketStore};
use crate::error::StoreError;
use crate::ratelimit::{Bucket, Decision, TokenBucket};

/// Default key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "rate";
/// Default bucket expiry: one day.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60 * 24);
/// Default bound on a single Redis round-trip.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Refill, consume and store in one server-side step.
///
/// Mirrors `TokenBucket::refill` and `TokenBucket::try_consume`. The record
/// is formatted by hand since `cjson` keeps only 14 significant digits, and
/// tokens are returned as a string because Redis truncates Lua numbers to
/// integers.
const APPLY_SCRIPT: &str = r#"
local key = KEYS[1]

local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local tokens = capacity
local last_refill = now

local raw = redis.call("GET", key)
if raw then
    local ok, bucket = pcall(cjson.decode, raw)
    if not ok or type(bucket) ~= "table" or tonumber(bucket.tokens) == nil or tonumber(bucket.lastRefill) == nil then
        return redis.error_reply("malformed bucket record at " .. key)
    end
    tokens = tonumber(bucket.tokens)
    last_refill = tonumber(bucket.lastRefill)
end

local elapsed = now - last_refill
if elapsed < 0 then
    elapsed = 0
end

tokens = math.min(capacity, math.max(0, tokens) + (elapsed / 1000) * refill_rate)
if now > last_refill then
    last_refill = now
end

local allowed = 0
if tokens >= cost then
    tokens = tokens - cost
    allowed = 1
end

local record = string.format('{"tokens":%.17g,"lastRefill":%.0f}', tokens, last_refill)
redis.call("SET", key, record, "EX", ttl)

return { allowed, math.floor(tokens), string.format("%.17g", tokens), string.format("%.0f", last_refill) }
"#;

/// Settings for [`RedisBucketStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreOptions {
    /// Prefix prepended to every identity, separated by `:`
    pub key_prefix: String,
    /// Expiry applied on every write; rounded down to whole seconds
    pub ttl: Duration,
    /// Upper bound on each Redis call
    pub timeout: Duration,
}

impl Default for RedisStoreOptions {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            ttl: DEFAULT_TTL,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Buckets shared between service instances through Redis.
///
/// [`apply`](BucketStore::apply) runs as a Lua script, so concurrent checks
/// for one identity from any number of instances never spend the same token
/// twice.
pub struct RedisBucketStore {
    connection_manager: ConnectionManager,
    options: RedisStoreOptions,
    apply_script: Script,
}

impl RedisBucketStore {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str, options: RedisStoreOptions) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let timeout = options.timeout;
        let connection_manager = bounded(timeout, client.get_connection_manager()).await?;

        Ok(Self::new(connection_manager, options))
    }

    /// Wrap an existing connection manager.
    pub fn new(connection_manager: ConnectionManager, options: RedisStoreOptions) -> Self {
        Self {
            connection_manager,
            options,
            apply_script: Script::new(APPLY_SCRIPT),
        }
    }

    /// The settings this store was built with.
    pub fn options(&self) -> &RedisStoreOptions {
        &self.options
    }

    /// Full Redis key for an identity.
    pub fn key_for(&self, identity: &str) -> String {
        format!("{}:{}", self.options.key_prefix, identity)
    }

    fn ttl_secs(&self) -> u64 {
        self.options.ttl.as_secs().max(1)
    }
}

impl std::fmt::Debug for RedisBucketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBucketStore")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = RedisResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(StoreError::from),
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn get(&self, identity: &str) -> Result<Option<Bucket>, StoreError> {
        let key = self.key_for(identity);
        let mut conn = self.connection_manager.clone();

        let raw: Option<String> = bounded(self.options.timeout, conn.get(&key)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, identity: &str, bucket: &Bucket) -> Result<(), StoreError> {
        let key = self.key_for(identity);
        let payload = serde_json::to_string(bucket)?;
        let mut conn = self.connection_manager.clone();

        bounded(
            self.options.timeout,
            conn.set_ex::<_, _, ()>(&key, payload, self.ttl_secs()),
        )
        .await
    }

    async fn apply(
        &self,
        identity: &str,
        engine: &TokenBucket,
        now_millis: i64,
        cost: f64,
    ) -> Result<Applied, StoreError> {
        let key = self.key_for(identity);
        let mut conn = self.connection_manager.clone();

        let mut invocation = self.apply_script.key(&key);
        invocation
            .arg(engine.capacity())
            .arg(engine.refill_rate())
            .arg(now_millis)
            .arg(cost)
            .arg(self.ttl_secs());

        let (allowed, remaining, tokens, last_refill): (i64, u64, String, String) = bounded(
            self.options.timeout,
            invocation.invoke_async(&mut conn),
        )
        .await?;

        let bucket = Bucket {
            tokens: parse_reply(&tokens)?,
            last_refill: parse_reply(&last_refill)?,
        };
        let decision = Decision {
            allowed: allowed == 1,
            remaining,
        };

        trace!(
            key = %key,
            allowed = decision.allowed,
            tokens = bucket.tokens,
            "Applied bucket script"
        );

        Ok(Applied {
            decision,
            bucket,
            persist_error: None,
        })
    }
}

fn parse_reply<T: std::str::FromStr>(value: &str) -> Result<T, StoreError> {
    value.parse().map_err(|_| {
        StoreError::Redis(::redis::RedisError::from((
            ::redis::ErrorKind::TypeError,
            "unexpected bucket script reply",
            value.to_string(),
        )))
    })
}
