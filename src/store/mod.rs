//! Bucket persistence backends.
//!
//! The rate limiter only talks to [`BucketStore`], so the same admission
//! logic runs against process memory or a shared Redis instance.

mod memory;
mod redis;

use async_trait::async_trait;

pub use self::memory::MemoryBucketStore;
pub use self::redis::{RedisBucketStore, RedisStoreOptions};

use crate::error::StoreError;
use crate::ratelimit::{Bucket, Decision, TokenBucket};

/// Result of one read-modify-write step against a store.
#[derive(Debug)]
pub struct Applied {
    /// The admission decision
    pub decision: Decision,
    /// Bucket state after refill and consume
    pub bucket: Bucket,
    /// Set when the decision was made but the new state was not persisted
    pub persist_error: Option<StoreError>,
}

/// Storage capability for per-identity buckets.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Fetch the bucket for `identity`, or `None` if it was never stored.
    async fn get(&self, identity: &str) -> Result<Option<Bucket>, StoreError>;

    /// Store `bucket` for `identity`, replacing any previous value.
    async fn set(&self, identity: &str, bucket: &Bucket) -> Result<(), StoreError>;

    /// Refill and consume `cost` tokens for `identity`, persisting the result.
    ///
    /// A missing bucket starts full. The state is written back whether or
    /// not the request was admitted so the next check refills from the new
    /// baseline.
    ///
    /// The default composes [`get`](Self::get) and [`set`](Self::set) and is
    /// not atomic: concurrent callers can both spend the same token.
    /// Backends shared between tasks override it.
    async fn apply(
        &self,
        identity: &str,
        engine: &TokenBucket,
        now_millis: i64,
        cost: f64,
    ) -> Result<Applied, StoreError> {
        let mut bucket = self
            .get(identity)
            .await?
            .unwrap_or_else(|| engine.full(now_millis));

        engine.refill(&mut bucket, now_millis);
        let decision = engine.try_consume(&mut bucket, cost);
        let persist_error = self.set(identity, &bucket).await.err();

        Ok(Applied {
            decision,
            bucket,
            persist_error,
        })
    }
}
