//! In-process bucket store.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{Applied, BucketStore};
use crate::error::StoreError;
use crate::ratelimit::{Bucket, TokenBucket};

/// Buckets held in process memory.
///
/// Entries live for the lifetime of the store; nothing expires. `apply`
/// holds the map's per-key lock for the whole refill and consume, so
/// concurrent checks for one identity are serialized.
#[derive(Debug, Default)]
pub struct MemoryBucketStore {
    buckets: DashMap<String, Bucket>,
}

impl MemoryBucketStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of identities with a stored bucket.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no bucket has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop every stored bucket.
    pub fn clear(&self) {
        self.buckets.clear();
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn get(&self, identity: &str) -> Result<Option<Bucket>, StoreError> {
        Ok(self.buckets.get(identity).map(|entry| *entry))
    }

    async fn set(&self, identity: &str, bucket: &Bucket) -> Result<(), StoreError> {
        self.buckets.insert(identity.to_string(), *bucket);
        Ok(())
    }

    async fn apply(
        &self,
        identity: &str,
        engine: &TokenBucket,
        now_millis: i64,
        cost: f64,
    ) -> Result<Applied, StoreError> {
        let mut entry = self
            .buckets
            .entry(identity.to_string())
            .or_insert_with(|| {
                debug!(identity = %identity, "Creating new bucket");
                engine.full(now_millis)
            });

        engine.refill(&mut entry, now_millis);
        let decision = engine.try_consume(&mut entry, cost);

        Ok(Applied {
            decision,
            bucket: *entry,
            persist_error: None,
        })
    }
}
