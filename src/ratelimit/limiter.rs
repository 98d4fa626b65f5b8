//! Rate limiter orchestrating a bucket store and the token bucket engine.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::bucket::{Decision, TokenBucket};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TollboothError};
use crate::metrics::{Counter, MetricsSink};
use crate::store::BucketStore;

/// Tokens spent by one admission check.
const REQUEST_COST: f64 = 1.0;

/// What to answer when the bucket store cannot be read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Return the store error to the caller
    #[default]
    Error,
    /// Admit the request
    Open,
    /// Reject the request
    Closed,
}

/// Per-identity token bucket rate limiter.
///
/// The limiter holds no locks of its own. Atomicity of the read-refill-
/// consume-write step for one identity is provided by the store.
pub struct RateLimiter {
    engine: TokenBucket,
    store: Arc<dyn BucketStore>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    failure_policy: FailurePolicy,
}

impl RateLimiter {
    /// Create a limiter with `capacity` tokens refilled at `refill_rate`
    /// tokens per second.
    ///
    /// Fails with [`TollboothError::Config`] unless both are positive.
    pub fn new(
        capacity: f64,
        refill_rate: f64,
        store: Arc<dyn BucketStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        Ok(Self {
            engine: TokenBucket::new(capacity, refill_rate)?,
            store,
            metrics,
            clock: Arc::new(SystemClock),
            failure_policy: FailurePolicy::default(),
        })
    }

    /// Use `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the answer given when the store cannot be read.
    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    pub fn capacity(&self) -> f64 {
        self.engine.capacity()
    }

    pub fn refill_rate(&self) -> f64 {
        self.engine.refill_rate()
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Check whether `identity` may proceed, spending one token if so.
    ///
    /// Any string is a valid identity. The refreshed bucket is persisted for
    /// denied requests too. A failed write is logged and counted but does
    /// not change the returned decision.
    pub async fn allow_and_consume(&self, identity: &str) -> Result<Decision> {
        let now = self.clock.now_millis();
        self.metrics.increment(Counter::RequestsTotal);

        trace!(identity = %identity, now = now, "Checking rate limit");

        let applied = match self
            .store
            .apply(identity, &self.engine, now, REQUEST_COST)
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                self.metrics.increment(Counter::StoreErrorsTotal);
                warn!(
                    identity = %identity,
                    error = %e,
                    policy = ?self.failure_policy,
                    "Bucket store read failed"
                );

                let decision = match self.failure_policy {
                    FailurePolicy::Error => return Err(TollboothError::Store(e)),
                    FailurePolicy::Open => Decision {
                        allowed: true,
                        remaining: 0,
                    },
                    FailurePolicy::Closed => Decision {
                        allowed: false,
                        remaining: 0,
                    },
                };
                self.record_decision(&decision);
                return Ok(decision);
            }
        };

        if let Some(e) = applied.persist_error {
            self.metrics.increment(Counter::PersistFailuresTotal);
            warn!(
                identity = %identity,
                error = %e,
                allowed = applied.decision.allowed,
                "Bucket state was not persisted; decision stands"
            );
        }

        if !applied.decision.allowed {
            debug!(
                identity = %identity,
                tokens = applied.bucket.tokens,
                "Rate limit exceeded"
            );
        }

        self.record_decision(&applied.decision);
        self.metrics
            .set_tokens_remaining(identity, applied.decision.remaining);

        Ok(applied.decision)
    }

    fn record_decision(&self, decision: &Decision) {
        let counter = if decision.allowed {
            Counter::RequestsAllowedTotal
        } else {
            Counter::RequestsDeniedTotal
        };
        self.metrics.increment(counter);
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("engine", &self.engine)
            .field("clock", &self.clock)
            .field("failure_policy", &self.failure_policy)
            .finish_non_exhaustive()
    }
}
