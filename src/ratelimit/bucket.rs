//! Token bucket state and refill/consume math.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TollboothError};

/// Limiter state for a single identity.
///
/// Serialized as `{"tokens": .., "lastRefill": ..}`, which is the record
/// layout shared with the Redis script.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    /// Available admission credits, within `[0, capacity]` after a refill
    pub tokens: f64,
    /// Epoch milliseconds of the last refill
    pub last_refill: i64,
}

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the request was admitted
    pub allowed: bool,
    /// Whole tokens left after the check
    pub remaining: u64,
}

impl Decision {
    fn from_tokens(allowed: bool, tokens: f64) -> Self {
        Self {
            allowed,
            remaining: whole_tokens(tokens),
        }
    }
}

/// Floor a token count for external reporting.
pub fn whole_tokens(tokens: f64) -> u64 {
    // `as` saturates: NaN and negatives become 0.
    tokens.floor() as u64
}

/// Validated capacity and refill rate for a token bucket.
///
/// The engine is pure: it never touches storage or the clock, so every
/// backend computes the same transitions for the same inputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
}

impl TokenBucket {
    /// Create a new engine.
    ///
    /// Both `capacity` and `refill_rate` (tokens per second) must be finite
    /// and strictly positive.
    pub fn new(capacity: f64, refill_rate: f64) -> Result<Self> {
        if !capacity.is_finite() || capacity <= 0.0 {
            return Err(TollboothError::Config(format!(
                "capacity must be a positive number, got {}",
                capacity
            )));
        }
        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            return Err(TollboothError::Config(format!(
                "refill rate must be a positive number, got {}",
                refill_rate
            )));
        }

        Ok(Self {
            capacity,
            refill_rate,
        })
    }

    /// Maximum number of tokens a bucket can hold.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens granted per second of elapsed time.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// A full bucket for an identity seen for the first time.
    pub fn full(&self, now_millis: i64) -> Bucket {
        Bucket {
            tokens: self.capacity,
            last_refill: now_millis,
        }
    }

    /// Credit the time elapsed since the last refill.
    ///
    /// A clock that moved backwards credits nothing and leaves the baseline
    /// where it was.
    pub fn refill(&self, bucket: &mut Bucket, now_millis: i64) {
        let elapsed_secs = now_millis.saturating_sub(bucket.last_refill).max(0) as f64 / 1000.0;
        let tokens = bucket.tokens.max(0.0) + elapsed_secs * self.refill_rate;

        bucket.tokens = tokens.min(self.capacity);
        bucket.last_refill = bucket.last_refill.max(now_millis);
    }

    /// Take `cost` tokens if available.
    ///
    /// Must run after [`refill`](Self::refill) so elapsed time is credited
    /// before deciding.
    pub fn try_consume(&self, bucket: &mut Bucket, cost: f64) -> Decision {
        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            Decision::from_tokens(true, bucket.tokens)
        } else {
            Decision::from_tokens(false, bucket.tokens)
        }
    }
}
