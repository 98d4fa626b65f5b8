//! Token bucket admission logic.

mod bucket;
mod limiter;

pub use bucket::{whole_tokens, Bucket, Decision, TokenBucket};
pub use limiter::{FailurePolicy, RateLimiter};
