//! Error types for the Tollbooth service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Tollbooth operations.
#[derive(Error, Debug)]
pub enum TollboothError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bucket store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metric registration or encoding errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Errors raised by a [`BucketStore`](crate::store::BucketStore) backend.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The remote store rejected or failed the command
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A stored bucket record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The remote call did not complete in time
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type alias for Tollbooth operations.
pub type Result<T> = std::result::Result<T, TollboothError>;
