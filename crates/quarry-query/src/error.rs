//! Query processing errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    /// Request extension data does not match its schema.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A rate limit rejected the request.
    #[error("Rate limit '{name}' exceeded for bucket '{bucket}' (rate {rate:.2}/s, {concurrent} concurrent)")]
    RateLimited {
        name: String,
        bucket: String,
        rate: f64,
        concurrent: u64,
    },
}

/// Result type alias for query processing.
pub type Result<T> = std::result::Result<T, QueryError>;
