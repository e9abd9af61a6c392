//! Error types for the replacer.
//!
//! Per-message errors ([`ReplacerError::DecodeError`],
//! [`ReplacerError::TranslationError`]) mean the message itself can never be
//! applied. Store and consumer errors are transient and the batch is retried
//! through redelivery. Neither kind ever advances the committed offset.

use thiserror::Error;

/// Errors that can occur while consuming and applying replacements.
#[derive(Debug, Error)]
pub enum ReplacerError {
    /// Malformed mutation payload.
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// Recognized event whose data cannot be mapped to a rewrite.
    #[error("Translation error: {0}")]
    TranslationError(String),

    /// A SQL template could not be rendered.
    #[error("Template error: {0}")]
    TemplateError(String),

    /// The analytical store rejected or timed out on a statement.
    #[error("Store execution error: {0}")]
    StoreExecutionError(String),

    /// The mutation log consumer failed to poll, commit or close.
    #[error("Consumer error: {0}")]
    ConsumerError(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O error (configuration files).
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type alias for replacer operations.
pub type Result<T> = std::result::Result<T, ReplacerError>;

impl ReplacerError {
    /// Whether retrying the same batch may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReplacerError::StoreExecutionError(_) | ReplacerError::ConsumerError(_)
        )
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ReplacerError::DecodeError(_) => "decode_error",
            ReplacerError::TranslationError(_) => "translation_error",
            ReplacerError::TemplateError(_) => "template_error",
            ReplacerError::StoreExecutionError(_) => "store_execution_error",
            ReplacerError::ConsumerError(_) => "consumer_error",
            ReplacerError::ConfigError(_) => "config_error",
            ReplacerError::IoError(_) => "io_error",
        }
    }
}

impl From<serde_json::Error> for ReplacerError {
    fn from(e: serde_json::Error) -> Self {
        ReplacerError::DecodeError(e.to_string())
    }
}

impl From<toml::de::Error> for ReplacerError {
    fn from(e: toml::de::Error) -> Self {
        ReplacerError::ConfigError(e.to_string())
    }
}
