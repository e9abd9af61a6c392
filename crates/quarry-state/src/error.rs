//! Error types for the shared state store.
//!
//! Every primitive built on the store (admission control, consistency flags,
//! runtime config, query log) degrades instead of surfacing these errors to
//! its caller, so they mostly show up in logs and in
//! `quarry_state_store_errors_total`.

use thiserror::Error;

/// Errors returned by a [`StateStore`](crate::StateStore) implementation.
#[derive(Debug, Error)]
pub enum StateError {
    /// The backing store could not be reached or timed out.
    #[error("State store unavailable: {0}")]
    Unavailable(String),

    /// A command was applied to a key holding a different data type.
    #[error("Wrong type for key '{key}': expected {expected}")]
    WrongType { key: String, expected: &'static str },

    /// A reply did not have the shape the caller expected.
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Result type alias for state store operations.
pub type Result<T> = std::result::Result<T, StateError>;
