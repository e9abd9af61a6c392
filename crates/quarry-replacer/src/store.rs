//! Analytical store client seam.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// A column-oriented store that executes SQL statements.
///
/// Implementations map transport and server failures to
/// [`ReplacerError::StoreExecutionError`](crate::error::ReplacerError::StoreExecutionError).
#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    /// Execute one statement and return its result rows.
    ///
    /// Statements without a result set return an empty vec.
    async fn execute(&self, sql: &str) -> Result<Vec<Vec<Value>>>;
}

/// Read the single integer produced by a `SELECT count()`.
///
/// Stores that serialize 64-bit integers as strings are accepted too.
pub fn scalar_count(rows: &[Vec<Value>]) -> Option<u64> {
    match rows.first()?.first()? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
