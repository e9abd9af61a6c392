//! Quarry Observability
//!
//! Provides the Prometheus metrics shared by the replacer, the state-store
//! backed primitives and the read-side consistency gate.
//!
//! # Usage
//!
//! ```no_run
//! use quarry_observability::{exporter, metrics};
//!
//! // Register every metric with the global registry
//! metrics::init();
//!
//! // Render the text exposition format for a scrape endpoint
//! let body = exporter::gather_text().unwrap();
//! ```
//!
//! Structured logging is done with `tracing` in each crate; installing a
//! subscriber is left to the hosting process.

pub mod exporter;
pub mod metrics;

pub use metrics::{init as init_metrics, REGISTRY};

/// Initialize all observability components
pub fn init() {
    metrics::init();
}
