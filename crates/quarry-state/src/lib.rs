//! Quarry shared state
//!
//! Primitives built on a shared, low-latency atomic key-value / sorted-set
//! store. Every component takes the store as an injected [`StateStore`] so
//! several isolated instances (and test doubles) can coexist.
//!
//! ## Components
//!
//! - [`StateStore`] / [`Pipeline`]: atomic command batches against the store
//! - [`MemoryStateStore`]: in-process store with failure injection
//! - [`AdmissionController`]: sliding-window concurrency and rate limiting, fail-open
//! - [`ConsistencyFlagStore`]: per-project needs-final and excluded-group flags, fail-soft
//! - [`RuntimeConfig`]: dynamic configuration values
//! - [`QueryLog`]: bounded list of recent queries
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use quarry_state::{AdmissionController, MemoryStateStore, RateLimitConfig};
//!
//! let store = Arc::new(MemoryStateStore::new());
//! let limiter = AdmissionController::new(store, RateLimitConfig::default());
//!
//! let guard = limiter.acquire("project:1", Some(100.0), Some(20)).await;
//! if guard.is_allowed() {
//!     // run the query
//! }
//! guard.release().await;
//! ```

pub mod config;
pub mod error;
pub mod flags;
pub mod memory;
pub mod query_log;
pub mod rate_limit;
pub mod runtime_config;
pub mod store;

pub use config::{FlagStoreConfig, GateConfig, RateLimitConfig};
pub use error::{Result, StateError};
pub use flags::{ConsistencyFlagStore, QueryFlags};
pub use memory::MemoryStateStore;
pub use query_log::QueryLog;
pub use rate_limit::{AdmissionController, RateLimitGuard, RateLimitParameters, RateLimitStats};
pub use runtime_config::RuntimeConfig;
pub use store::{Command, Pipeline, Reply, ScoreBound, StateStore};
