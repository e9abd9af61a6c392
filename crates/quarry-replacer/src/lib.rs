//! Quarry replacer
//!
//! Materializes group deletions, merges, unmerges and tag deletions in an
//! append-only analytical events table. Each mutation read from the
//! replacements log is translated into an `INSERT ... SELECT` that writes
//! new versions of the affected rows; the table's merge process later
//! collapses them. Until it does, the replacer publishes per-project flags
//! that the read side uses to hide stale rows.
//!
//! ## Architecture
//!
//! ```text
//! LogConsumer ──► BatchingConsumer ──► ReplacerWorker
//!                   (size/time)          │ decode + translate
//!                                        ▼
//!                            count / insert ──► AnalyticsStore
//!                                        │
//!                                        ▼
//!                             ConsistencyFlagStore (quarry-state)
//! ```
//!
//! The log consumer and the analytical store are collaborators behind
//! traits ([`LogConsumer`], [`AnalyticsStore`]); an in-memory consumer is
//! provided for tests and embedding.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use quarry_replacer::*;
//!
//! let config = QuarryConfig::load("quarry.toml")?;
//! let translator = ReplacementTranslator::new(Arc::new(EventsSchema::new()));
//! let worker = ReplacerWorker::new(store, flags, translator, &config.replacer);
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! BatchingConsumer::new(consumer, worker, &config.replacer)
//!     .run(shutdown_rx)
//!     .await?;
//! ```

pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
pub mod replacement;
pub mod schema;
pub mod sql;
pub mod store;
pub mod translator;
pub mod worker;

pub use config::{QuarryConfig, ReplacerConfig};
pub use consumer::{
    BatchWorker, BatchingConsumer, LogConsumer, LogMessage, MemoryLogConsumer, TopicPartition,
};
pub use error::{ReplacerError, Result};
pub use event::{
    decode, DecodedMessage, DeleteGroups, DeleteTag, Merge, MutationEvent, MutationKind,
    TransactionMarker, Unmerge,
};
pub use replacement::{QueryTimeFlag, RenderedReplacement, Replacement};
pub use schema::{DatasetSchema, EventsSchema};
pub use sql::{QueryArgs, SqlTemplate};
pub use store::AnalyticsStore;
pub use translator::ReplacementTranslator;
pub use worker::ReplacerWorker;
