use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Replacer Metrics
    // ============================================================================

    /// Mutation messages consumed, by outcome
    /// (replacement, skipped, decode_error, translation_error)
    pub static ref REPLACER_MESSAGES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("quarry_replacer_messages_total", "Total mutation messages consumed"),
        &["outcome"]
    ).expect("metric can be created");

    /// Rows rewritten by replacements, by mutation kind
    pub static ref REPLACER_ROWS_REPLACED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("quarry_replacer_rows_replaced_total", "Total rows rewritten by replacements"),
        &["kind"]
    ).expect("metric can be created");

    /// Time spent executing a replacement's insert statement
    pub static ref REPLACER_EXECUTION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("quarry_replacer_execution_seconds", "Replacement execution time in seconds")
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        &["kind"]
    ).expect("metric can be created");

    /// Batches flushed successfully
    pub static ref REPLACER_BATCHES_FLUSHED_TOTAL: IntCounter = IntCounter::new(
        "quarry_replacer_batches_flushed_total",
        "Total replacement batches flushed"
    ).expect("metric can be created");

    /// Batches whose flush failed and will be redelivered
    pub static ref REPLACER_FLUSH_ERRORS_TOTAL: IntCounter = IntCounter::new(
        "quarry_replacer_flush_errors_total",
        "Total replacement batch flush failures"
    ).expect("metric can be created");

    // ============================================================================
    // State Store Metrics
    // ============================================================================

    /// Admission decisions (allowed, denied, fail_open)
    pub static ref RATE_LIMIT_DECISIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("quarry_rate_limit_decisions_total", "Total admission control decisions"),
        &["decision"]
    ).expect("metric can be created");

    /// Errors talking to the shared state store, by component
    pub static ref STATE_STORE_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("quarry_state_store_errors_total", "Total shared state store errors"),
        &["component"]
    ).expect("metric can be created");

    // ============================================================================
    // Query Metrics
    // ============================================================================

    /// Read-side consistency adjustments
    /// (final, exclude_groups, final_overflow, turbo_skip)
    pub static ref QUERY_CONSISTENCY_ADJUSTMENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("quarry_query_consistency_adjustments_total", "Total read-side consistency adjustments"),
        &["kind"]
    ).expect("metric can be created");
}

/// Initialize metrics registry
/// Can be called multiple times safely (idempotent)
pub fn init() {
    INIT.call_once(|| {
        // Replacer metrics
        REGISTRY
            .register(Box::new(REPLACER_MESSAGES_TOTAL.clone()))
            .expect("replacer_messages_total can be registered");
        REGISTRY
            .register(Box::new(REPLACER_ROWS_REPLACED_TOTAL.clone()))
            .expect("replacer_rows_replaced_total can be registered");
        REGISTRY
            .register(Box::new(REPLACER_EXECUTION_SECONDS.clone()))
            .expect("replacer_execution_seconds can be registered");
        REGISTRY
            .register(Box::new(REPLACER_BATCHES_FLUSHED_TOTAL.clone()))
            .expect("replacer_batches_flushed_total can be registered");
        REGISTRY
            .register(Box::new(REPLACER_FLUSH_ERRORS_TOTAL.clone()))
            .expect("replacer_flush_errors_total can be registered");

        // State store metrics
        REGISTRY
            .register(Box::new(RATE_LIMIT_DECISIONS_TOTAL.clone()))
            .expect("rate_limit_decisions_total can be registered");
        REGISTRY
            .register(Box::new(STATE_STORE_ERRORS_TOTAL.clone()))
            .expect("state_store_errors_total can be registered");

        // Query metrics
        REGISTRY
            .register(Box::new(QUERY_CONSISTENCY_ADJUSTMENTS_TOTAL.clone()))
            .expect("query_consistency_adjustments_total can be registered");
    });
}
