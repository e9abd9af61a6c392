//! Bounded log of recently executed queries.

use std::sync::Arc;

use quarry_observability::metrics::STATE_STORE_ERRORS_TOTAL;

use crate::store::{Pipeline, StateStore};

const QUERY_LOG_KEY: &str = "quarry_queries";
const MAX_QUERIES: i64 = 200;

#[derive(Clone)]
pub struct QueryLog {
    store: Arc<dyn StateStore>,
}

impl QueryLog {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Record a query, keeping only the most recent entries.
    pub async fn record(&self, query: &serde_json::Value) {
        let encoded = query.to_string();
        let result = Pipeline::new()
            .lpush(QUERY_LOG_KEY, &encoded)
            .ltrim(QUERY_LOG_KEY, 0, MAX_QUERIES - 1)
            .execute(self.store.as_ref())
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "failed to record query");
            STATE_STORE_ERRORS_TOTAL.with_label_values(&["query_log"]).inc();
        }
    }

    /// Recorded queries, newest first. Undecodable entries are skipped.
    pub async fn recent(&self) -> Vec<serde_json::Value> {
        let result = Pipeline::new()
            .lrange(QUERY_LOG_KEY, 0, -1)
            .execute(self.store.as_ref())
            .await
            .and_then(|mut replies| replies.remove(0).into_members());

        match result {
            Ok(entries) => entries
                .iter()
                .filter_map(|entry| serde_json::from_str(entry).ok())
                .collect(),
            Err(e) => {
                tracing::error!(error = %e, "failed to read query log");
                STATE_STORE_ERRORS_TOTAL.with_label_values(&["query_log"]).inc();
                Vec::new()
            }
        }
    }
}
