//! Replacement worker
//!
//! [`ReplacerWorker`] is the [`BatchWorker`] behind the replacer process:
//!
//! 1. `process_message` decodes a raw message and translates it. Transaction
//!    markers, inserts and `start_*` actions yield nothing. Undecodable or
//!    untranslatable messages are counted and returned as errors so the
//!    consumer halts on them instead of dropping them.
//! 2. `flush_batch` applies the replacements strictly in message order. For
//!    each one it runs the count query, skips the rest if no row matches,
//!    runs the insert and finally publishes the read-side flag.
//!
//! A store failure aborts the batch. Replacements already applied in it are
//! applied again on redelivery, which their predicates make harmless.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use lru::LruCache;
use quarry_observability::metrics::{
    REPLACER_BATCHES_FLUSHED_TOTAL, REPLACER_EXECUTION_SECONDS, REPLACER_MESSAGES_TOTAL,
    REPLACER_ROWS_REPLACED_TOTAL,
};
use quarry_state::ConsistencyFlagStore;

use crate::config::ReplacerConfig;
use crate::consumer::{BatchWorker, LogMessage};
use crate::error::{ReplacerError, Result};
use crate::event::{decode, DecodedMessage, MutationEvent};
use crate::replacement::{QueryTimeFlag, Replacement};
use crate::store::{scalar_count, AnalyticsStore};
use crate::translator::ReplacementTranslator;

pub struct ReplacerWorker {
    store: Arc<dyn AnalyticsStore>,
    flags: ConsistencyFlagStore,
    translator: ReplacementTranslator,
    read_table: String,
    write_table: String,
    /// Merge transactions applied by earlier, committed batches.
    applied_merge_txns: LruCache<String, ()>,
    /// Merge transactions in the batch being built.
    pending_merge_txns: Vec<String>,
}

impl ReplacerWorker {
    pub fn new(
        store: Arc<dyn AnalyticsStore>,
        flags: ConsistencyFlagStore,
        translator: ReplacementTranslator,
        config: &ReplacerConfig,
    ) -> Self {
        Self {
            store,
            flags,
            translator,
            read_table: config.read_table.clone(),
            write_table: config.write_table.clone(),
            applied_merge_txns: LruCache::new(
                NonZeroUsize::new(config.merge_txn_cache_size).unwrap_or(NonZeroUsize::MIN),
            ),
            pending_merge_txns: Vec::new(),
        }
    }

    fn is_duplicate_merge(&self, event: &MutationEvent) -> Option<bool> {
        let MutationEvent::EndMerge(merge) = event else {
            return None;
        };
        let txn = merge.transaction_id.as_ref()?;
        Some(self.applied_merge_txns.contains(txn) || self.pending_merge_txns.contains(txn))
    }

    fn remember_merge_txns(&mut self) {
        for txn in self.pending_merge_txns.drain(..) {
            self.applied_merge_txns.put(txn, ());
        }
    }

    async fn execute(&self, replacement: &Replacement) -> Result<()> {
        let kind = replacement.kind.as_str();
        let rendered = replacement.render(&self.read_table, &self.write_table)?;

        tracing::debug!(kind, sql = %rendered.count_query, "counting affected rows");
        let rows = self.store.execute(&rendered.count_query).await?;
        let count = scalar_count(&rows).ok_or_else(|| {
            ReplacerError::StoreExecutionError(format!(
                "count query for {} did not return an integer",
                kind
            ))
        })?;

        if count == 0 {
            tracing::debug!(kind, "no rows to replace");
            return Ok(());
        }

        tracing::debug!(kind, sql = %rendered.insert_query, "replacing rows");
        let start = Instant::now();
        self.store.execute(&rendered.insert_query).await?;
        let elapsed = start.elapsed();

        REPLACER_EXECUTION_SECONDS
            .with_label_values(&[kind])
            .observe(elapsed.as_secs_f64());
        REPLACER_ROWS_REPLACED_TOTAL
            .with_label_values(&[kind])
            .inc_by(count);
        tracing::info!(
            kind,
            rows = count,
            duration_ms = elapsed.as_millis() as u64,
            "replacement executed"
        );

        let (project_id, written) = match &replacement.query_time_flag {
            QueryTimeFlag::None => return Ok(()),
            QueryTimeFlag::NeedsFinal { project_id } => {
                (*project_id, self.flags.set_needs_final(*project_id).await)
            }
            QueryTimeFlag::ExcludeGroups {
                project_id,
                group_ids,
            } => (
                *project_id,
                self.flags.add_excluded_groups(*project_id, group_ids).await,
            ),
        };
        // The rows are already rewritten, so a redelivery would count zero
        // and never retry the flag.
        if !written {
            tracing::warn!(
                kind,
                project_id,
                flag = ?replacement.query_time_flag,
                "replacement applied without its read-side flag, queries may see superseded rows until merge"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl BatchWorker for ReplacerWorker {
    type Output = Replacement;

    async fn process_message(&mut self, message: &LogMessage) -> Result<Option<Replacement>> {
        let event = match decode(&message.payload) {
            Ok(DecodedMessage::Mutation(event)) => event,
            Ok(DecodedMessage::Marker(marker)) => {
                tracing::debug!(?marker, offset = message.offset, "skipping transaction marker");
                REPLACER_MESSAGES_TOTAL.with_label_values(&["skipped"]).inc();
                return Ok(None);
            }
            Ok(DecodedMessage::Skipped { version, action }) => {
                tracing::debug!(version, action = %action, offset = message.offset, "skipping message");
                REPLACER_MESSAGES_TOTAL.with_label_values(&["skipped"]).inc();
                return Ok(None);
            }
            Err(e) => {
                REPLACER_MESSAGES_TOTAL.with_label_values(&[e.kind()]).inc();
                return Err(e);
            }
        };

        if self.is_duplicate_merge(&event) == Some(true) {
            tracing::info!(
                project_id = event.project_id(),
                offset = message.offset,
                "skipping already applied merge transaction"
            );
            REPLACER_MESSAGES_TOTAL.with_label_values(&["skipped"]).inc();
            return Ok(None);
        }

        let replacement = match self.translator.translate(&event) {
            Ok(replacement) => replacement,
            Err(e) => {
                REPLACER_MESSAGES_TOTAL.with_label_values(&[e.kind()]).inc();
                return Err(e);
            }
        };

        if let MutationEvent::EndMerge(merge) = &event {
            if let Some(txn) = &merge.transaction_id {
                self.pending_merge_txns.push(txn.clone());
            }
        }

        REPLACER_MESSAGES_TOTAL
            .with_label_values(&["replacement"])
            .inc();
        Ok(Some(replacement))
    }

    async fn flush_batch(&mut self, batch: Vec<Replacement>) -> Result<()> {
        let size = batch.len();
        for replacement in &batch {
            if let Err(e) = self.execute(replacement).await {
                self.pending_merge_txns.clear();
                return Err(e);
            }
        }

        self.remember_merge_txns();
        REPLACER_BATCHES_FLUSHED_TOTAL.inc();
        tracing::debug!(replacements = size, "batch applied");
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        tracing::info!(
            read_table = %self.read_table,
            write_table = %self.write_table,
            "replacer worker shutting down"
        );
        Ok(())
    }
}
