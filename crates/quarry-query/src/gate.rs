//! Read-side consistency gate.
//!
//! Replacements are written as new row versions and only become the sole
//! visible version once the store merges them. Until then a plain read sees
//! both the old and the new rows. [`ProjectWithGroupsProcessor`] hides the
//! difference using the flags the replacer publishes:
//!
//! 1. Turbo requests skip the adjustment and may read stale rows.
//! 2. If any project needs a final read, the query reads the merged view.
//! 3. Otherwise excluded groups become an `assumeNotNull(group_id) NOT IN`
//!    condition, unless there are more of them than `max_group_ids_exclude`,
//!    in which case the query reads the merged view instead.

use async_trait::async_trait;
use quarry_observability::metrics::QUERY_CONSISTENCY_ADJUSTMENTS_TOTAL;
use quarry_state::{ConsistencyFlagStore, GateConfig, RuntimeConfig};

use crate::error::Result;
use crate::extension::{ExtensionQueryProcessor, ProjectExtension, ProjectExtensionProcessor};
use crate::query::{Condition, Expression, Literal, Operator, Query};
use crate::settings::RequestSettings;

/// Runtime config key overriding [`GateConfig::max_group_ids_exclude`].
pub const MAX_GROUP_IDS_EXCLUDE_KEY: &str = "max_group_ids_exclude";

/// Project processor that also applies consistency flags.
#[derive(Clone)]
pub struct ProjectWithGroupsProcessor {
    base: ProjectExtensionProcessor,
    flags: ConsistencyFlagStore,
    runtime_config: RuntimeConfig,
    config: GateConfig,
}

impl ProjectWithGroupsProcessor {
    pub fn new(flags: ConsistencyFlagStore, runtime_config: RuntimeConfig, config: GateConfig) -> Self {
        Self {
            base: ProjectExtensionProcessor::new(runtime_config.clone()),
            flags,
            runtime_config,
            config,
        }
    }

    async fn max_group_ids_exclude(&self) -> usize {
        let fallback = self.config.max_group_ids_exclude as i64;
        self.runtime_config
            .get_int(MAX_GROUP_IDS_EXCLUDE_KEY, fallback)
            .await
            .max(0) as usize
    }

    /// Apply the consistency adjustment for `project_ids` to `query`.
    pub async fn apply_consistency(
        &self,
        query: &mut Query,
        project_ids: &[u64],
        settings: &RequestSettings,
    ) {
        if settings.turbo() {
            QUERY_CONSISTENCY_ADJUSTMENTS_TOTAL
                .with_label_values(&["turbo_skip"])
                .inc();
            return;
        }

        let flags = self.flags.get_query_flags(project_ids).await;

        if flags.needs_final {
            tracing::debug!(?project_ids, "project needs final read");
            QUERY_CONSISTENCY_ADJUSTMENTS_TOTAL
                .with_label_values(&["final"])
                .inc();
            query.set_final(true);
            return;
        }

        if flags.excluded_group_ids.is_empty() {
            return;
        }

        let max = self.max_group_ids_exclude().await;
        if flags.excluded_group_ids.len() > max {
            tracing::debug!(
                ?project_ids,
                excluded = flags.excluded_group_ids.len(),
                max,
                "too many excluded groups, using final read"
            );
            QUERY_CONSISTENCY_ADJUSTMENTS_TOTAL
                .with_label_values(&["final_overflow"])
                .inc();
            query.set_final(true);
            return;
        }

        QUERY_CONSISTENCY_ADJUSTMENTS_TOTAL
            .with_label_values(&["exclude_groups"])
            .inc();
        query.add_condition(Condition::new(
            Expression::function("assumeNotNull", vec![Expression::column("group_id")]),
            Operator::NotIn,
            Literal::int_list(flags.excluded_group_ids.iter().copied()),
        ));
    }
}

#[async_trait]
impl ExtensionQueryProcessor for ProjectWithGroupsProcessor {
    async fn process_query(
        &self,
        query: &mut Query,
        extension: &ProjectExtension,
        settings: &mut RequestSettings,
    ) -> Result<()> {
        self.base.process_query(query, extension, settings).await?;
        self.apply_consistency(query, &extension.project_ids, settings)
            .await;
        Ok(())
    }
}
