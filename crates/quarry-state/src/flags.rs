//! Per-project consistency flags
//!
//! The replacer records, per project, either that reads must go through the
//! store's fully merged view (`needs_final`) or which group ids must be masked
//! until their rewrite has been materialized. Both kinds of entry live for
//! `key_ttl_secs`:
//!
//! - `project_needs_final:{id}` is a string key set with an expiry.
//! - `project_exclude_groups:{id}` is a sorted set of group ids scored by the
//!   time they were excluded. Members older than the TTL are swept on every
//!   write and read, and the key itself expires once no writes arrive.
//!
//! Every operation fails soft: a store error is logged and counted, writes are
//! dropped and reads return "no adjustment".

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use quarry_observability::metrics::STATE_STORE_ERRORS_TOTAL;

use crate::config::FlagStoreConfig;
use crate::error::{Result, StateError};
use crate::store::{Pipeline, ScoreBound, StateStore};

const NEEDS_FINAL_PREFIX: &str = "project_needs_final";
const EXCLUDE_GROUPS_PREFIX: &str = "project_exclude_groups";

/// Combined read-side flags for a set of projects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFlags {
    /// True if any project needs a final read
    pub needs_final: bool,
    /// Union of every project's excluded group ids
    pub excluded_group_ids: BTreeSet<u64>,
}

/// Store for per-project consistency flags.
#[derive(Clone)]
pub struct ConsistencyFlagStore {
    store: Arc<dyn StateStore>,
    config: FlagStoreConfig,
}

impl ConsistencyFlagStore {
    pub fn new(store: Arc<dyn StateStore>, config: FlagStoreConfig) -> Self {
        Self { store, config }
    }

    fn needs_final_key(project_id: u64) -> String {
        format!("{}:{}", NEEDS_FINAL_PREFIX, project_id)
    }

    fn exclude_groups_key(project_id: u64) -> String {
        format!("{}:{}", EXCLUDE_GROUPS_PREFIX, project_id)
    }

    fn record_error(operation: &str, project_id: Option<u64>, error: &StateError) {
        tracing::error!(
            operation = operation,
            project_id = ?project_id,
            error = %error,
            "consistency flag store unavailable"
        );
        STATE_STORE_ERRORS_TOTAL
            .with_label_values(&["consistency_flags"])
            .inc();
    }

    /// Mark a project as needing final reads until the TTL elapses.
    ///
    /// Returns whether the flag was written.
    pub async fn set_needs_final(&self, project_id: u64) -> bool {
        let result = Pipeline::new()
            .set(
                &Self::needs_final_key(project_id),
                "1",
                Some(self.config.key_ttl()),
            )
            .execute(self.store.as_ref())
            .await;

        match result {
            Ok(_) => {
                tracing::debug!(project_id, "project marked as needing final");
                true
            }
            Err(e) => {
                Self::record_error("set_needs_final", Some(project_id), &e);
                false
            }
        }
    }

    pub async fn get_needs_final(&self, project_id: u64) -> bool {
        match self.fetch_needs_final(project_id).await {
            Ok(flag) => flag,
            Err(e) => {
                Self::record_error("get_needs_final", Some(project_id), &e);
                false
            }
        }
    }

    async fn fetch_needs_final(&self, project_id: u64) -> Result<bool> {
        let mut replies = Pipeline::new()
            .get(&Self::needs_final_key(project_id))
            .execute(self.store.as_ref())
            .await?;
        Ok(replies.remove(0).into_string()?.is_some())
    }

    /// Add group ids to a project's exclusion set.
    ///
    /// Returns whether the ids were written. An empty set writes nothing and
    /// counts as written.
    pub async fn add_excluded_groups(&self, project_id: u64, group_ids: &BTreeSet<u64>) -> bool {
        if group_ids.is_empty() {
            return true;
        }

        let key = Self::exclude_groups_key(project_id);
        let now = now_secs();
        let ttl = self.config.key_ttl();

        let mut pipe = Pipeline::new();
        for group_id in group_ids {
            pipe = pipe.zadd(&key, &group_id.to_string(), now);
        }
        let result = pipe
            .zremrangebyscore(
                &key,
                ScoreBound::NegInf,
                ScoreBound::Exclusive(now - ttl.as_secs_f64()),
            )
            .expire(&key, ttl)
            .execute(self.store.as_ref())
            .await;

        match result {
            Ok(_) => {
                tracing::debug!(project_id, groups = group_ids.len(), "excluded groups recorded");
                true
            }
            Err(e) => {
                Self::record_error("add_excluded_groups", Some(project_id), &e);
                false
            }
        }
    }

    pub async fn get_excluded_groups(&self, project_id: u64) -> BTreeSet<u64> {
        self.get_query_flags(&[project_id]).await.excluded_group_ids
    }

    /// Flags for a multi-project query: needs-final is ORed and excluded
    /// groups are unioned across all projects, in one round trip.
    pub async fn get_query_flags(&self, project_ids: &[u64]) -> QueryFlags {
        let projects: BTreeSet<u64> = project_ids.iter().copied().collect();
        if projects.is_empty() {
            return QueryFlags::default();
        }

        match self.fetch_query_flags(&projects).await {
            Ok(flags) => flags,
            Err(e) => {
                Self::record_error("get_query_flags", None, &e);
                QueryFlags::default()
            }
        }
    }

    async fn fetch_query_flags(&self, projects: &BTreeSet<u64>) -> Result<QueryFlags> {
        let now = now_secs();
        let cutoff = now - self.config.key_ttl().as_secs_f64();

        let mut pipe = Pipeline::new();
        for project_id in projects {
            pipe = pipe.get(&Self::needs_final_key(*project_id));
        }
        for project_id in projects {
            let key = Self::exclude_groups_key(*project_id);
            pipe = pipe
                .zremrangebyscore(&key, ScoreBound::NegInf, ScoreBound::Exclusive(cutoff))
                .zrangebyscore(&key, ScoreBound::Inclusive(cutoff), ScoreBound::PosInf);
        }

        let replies = pipe.execute(self.store.as_ref()).await?;
        let (finals, groups) = replies.split_at(projects.len());

        let mut flags = QueryFlags::default();
        for reply in finals {
            if reply.clone().into_string()?.is_some() {
                flags.needs_final = true;
            }
        }
        for pair in groups.chunks(2) {
            let members = match pair.get(1) {
                Some(reply) => reply.clone().into_members()?,
                None => Vec::new(),
            };
            for member in members {
                match member.parse::<u64>() {
                    Ok(id) => {
                        flags.excluded_group_ids.insert(id);
                    }
                    Err(_) => tracing::warn!(member = %member, "ignoring non-numeric excluded group"),
                }
            }
        }
        Ok(flags)
    }

    /// Remove every flag recorded for a project.
    pub async fn clear(&self, project_id: u64) {
        let result = Pipeline::new()
            .del(&Self::needs_final_key(project_id))
            .del(&Self::exclude_groups_key(project_id))
            .execute(self.store.as_ref())
            .await;
        if let Err(e) = result {
            Self::record_error("clear", Some(project_id), &e);
        }
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl std::fmt::Debug for ConsistencyFlagStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistencyFlagStore")
            .field("config", &self.config)
            .finish()
    }
}
