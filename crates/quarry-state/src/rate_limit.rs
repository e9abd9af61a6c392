//! Sliding-window admission control
//!
//! Each bucket is a single sorted set in the shared state store whose members
//! are request ids and whose scores are timestamps. A request is pushed
//! `max_query_duration` into the future when it starts, so everything scored
//! after `now` is "currently executing", and is moved back to its real start
//! time when it finishes, so it counts towards the historical rate.
//!
//! ```text
//!            time >>----->
//! +-----------------------------+--------------------------------+
//! | historical request window   | currently executing requests   |
//! +-----------------------------+--------------------------------+
//!                               ^
//!                              now
//! ```
//!
//! The check-and-insert runs as one atomic pipeline. If the store is
//! unreachable the controller fails open: the request is allowed and nothing
//! is left to release.
//!
//! Release is scoped: [`RateLimitGuard`] releases on an explicit
//! [`RateLimitGuard::release`] call, and otherwise from `Drop`, which covers
//! early returns, errors and cancelled futures.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use quarry_observability::metrics::{RATE_LIMIT_DECISIONS_TOTAL, STATE_STORE_ERRORS_TOTAL};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RateLimitConfig;
use crate::error::Result;
use crate::store::{Pipeline, ScoreBound, StateStore};

/// Named rate limit applied to one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitParameters {
    /// Kind of limit, e.g. "project"
    pub rate_limit_name: String,
    /// Bucket within that kind, e.g. a project id
    pub bucket: String,
    pub per_second_limit: Option<f64>,
    pub concurrent_limit: Option<u64>,
}

impl RateLimitParameters {
    pub fn new(
        rate_limit_name: impl Into<String>,
        bucket: impl Into<String>,
        per_second_limit: Option<f64>,
        concurrent_limit: Option<u64>,
    ) -> Self {
        Self {
            rate_limit_name: rate_limit_name.into(),
            bucket: bucket.into(),
            per_second_limit,
            concurrent_limit,
        }
    }

    /// Bucket name as stored, scoped by the limit name.
    pub fn scoped_bucket(&self) -> String {
        format!("{}:{}", self.rate_limit_name, self.bucket)
    }
}

/// Observed load at admission time.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RateLimitStats {
    /// Requests per second over the lookback window
    pub rate: f64,
    /// Requests currently executing, including this one
    pub concurrent: u64,
}

/// Admission controller over named buckets in the shared state store.
#[derive(Clone)]
pub struct AdmissionController {
    store: Arc<dyn StateStore>,
    config: RateLimitConfig,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn StateStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn bucket_key(&self, bucket: &str) -> String {
        format!("{}:{}", self.config.key_prefix, bucket)
    }

    /// Admit (or deny) one request against `bucket`.
    ///
    /// The returned guard must be held for the duration of the request.
    pub async fn acquire(
        &self,
        bucket: &str,
        per_second_limit: Option<f64>,
        concurrent_limit: Option<u64>,
    ) -> RateLimitGuard {
        let key = self.bucket_key(bucket);
        let request_id = Uuid::new_v4().to_string();
        let now = now_secs();
        let max_duration = self.config.max_query_duration_secs as f64;
        let lookback = self.config.rate_lookback_secs as f64;
        let history = self.config.rate_history_secs as f64;

        let result = Pipeline::new()
            .zremrangebyscore(&key, ScoreBound::NegInf, ScoreBound::Exclusive(now - history))
            .zadd(&key, &request_id, now + max_duration)
            .zcount(&key, ScoreBound::Inclusive(now - lookback), ScoreBound::Inclusive(now))
            .zcount(&key, ScoreBound::Exclusive(now), ScoreBound::PosInf)
            .execute(self.store.as_ref())
            .await
            .and_then(|replies| Ok((replies[2].as_int()?, replies[3].as_int()?)));

        let (rate, concurrent) = match result {
            Ok(counts) => counts,
            Err(e) => {
                tracing::error!(bucket = %bucket, error = %e, "rate limit check failed, failing open");
                STATE_STORE_ERRORS_TOTAL.with_label_values(&["rate_limit"]).inc();
                RATE_LIMIT_DECISIONS_TOTAL.with_label_values(&["fail_open"]).inc();
                return RateLimitGuard::fail_open(bucket);
            }
        };

        let stats = RateLimitStats {
            rate: rate as f64 / lookback.max(1.0),
            concurrent: concurrent.max(0) as u64,
        };
        let allowed = per_second_limit.map_or(true, |limit| stats.rate <= limit)
            && concurrent_limit.map_or(true, |limit| stats.concurrent <= limit);

        if allowed {
            RATE_LIMIT_DECISIONS_TOTAL.with_label_values(&["allowed"]).inc();
        } else {
            tracing::debug!(
                bucket = %bucket,
                rate = stats.rate,
                concurrent = stats.concurrent,
                "request denied by rate limit"
            );
            RATE_LIMIT_DECISIONS_TOTAL.with_label_values(&["denied"]).inc();
        }

        RateLimitGuard {
            bucket: bucket.to_string(),
            allowed,
            stats: Some(stats),
            pending: Some(PendingRelease {
                store: Arc::clone(&self.store),
                key,
                request_id,
                allowed,
                max_duration,
            }),
        }
    }

    /// Admit a request using named parameters.
    pub async fn acquire_with(&self, params: &RateLimitParameters) -> RateLimitGuard {
        self.acquire(
            &params.scoped_bucket(),
            params.per_second_limit,
            params.concurrent_limit,
        )
        .await
    }

    /// Number of requests currently executing in `bucket`.
    pub async fn get_concurrent(&self, bucket: &str) -> Result<u64> {
        let key = self.bucket_key(bucket);
        let replies = Pipeline::new()
            .zcount(&key, ScoreBound::Exclusive(now_secs()), ScoreBound::PosInf)
            .execute(self.store.as_ref())
            .await?;
        Ok(replies[0].as_int()?.max(0) as u64)
    }

    /// Per-second rates for consecutive `rollup`-second windows covering the
    /// history horizon, oldest first.
    pub async fn get_rates(&self, bucket: &str, rollup: u64) -> Result<Vec<f64>> {
        let key = self.bucket_key(bucket);
        let rollup = rollup.max(1) as i64;
        let now = now_secs().floor() as i64;
        let horizon = now - self.config.rate_history_secs as i64;

        let mut starts = Vec::new();
        let mut start = now - rollup;
        while start > horizon {
            starts.push(start);
            start -= rollup;
        }
        starts.reverse();

        let mut pipe = Pipeline::new();
        for start in &starts {
            pipe = pipe.zcount(
                &key,
                ScoreBound::Inclusive(*start as f64),
                ScoreBound::Exclusive((*start + rollup) as f64),
            );
        }
        if pipe.is_empty() {
            return Ok(Vec::new());
        }

        let replies = pipe.execute(self.store.as_ref()).await?;
        replies
            .iter()
            .map(|r| Ok(r.as_int()? as f64 / rollup as f64))
            .collect()
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

struct PendingRelease {
    store: Arc<dyn StateStore>,
    key: String,
    request_id: String,
    allowed: bool,
    max_duration: f64,
}

impl PendingRelease {
    async fn run(self) {
        let pipe = if self.allowed {
            // Return the request to its real start time.
            Pipeline::new().zincrby(&self.key, &self.request_id, -self.max_duration)
        } else {
            Pipeline::new().zrem(&self.key, &self.request_id)
        };
        if let Err(e) = pipe.execute(self.store.as_ref()).await {
            tracing::error!(key = %self.key, error = %e, "failed to release rate limit entry");
            STATE_STORE_ERRORS_TOTAL.with_label_values(&["rate_limit"]).inc();
        }
    }
}

/// Outcome of an admission check, holding the bucket entry until released.
pub struct RateLimitGuard {
    bucket: String,
    allowed: bool,
    stats: Option<RateLimitStats>,
    pending: Option<PendingRelease>,
}

impl RateLimitGuard {
    fn fail_open(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            allowed: true,
            stats: None,
            pending: None,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Observed load, or `None` when the check failed open.
    pub fn stats(&self) -> Option<RateLimitStats> {
        self.stats
    }

    /// Release the bucket entry now, waiting for the store round trip.
    pub async fn release(mut self) {
        if let Some(pending) = self.pending.take() {
            pending.run().await;
        }
    }
}

impl std::fmt::Debug for RateLimitGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitGuard")
            .field("bucket", &self.bucket)
            .field("allowed", &self.allowed)
            .field("stats", &self.stats)
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

impl Drop for RateLimitGuard {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(pending.run());
                }
                Err(_) => {
                    tracing::warn!(
                        bucket = %self.bucket,
                        "rate limit guard dropped outside a runtime, entry left to expire"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStateStore;

    fn controller() -> (Arc<MemoryStateStore>, AdmissionController) {
        let store = Arc::new(MemoryStateStore::new());
        let controller = AdmissionController::new(store.clone(), RateLimitConfig::default());
        (store, controller)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    // ---------------------------------------------------------------
    // Concurrency limit
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_concurrent_limit_admits_up_to_limit() {
        let (_store, controller) = controller();
        let mut guards = Vec::new();
        for _ in 0..3 {
            let guard = controller.acquire("project-1", None, Some(3)).await;
            assert!(guard.is_allowed());
            guards.push(guard);
        }

        let denied = controller.acquire("project-1", None, Some(3)).await;
        assert!(!denied.is_allowed());
        assert_eq!(denied.stats().unwrap().concurrent, 4);

        for guard in guards {
            guard.release().await;
        }
        denied.release().await;
    }

    #[tokio::test]
    async fn test_buckets_are_independent() {
        let (_store, controller) = controller();
        let a = controller.acquire("a", None, Some(1)).await;
        let b = controller.acquire("b", None, Some(1)).await;
        assert!(a.is_allowed());
        assert!(b.is_allowed());
    }

    // ---------------------------------------------------------------
    // Release semantics
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_release_moves_request_into_rate_window() {
        let (_store, controller) = controller();
        let guard = controller.acquire("bucket", None, None).await;
        assert!(guard.is_allowed());
        assert_eq!(controller.get_concurrent("bucket").await.unwrap(), 1);

        guard.release().await;
        assert_eq!(controller.get_concurrent("bucket").await.unwrap(), 0);

        let next = controller.acquire("bucket", None, None).await;
        let stats = next.stats().unwrap();
        assert_eq!(stats.concurrent, 1);
        assert!((stats.rate - 1.0 / 60.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_denied_request_is_removed_on_release() {
        let (_store, controller) = controller();
        let first = controller.acquire("bucket", None, Some(1)).await;
        let denied = controller.acquire("bucket", None, Some(1)).await;
        assert!(!denied.is_allowed());

        denied.release().await;
        first.release().await;

        // Only the allowed request remains, counted as history.
        let next = controller.acquire("bucket", None, None).await;
        assert!((next.stats().unwrap().rate - 1.0 / 60.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_drop_releases_guard() {
        let (_store, controller) = controller();
        {
            let guard = controller.acquire("bucket", None, Some(1)).await;
            assert!(guard.is_allowed());
        }
        settle().await;

        assert_eq!(controller.get_concurrent("bucket").await.unwrap(), 0);
        assert!(controller.acquire("bucket", None, Some(1)).await.is_allowed());
    }

    // ---------------------------------------------------------------
    // Per-second limit
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_per_second_limit_denies_after_history() {
        let (_store, controller) = controller();
        // 0.04/s over a 60s lookback allows 3 released requests.
        for _ in 0..3 {
            let guard = controller.acquire("bucket", Some(0.04), None).await;
            assert!(guard.is_allowed());
            guard.release().await;
        }
        let guard = controller.acquire("bucket", Some(0.04), None).await;
        assert!(!guard.is_allowed());
    }

    // ---------------------------------------------------------------
    // Failure handling
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_fail_open_when_store_unavailable() {
        let (store, controller) = controller();
        store.set_available(false);

        let guard = controller.acquire("bucket", Some(0.0), Some(0)).await;
        assert!(guard.is_allowed());
        assert!(guard.stats().is_none());
        guard.release().await;
    }

    #[tokio::test]
    async fn test_release_swallows_store_errors() {
        let (store, controller) = controller();
        let guard = controller.acquire("bucket", None, None).await;
        store.set_available(false);
        guard.release().await;
        store.set_available(true);

        // The entry was never released, so it still counts as executing.
        assert_eq!(controller.get_concurrent("bucket").await.unwrap(), 1);
    }

    // ---------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_acquire_with_scopes_bucket() {
        let (_store, controller) = controller();
        let params = RateLimitParameters::new("project", "42", None, Some(1));
        assert_eq!(params.scoped_bucket(), "project:42");

        let guard = controller.acquire_with(&params).await;
        assert_eq!(guard.bucket(), "project:42");
        assert_eq!(controller.get_concurrent("project:42").await.unwrap(), 1);
        assert_eq!(controller.get_concurrent("42").await.unwrap(), 0);
        guard.release().await;
    }

    #[tokio::test]
    async fn test_get_rates_covers_history() {
        let (_store, controller) = controller();
        let rates = controller.get_rates("bucket", 60).await.unwrap();
        assert_eq!(rates.len(), 59);
        assert!(rates.iter().all(|r| *r == 0.0));
    }
}
