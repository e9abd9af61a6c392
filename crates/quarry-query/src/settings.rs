//! Per-request settings accumulated while processing a query.

use quarry_state::{AdmissionController, RateLimitGuard, RateLimitParameters};

use crate::error::{QueryError, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestSettings {
    /// Best-effort, low-latency execution. Skips consistency adjustments.
    turbo: bool,
    rate_limits: Vec<RateLimitParameters>,
}

impl RequestSettings {
    pub fn new(turbo: bool) -> Self {
        Self {
            turbo,
            rate_limits: Vec::new(),
        }
    }

    pub fn turbo(&self) -> bool {
        self.turbo
    }

    pub fn add_rate_limit(&mut self, params: RateLimitParameters) {
        self.rate_limits.push(params);
    }

    pub fn rate_limits(&self) -> &[RateLimitParameters] {
        &self.rate_limits
    }

    /// Acquire every rate limit in order.
    ///
    /// The guards must be held while the query runs. If any limit denies the
    /// request, every guard taken so far is released and
    /// `RateLimited` is returned.
    pub async fn acquire_rate_limits(
        &self,
        controller: &AdmissionController,
    ) -> Result<Vec<RateLimitGuard>> {
        let mut guards: Vec<RateLimitGuard> = Vec::with_capacity(self.rate_limits.len());
        for params in &self.rate_limits {
            let guard = controller.acquire_with(params).await;
            if !guard.is_allowed() {
                let stats = guard.stats().unwrap_or_default();
                tracing::warn!(
                    rate_limit = %params.rate_limit_name,
                    bucket = %params.bucket,
                    rate = stats.rate,
                    concurrent = stats.concurrent,
                    "request rate limited"
                );
                guard.release().await;
                for held in guards {
                    held.release().await;
                }
                return Err(QueryError::RateLimited {
                    name: params.rate_limit_name.clone(),
                    bucket: params.bucket.clone(),
                    rate: stats.rate,
                    concurrent: stats.concurrent,
                });
            }
            guards.push(guard);
        }
        Ok(guards)
    }
}
