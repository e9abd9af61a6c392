//! State-backed component configuration
//!
//! ## RateLimitConfig
//!
//! Controls the sliding window used by the admission controller:
//!
//! - **max_query_duration_secs**: How far into the future an in-flight request is
//!   scored, i.e. how long it counts as "concurrent" if never released (default: 60s)
//! - **rate_lookback_secs**: Trailing window used to compute the per-second rate (default: 60s)
//! - **rate_history_secs**: How long released requests are kept in a bucket (default: 1h)
//! - **key_prefix**: Prefix of the bucket keys in the state store
//!
//! ## FlagStoreConfig
//!
//! - **key_ttl_secs**: Lifetime of needs-final flags and excluded group ids (default: 12h)
//!
//! ## GateConfig
//!
//! - **max_group_ids_exclude**: Largest exclusion list the read side will inline
//!   before switching to a final read instead (default: 256)

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Window for concurrent request counting (default: 60s)
    #[serde(default = "default_max_query_duration_secs")]
    pub max_query_duration_secs: u64,

    /// Window for determining request rate (default: 60s)
    #[serde(default = "default_rate_lookback_secs")]
    pub rate_lookback_secs: u64,

    /// Amount of time rate history is kept (default: 3600s)
    #[serde(default = "default_rate_history_secs")]
    pub rate_history_secs: u64,

    /// Bucket key prefix (default: "quarry-ratelimit")
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_max_query_duration_secs() -> u64 {
    60
}

fn default_rate_lookback_secs() -> u64 {
    60
}

fn default_rate_history_secs() -> u64 {
    3600
}

fn default_key_prefix() -> String {
    "quarry-ratelimit".to_string()
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_query_duration_secs: default_max_query_duration_secs(),
            rate_lookback_secs: default_rate_lookback_secs(),
            rate_history_secs: default_rate_history_secs(),
            key_prefix: default_key_prefix(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagStoreConfig {
    /// Lifetime of per-project consistency flags (default: 43200s)
    #[serde(default = "default_key_ttl_secs")]
    pub key_ttl_secs: u64,
}

fn default_key_ttl_secs() -> u64 {
    12 * 60 * 60
}

impl Default for FlagStoreConfig {
    fn default() -> Self {
        Self {
            key_ttl_secs: default_key_ttl_secs(),
        }
    }
}

impl FlagStoreConfig {
    pub fn key_ttl(&self) -> Duration {
        Duration::from_secs(self.key_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Maximum number of group ids in a `NOT IN` exclusion (default: 256)
    #[serde(default = "default_max_group_ids_exclude")]
    pub max_group_ids_exclude: usize,
}

fn default_max_group_ids_exclude() -> usize {
    256
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_group_ids_exclude: default_max_group_ids_exclude(),
        }
    }
}
