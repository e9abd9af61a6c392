//! Replacer and gateway configuration
//!
//! Loaded from a TOML file where every key is optional, then optionally
//! overridden from `QUARRY_*` environment variables. Unparseable environment
//! values are ignored and the file (or default) value is kept.
//!
//! ```toml
//! [replacer]
//! replacements_topic = "event-replacements"
//! max_batch_size = 100
//! read_table = "events_dist"
//! write_table = "events_local"
//!
//! [flags]
//! key_ttl_secs = 43200
//!
//! [gate]
//! max_group_ids_exclude = 256
//! ```

use std::path::Path;
use std::time::Duration;

use quarry_state::{FlagStoreConfig, GateConfig, RateLimitConfig};
use serde::{Deserialize, Serialize};

use crate::error::{ReplacerError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplacerConfig {
    /// Mutation log topic (default: "event-replacements")
    #[serde(default = "default_replacements_topic")]
    pub replacements_topic: String,

    /// Consumer group committing offsets (default: "quarry-replacers")
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Messages per batch before a flush (default: 100)
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Time since the first message of a batch before a flush (default: 2000ms)
    #[serde(default = "default_max_batch_time_ms")]
    pub max_batch_time_ms: u64,

    /// Longest single poll of the log (default: 1000ms)
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Table rows are read from (default: "events_dist")
    #[serde(default = "default_read_table")]
    pub read_table: String,

    /// Table rewritten rows are inserted into (default: "events_local")
    #[serde(default = "default_write_table")]
    pub write_table: String,

    /// Recently applied merge transaction ids remembered for dedup (default: 100)
    #[serde(default = "default_merge_txn_cache_size")]
    pub merge_txn_cache_size: usize,
}

fn default_replacements_topic() -> String {
    "event-replacements".to_string()
}

fn default_consumer_group() -> String {
    "quarry-replacers".to_string()
}

fn default_max_batch_size() -> usize {
    100
}

fn default_max_batch_time_ms() -> u64 {
    2000
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_read_table() -> String {
    "events_dist".to_string()
}

fn default_write_table() -> String {
    "events_local".to_string()
}

fn default_merge_txn_cache_size() -> usize {
    100
}

impl Default for ReplacerConfig {
    fn default() -> Self {
        Self {
            replacements_topic: default_replacements_topic(),
            consumer_group: default_consumer_group(),
            max_batch_size: default_max_batch_size(),
            max_batch_time_ms: default_max_batch_time_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            read_table: default_read_table(),
            write_table: default_write_table(),
            merge_txn_cache_size: default_merge_txn_cache_size(),
        }
    }
}

impl ReplacerConfig {
    pub fn max_batch_time(&self) -> Duration {
        Duration::from_millis(self.max_batch_time_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Complete process configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuarryConfig {
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub flags: FlagStoreConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub replacer: ReplacerConfig,
}

impl QuarryConfig {
    /// Parse a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ReplacerError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
    }

    /// Apply `QUARRY_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(topic) = lookup("QUARRY_REPLACEMENTS_TOPIC") {
            self.replacer.replacements_topic = topic;
        }
        if let Some(group) = lookup("QUARRY_CONSUMER_GROUP") {
            self.replacer.consumer_group = group;
        }
        if let Some(size) = parsed(&lookup, "QUARRY_MAX_BATCH_SIZE") {
            self.replacer.max_batch_size = size;
        }
        if let Some(ms) = parsed(&lookup, "QUARRY_MAX_BATCH_TIME_MS") {
            self.replacer.max_batch_time_ms = ms;
        }
        if let Some(secs) = parsed(&lookup, "QUARRY_KEY_TTL_SECS") {
            self.flags.key_ttl_secs = secs;
        }
        if let Some(max) = parsed(&lookup, "QUARRY_MAX_GROUP_IDS_EXCLUDE") {
            self.gate.max_group_ids_exclude = max;
        }
    }

    /// Reject values that would stall or break the replacer.
    pub fn validate(&self) -> Result<()> {
        if self.replacer.max_batch_size == 0 {
            return Err(ReplacerError::ConfigError(
                "replacer.max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.replacer.read_table.is_empty() || self.replacer.write_table.is_empty() {
            return Err(ReplacerError::ConfigError(
                "replacer.read_table and replacer.write_table must be set".to_string(),
            ));
        }
        if self.flags.key_ttl_secs == 0 {
            return Err(ReplacerError::ConfigError(
                "flags.key_ttl_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parsed<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable override");
            None
        }
    }
}
