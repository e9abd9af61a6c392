//! Dynamic configuration stored in the shared state store.
//!
//! Values are plain strings under `quarry_config:{key}`. Numeric reads that
//! fail to parse, and any read while the store is unavailable, fall back to
//! the caller's default.

use std::sync::Arc;

use quarry_observability::metrics::STATE_STORE_ERRORS_TOTAL;

use crate::error::StateError;
use crate::store::{Pipeline, StateStore};

const CONFIG_PREFIX: &str = "quarry_config";

#[derive(Clone)]
pub struct RuntimeConfig {
    store: Arc<dyn StateStore>,
}

impl RuntimeConfig {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    fn key(key: &str) -> String {
        format!("{}:{}", CONFIG_PREFIX, key)
    }

    fn record_error(operation: &str, key: &str, error: &StateError) {
        tracing::error!(operation = operation, key = %key, error = %error, "runtime config unavailable");
        STATE_STORE_ERRORS_TOTAL
            .with_label_values(&["runtime_config"])
            .inc();
    }

    /// Raw string value of `key`.
    pub async fn get_str(&self, key: &str) -> Option<String> {
        let result = Pipeline::new()
            .get(&Self::key(key))
            .execute(self.store.as_ref())
            .await
            .and_then(|mut replies| replies.remove(0).into_string());
        match result {
            Ok(value) => value,
            Err(e) => {
                Self::record_error("get", key, &e);
                None
            }
        }
    }

    /// Integer value of `key`, or `default` if unset, unparsable or unavailable.
    pub async fn get_int(&self, key: &str, default: i64) -> i64 {
        self.get_str(key)
            .await
            .and_then(|v| parse_int(key, &v))
            .unwrap_or(default)
    }

    /// Integer values of several keys in one round trip.
    pub async fn get_ints(&self, keys: &[&str]) -> Vec<Option<i64>> {
        if keys.is_empty() {
            return Vec::new();
        }

        let mut pipe = Pipeline::new();
        for key in keys {
            pipe = pipe.get(&Self::key(key));
        }

        match pipe.execute(self.store.as_ref()).await {
            Ok(replies) => keys
                .iter()
                .zip(replies)
                .map(|(key, reply)| match reply.into_string() {
                    Ok(value) => value.and_then(|v| parse_int(key, &v)),
                    Err(e) => {
                        Self::record_error("get", key, &e);
                        None
                    }
                })
                .collect(),
            Err(e) => {
                Self::record_error("get_many", &keys.join(","), &e);
                vec![None; keys.len()]
            }
        }
    }

    pub async fn set(&self, key: &str, value: &str) {
        let result = Pipeline::new()
            .set(&Self::key(key), value, None)
            .execute(self.store.as_ref())
            .await;
        if let Err(e) = result {
            Self::record_error("set", key, &e);
        }
    }

    pub async fn delete(&self, key: &str) {
        let result = Pipeline::new()
            .del(&Self::key(key))
            .execute(self.store.as_ref())
            .await;
        if let Err(e) = result {
            Self::record_error("delete", key, &e);
        }
    }
}

fn parse_int(key: &str, value: &str) -> Option<i64> {
    match value.trim().parse::<i64>() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(key = %key, value = %value, "non-numeric runtime config value");
            None
        }
    }
}
