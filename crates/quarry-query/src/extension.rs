//! Project extension: validation and the base project processor.
//!
//! Requests carry a `project` extension naming the projects the query is
//! scoped to, either a single id or a non-empty list of ids:
//!
//! ```json
//! {"project": 1}
//! {"project": [1, 2, 3]}
//! ```

use async_trait::async_trait;
use quarry_state::{RateLimitParameters, RuntimeConfig};
use serde_json::Value;

use crate::error::{QueryError, Result};
use crate::query::{Condition, Expression, Literal, Operator, Query};
use crate::settings::RequestSettings;

/// Name of the per-project rate limit.
pub const PROJECT_RATE_LIMIT_NAME: &str = "project";

const DEFAULT_PER_SECOND_LIMIT: i64 = 1000;
const DEFAULT_CONCURRENT_LIMIT: i64 = 1000;

/// Validated `project` extension data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectExtension {
    pub project_ids: Vec<u64>,
}

impl ProjectExtension {
    /// Validate raw extension data.
    pub fn validate(data: &Value) -> Result<Self> {
        let object = data.as_object().ok_or_else(|| {
            QueryError::ValidationError("project extension must be an object".to_string())
        })?;

        if let Some(extra) = object.keys().find(|k| k.as_str() != "project") {
            return Err(QueryError::ValidationError(format!(
                "unexpected property '{}'",
                extra
            )));
        }

        let project = object
            .get("project")
            .ok_or_else(|| QueryError::ValidationError("'project' is required".to_string()))?;

        let project_ids = match project {
            Value::Array(items) => {
                if items.is_empty() {
                    return Err(QueryError::ValidationError(
                        "'project' must not be an empty list".to_string(),
                    ));
                }
                items
                    .iter()
                    .map(project_id)
                    .collect::<Result<Vec<_>>>()?
            }
            other => vec![project_id(other)?],
        };

        Ok(Self { project_ids })
    }
}

fn project_id(value: &Value) -> Result<u64> {
    match value.as_u64() {
        Some(id) if id >= 1 => Ok(id),
        _ => Err(QueryError::ValidationError(format!(
            "project id must be an integer >= 1, got {}",
            value
        ))),
    }
}

/// Adjusts a query using its validated extension data.
#[async_trait]
pub trait ExtensionQueryProcessor: Send + Sync {
    async fn process_query(
        &self,
        query: &mut Query,
        extension: &ProjectExtension,
        settings: &mut RequestSettings,
    ) -> Result<()>;
}

/// Scopes the query to its projects and applies the project rate limit.
#[derive(Clone)]
pub struct ProjectExtensionProcessor {
    runtime_config: RuntimeConfig,
}

impl ProjectExtensionProcessor {
    pub fn new(runtime_config: RuntimeConfig) -> Self {
        Self { runtime_config }
    }

    /// Rate limit for the first project of the request.
    ///
    /// Global limits come from `project_per_second_limit` and
    /// `project_concurrent_limit`, and can be overridden for a single project
    /// with `project_per_second_limit_{id}` / `project_concurrent_limit_{id}`.
    pub async fn rate_limit_params(&self, project_ids: &[u64]) -> RateLimitParameters {
        let project_id = project_ids.first().copied().unwrap_or(0);
        let per_project_rate = format!("project_per_second_limit_{}", project_id);
        let per_project_concurrent = format!("project_concurrent_limit_{}", project_id);

        let values = self
            .runtime_config
            .get_ints(&[
                "project_per_second_limit",
                "project_concurrent_limit",
                per_project_rate.as_str(),
                per_project_concurrent.as_str(),
            ])
            .await;
        let value = |i: usize| values.get(i).copied().flatten();

        let per_second = value(2)
            .or(value(0))
            .unwrap_or(DEFAULT_PER_SECOND_LIMIT);
        let concurrent = value(3)
            .or(value(1))
            .unwrap_or(DEFAULT_CONCURRENT_LIMIT);

        RateLimitParameters::new(
            PROJECT_RATE_LIMIT_NAME,
            project_id.to_string(),
            Some(per_second.max(0) as f64),
            Some(concurrent.max(0) as u64),
        )
    }
}

#[async_trait]
impl ExtensionQueryProcessor for ProjectExtensionProcessor {
    async fn process_query(
        &self,
        query: &mut Query,
        extension: &ProjectExtension,
        settings: &mut RequestSettings,
    ) -> Result<()> {
        query.add_condition(Condition::new(
            Expression::column("project_id"),
            Operator::In,
            Literal::int_list(extension.project_ids.iter().copied()),
        ));
        settings.add_rate_limit(self.rate_limit_params(&extension.project_ids).await);
        Ok(())
    }
}
