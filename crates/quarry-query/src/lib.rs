//! Quarry query processing
//!
//! Project-scoped adjustments applied to a query before it runs against the
//! analytical store:
//!
//! - [`ProjectExtension`] validates the `project` request extension.
//! - [`ProjectExtensionProcessor`] scopes the query to its projects and adds
//!   the per-project rate limit to the [`RequestSettings`].
//! - [`ProjectWithGroupsProcessor`] additionally hides rows superseded by
//!   pending replacements, either with a group exclusion or a final read.
//!
//! The query model here is deliberately small: an external query layer owns
//! parsing and execution and exposes only conditions and the final flag.
//!
//! ## Example
//!
//! ```ignore
//! let extension = ProjectExtension::validate(&body["project_ext"])?;
//! let mut settings = RequestSettings::new(false);
//! processor.process_query(&mut query, &extension, &mut settings).await?;
//!
//! let _guards = settings.acquire_rate_limits(&admission).await?;
//! // run the query while holding the guards
//! ```

pub mod error;
pub mod extension;
pub mod gate;
pub mod query;
pub mod settings;

pub use error::{QueryError, Result};
pub use extension::{
    ExtensionQueryProcessor, ProjectExtension, ProjectExtensionProcessor, PROJECT_RATE_LIMIT_NAME,
};
pub use gate::{ProjectWithGroupsProcessor, MAX_GROUP_IDS_EXCLUDE_KEY};
pub use query::{Condition, Expression, Literal, Operator, Query};
pub use settings::RequestSettings;
