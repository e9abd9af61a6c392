//! Dataset schema capability used by the translator.
//!
//! The translator never hardcodes a column list: it asks the dataset for the
//! ordered list of columns to copy through an insert, and for the physical
//! column (if any) a tag has been promoted to.

use std::collections::HashMap;

/// Column layout of a dataset's events table.
pub trait DatasetSchema: Send + Sync {
    /// Every column, flattened (`tags.key`), in table order.
    fn all_columns(&self) -> &[String];

    /// Columns that must be present on every row, in table order.
    fn required_columns(&self) -> &[String];

    /// Physical column a tag has been promoted to, if any.
    fn promoted_column(&self, tag: &str) -> Option<&str>;
}

const REQUIRED_COLUMNS: &[&str] = &[
    "event_id",
    "project_id",
    "group_id",
    "timestamp",
    "deleted",
    "retention_days",
];

const COMMON_COLUMNS: &[&str] = &[
    "platform",
    "message",
    "primary_hash",
    "received",
    "search_message",
    "title",
    "location",
    "user_id",
    "username",
    "email",
    "ip_address",
    "geo_country_code",
    "geo_region",
    "geo_city",
    "sdk_name",
    "sdk_version",
    "type",
    "version",
];

const METADATA_COLUMNS: &[&str] = &["offset", "partition"];

const PROMOTED_CONTEXT_COLUMNS: &[&str] = &[
    "os_build",
    "os_kernel_version",
    "device_name",
    "device_brand",
    "device_locale",
    "device_uuid",
    "device_model_id",
    "device_arch",
    "device_battery_level",
    "device_orientation",
    "device_simulator",
    "device_online",
    "device_charging",
];

/// Tags stored verbatim in a column of the same name.
const PROMOTED_TAG_COLUMNS: &[&str] = &[
    "level",
    "logger",
    "server_name",
    "transaction",
    "environment",
    "sentry:release",
    "sentry:dist",
    "sentry:user",
    "site",
    "url",
];

/// Context-like tags, stored with `.` replaced by `_`.
const PROMOTED_CONTEXT_TAG_COLUMNS: &[&str] = &[
    "app_device",
    "device",
    "device_family",
    "runtime",
    "runtime_name",
    "browser",
    "browser_name",
    "os",
    "os_name",
    "os_rooted",
];

const TRAILING_COLUMNS: &[&str] = &[
    "tags.key",
    "tags.value",
    "contexts.key",
    "contexts.value",
    "http_method",
    "http_referer",
    "exception_stacks.type",
    "exception_stacks.value",
    "exception_stacks.mechanism_type",
    "exception_stacks.mechanism_handled",
    "exception_frames.abs_path",
    "exception_frames.filename",
    "exception_frames.package",
    "exception_frames.module",
    "exception_frames.function",
    "exception_frames.in_app",
    "exception_frames.colno",
    "exception_frames.lineno",
    "exception_frames.stack_level",
    "culprit",
    "sdk_integrations",
    "modules.name",
    "modules.version",
];

/// Error events table layout.
#[derive(Debug, Clone)]
pub struct EventsSchema {
    all_columns: Vec<String>,
    required_columns: Vec<String>,
    promoted_tags: HashMap<String, String>,
}

impl Default for EventsSchema {
    fn default() -> Self {
        Self::new()
    }
}

impl EventsSchema {
    pub fn new() -> Self {
        let all_columns = [
            REQUIRED_COLUMNS,
            COMMON_COLUMNS,
            METADATA_COLUMNS,
            PROMOTED_CONTEXT_COLUMNS,
            PROMOTED_TAG_COLUMNS,
            PROMOTED_CONTEXT_TAG_COLUMNS,
            TRAILING_COLUMNS,
        ]
        .iter()
        .flat_map(|group| group.iter())
        .map(|c| c.to_string())
        .collect();

        let promoted_tags = PROMOTED_TAG_COLUMNS
            .iter()
            .map(|c| (c.to_string(), c.to_string()))
            .chain(
                PROMOTED_CONTEXT_TAG_COLUMNS
                    .iter()
                    .map(|c| (c.replace('_', "."), c.to_string())),
            )
            .collect();

        Self {
            all_columns,
            required_columns: REQUIRED_COLUMNS.iter().map(|c| c.to_string()).collect(),
            promoted_tags,
        }
    }
}

impl DatasetSchema for EventsSchema {
    fn all_columns(&self) -> &[String] {
        &self.all_columns
    }

    fn required_columns(&self) -> &[String] {
        &self.required_columns
    }

    fn promoted_column(&self, tag: &str) -> Option<&str> {
        self.promoted_tags.get(tag).map(String::as_str)
    }
}
