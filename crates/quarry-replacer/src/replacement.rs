//! The rewrite produced for one mutation event.

use std::collections::BTreeSet;

use crate::error::Result;
use crate::event::MutationKind;
use crate::sql::{QueryArgs, SqlTemplate};

/// Placeholder for the table rows are read from.
pub const READ_TABLE_ARG: &str = "read_table_name";
/// Placeholder for the table rewritten rows are inserted into.
pub const WRITE_TABLE_ARG: &str = "write_table_name";

/// Read-side adjustment to publish once a replacement has been executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryTimeFlag {
    None,
    NeedsFinal { project_id: u64 },
    ExcludeGroups { project_id: u64, group_ids: BTreeSet<u64> },
}

/// Count and insert statements materializing one mutation.
///
/// `query_args` holds fully quoted values. The table names are not part of
/// it: they are supplied by whoever executes the replacement.
#[derive(Debug, Clone, PartialEq)]
pub struct Replacement {
    pub kind: MutationKind,
    pub count_query_template: SqlTemplate,
    pub insert_query_template: SqlTemplate,
    pub query_args: QueryArgs,
    pub query_time_flag: QueryTimeFlag,
}

/// A replacement rendered against concrete tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedReplacement {
    pub count_query: String,
    pub insert_query: String,
}

impl Replacement {
    pub fn render(&self, read_table: &str, write_table: &str) -> Result<RenderedReplacement> {
        let mut args = self.query_args.clone();
        args.insert(READ_TABLE_ARG.to_string(), read_table.to_string());
        args.insert(WRITE_TABLE_ARG.to_string(), write_table.to_string());

        Ok(RenderedReplacement {
            count_query: self.count_query_template.render(&args)?,
            insert_query: self.insert_query_template.render(&args)?,
        })
    }
}
