//! Mutation event to replacement translation
//!
//! Each mutation becomes an `INSERT ... SELECT` that copies the affected rows
//! back into the table with their new values. The table keeps the newest
//! version of a row on merge, so the copy supersedes the original. A
//! matching `SELECT count()` lets the worker skip mutations that touch nothing.
//!
//! Every statement is bounded by `received <= cutoff AND NOT deleted`: rows
//! written after the mutation was issued are left alone, and a row that has
//! already been rewritten into a deleted state no longer matches, which is
//! what makes re-applying a replacement harmless.
//!
//! | Mutation | Extra predicate | Rewritten columns | Flag |
//! |---|---|---|---|
//! | delete groups | `group_id IN (ids)` | `deleted = 1` | exclude groups |
//! | merge | `group_id IN (previous)` | `group_id = new` | exclude groups |
//! | unmerge | `group_id = previous AND primary_hash IN (hashes)` | `group_id = new` | needs final |
//! | delete tag | `col IS NOT NULL` or `has(tags.key, tag)` | promoted column NULL, tag pair dropped | needs final |

use std::collections::BTreeSet;
use std::sync::Arc;

use md5::{Digest, Md5};

use crate::error::{ReplacerError, Result};
use crate::event::{DeleteGroups, DeleteTag, Merge, MutationEvent, MutationKind, Unmerge};
use crate::replacement::{QueryTimeFlag, Replacement};
use crate::schema::DatasetSchema;
use crate::sql::{
    escape_identifier, escape_string, format_datetime, join_ints, join_strings, QueryArgs,
    SqlTemplate,
};

const COUNT_PREFIX: &str = "SELECT count() FROM %(read_table_name)s FINAL WHERE ";
const CUTOFF_PREDICATE: &str =
    "received <= CAST('%(timestamp)s' AS DateTime) AND NOT deleted";

const TAGS_KEY_COLUMN: &str = "tags.key";
const TAGS_VALUE_COLUMN: &str = "tags.value";

fn insert_prefix(columns_arg: &str) -> String {
    format!(
        "INSERT INTO %(write_table_name)s (%({})s) SELECT %(select_columns)s FROM %(read_table_name)s FINAL WHERE ",
        columns_arg
    )
}

fn column_list<'a, I>(columns: I) -> String
where
    I: IntoIterator<Item = &'a String>,
{
    columns
        .into_iter()
        .map(|c| escape_identifier(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Hashes that are not already a 32 character hex digest are stored as the
/// MD5 of their value.
pub fn normalize_hash(hash: &str) -> String {
    if hash.len() == 32 && hash.chars().all(|c| c.is_ascii_hexdigit()) {
        hash.to_string()
    } else {
        hex::encode(Md5::digest(hash.as_bytes()))
    }
}

/// Maps mutation events onto replacements for one dataset.
#[derive(Clone)]
pub struct ReplacementTranslator {
    schema: Arc<dyn DatasetSchema>,
}

impl ReplacementTranslator {
    pub fn new(schema: Arc<dyn DatasetSchema>) -> Self {
        Self { schema }
    }

    pub fn translate(&self, event: &MutationEvent) -> Result<Replacement> {
        match event {
            MutationEvent::EndDeleteGroups(e) => self.delete_groups(e),
            MutationEvent::EndMerge(e) => self.merge(e),
            MutationEvent::EndUnmerge(e) => self.unmerge(e),
            MutationEvent::EndDeleteTag(e) => self.delete_tag(e),
        }
    }

    fn build(
        kind: MutationKind,
        columns_arg: &str,
        where_clause: &str,
        query_args: QueryArgs,
        query_time_flag: QueryTimeFlag,
    ) -> Replacement {
        Replacement {
            kind,
            count_query_template: SqlTemplate::new(format!("{}{}", COUNT_PREFIX, where_clause)),
            insert_query_template: SqlTemplate::new(format!(
                "{}{}",
                insert_prefix(columns_arg),
                where_clause
            )),
            query_args,
            query_time_flag,
        }
    }

    /// Every column copied through, with `group_id` replaced by `new_group_id`.
    fn regroup_select(&self, new_group_id: u64) -> String {
        self.schema
            .all_columns()
            .iter()
            .map(|c| {
                if c == "group_id" {
                    new_group_id.to_string()
                } else {
                    escape_identifier(c)
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn delete_groups(&self, event: &DeleteGroups) -> Result<Replacement> {
        if event.group_ids.is_empty() {
            return Err(ReplacerError::TranslationError(format!(
                "delete_groups for project {} has no group ids",
                event.project_id
            )));
        }

        let required = self.schema.required_columns();
        let select_columns = required
            .iter()
            .map(|c| {
                if c == "deleted" {
                    "1".to_string()
                } else {
                    escape_identifier(c)
                }
            })
            .collect::<Vec<_>>()
            .join(", ");

        let where_clause = format!(
            "project_id = %(project_id)s AND group_id IN (%(group_ids)s) AND {}",
            CUTOFF_PREDICATE
        );
        let query_args = QueryArgs::from([
            ("required_columns".to_string(), column_list(required)),
            ("select_columns".to_string(), select_columns),
            ("project_id".to_string(), event.project_id.to_string()),
            ("group_ids".to_string(), join_ints(&event.group_ids)),
            (
                "timestamp".to_string(),
                format_datetime(&event.cutoff_timestamp),
            ),
        ]);

        Ok(Self::build(
            MutationKind::DeleteGroups,
            "required_columns",
            &where_clause,
            query_args,
            QueryTimeFlag::ExcludeGroups {
                project_id: event.project_id,
                group_ids: event.group_ids.clone(),
            },
        ))
    }

    fn merge(&self, event: &Merge) -> Result<Replacement> {
        if event.previous_group_ids.is_empty() {
            return Err(ReplacerError::TranslationError(format!(
                "merge into group {} for project {} has no previous group ids",
                event.new_group_id, event.project_id
            )));
        }

        let where_clause = format!(
            "project_id = %(project_id)s AND group_id IN (%(previous_group_ids)s) AND {}",
            CUTOFF_PREDICATE
        );
        let query_args = QueryArgs::from([
            (
                "all_columns".to_string(),
                column_list(self.schema.all_columns()),
            ),
            (
                "select_columns".to_string(),
                self.regroup_select(event.new_group_id),
            ),
            ("project_id".to_string(), event.project_id.to_string()),
            (
                "previous_group_ids".to_string(),
                join_ints(&event.previous_group_ids),
            ),
            (
                "timestamp".to_string(),
                format_datetime(&event.cutoff_timestamp),
            ),
        ]);

        Ok(Self::build(
            MutationKind::Merge,
            "all_columns",
            &where_clause,
            query_args,
            QueryTimeFlag::ExcludeGroups {
                project_id: event.project_id,
                group_ids: event.previous_group_ids.iter().copied().collect::<BTreeSet<_>>(),
            },
        ))
    }

    fn unmerge(&self, event: &Unmerge) -> Result<Replacement> {
        if event.hashes.is_empty() {
            return Err(ReplacerError::TranslationError(format!(
                "unmerge of group {} for project {} has no hashes",
                event.previous_group_id, event.project_id
            )));
        }

        let hashes: Vec<String> = event.hashes.iter().map(|h| normalize_hash(h)).collect();
        let where_clause = format!(
            "project_id = %(project_id)s AND group_id = %(previous_group_id)s AND primary_hash IN (%(hashes)s) AND {}",
            CUTOFF_PREDICATE
        );
        let query_args = QueryArgs::from([
            (
                "all_columns".to_string(),
                column_list(self.schema.all_columns()),
            ),
            (
                "select_columns".to_string(),
                self.regroup_select(event.new_group_id),
            ),
            ("project_id".to_string(), event.project_id.to_string()),
            (
                "previous_group_id".to_string(),
                event.previous_group_id.to_string(),
            ),
            ("hashes".to_string(), join_strings(&hashes)),
            (
                "timestamp".to_string(),
                format_datetime(&event.cutoff_timestamp),
            ),
        ]);

        Ok(Self::build(
            MutationKind::Unmerge,
            "all_columns",
            &where_clause,
            query_args,
            QueryTimeFlag::NeedsFinal {
                project_id: event.project_id,
            },
        ))
    }

    fn delete_tag(&self, event: &DeleteTag) -> Result<Replacement> {
        if event.tag_name.is_empty() {
            return Err(ReplacerError::TranslationError(format!(
                "delete_tag for project {} has an empty tag",
                event.project_id
            )));
        }

        let tag = escape_string(&event.tag_name);
        let promoted = self.schema.promoted_column(&event.tag_name);

        let tag_predicate = if promoted.is_some() {
            "%(tag_column)s IS NOT NULL"
        } else {
            "has(`tags.key`, %(tag_str)s)"
        };
        let where_clause = format!(
            "project_id = %(project_id)s AND {} AND {}",
            CUTOFF_PREDICATE, tag_predicate
        );

        // The tag pair is dropped from the arrays whether or not it is promoted.
        let select_columns = self
            .schema
            .all_columns()
            .iter()
            .map(|c| {
                if Some(c.as_str()) == promoted {
                    "NULL".to_string()
                } else if c == TAGS_KEY_COLUMN {
                    format!(
                        "arrayFilter(x -> (indexOf(`tags.key`, x) != indexOf(`tags.key`, {})), `tags.key`)",
                        tag
                    )
                } else if c == TAGS_VALUE_COLUMN {
                    format!(
                        "arrayMap(x -> arrayElement(`tags.value`, x), arrayFilter(x -> x != indexOf(`tags.key`, {}), arrayEnumerate(`tags.value`)))",
                        tag
                    )
                } else {
                    escape_identifier(c)
                }
            })
            .collect::<Vec<_>>()
            .join(", ");

        let mut query_args = QueryArgs::from([
            (
                "all_columns".to_string(),
                column_list(self.schema.all_columns()),
            ),
            ("select_columns".to_string(), select_columns),
            ("project_id".to_string(), event.project_id.to_string()),
            ("tag_str".to_string(), tag.clone()),
            (
                "timestamp".to_string(),
                format_datetime(&event.cutoff_timestamp),
            ),
        ]);
        if let Some(column) = promoted {
            query_args.insert("tag_column".to_string(), escape_identifier(column));
        }

        Ok(Self::build(
            MutationKind::DeleteTag,
            "all_columns",
            &where_clause,
            query_args,
            QueryTimeFlag::NeedsFinal {
                project_id: event.project_id,
            },
        ))
    }
}

impl std::fmt::Debug for ReplacementTranslator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplacementTranslator")
            .field("columns", &self.schema.all_columns().len())
            .finish()
    }
}
