//! End-to-end replacement tests against an in-memory events table
//!
//! The table below understands exactly the SQL the translator emits and the
//! conditions the read side adds, and models a replacing merge table whose
//! version column is `deleted`:
//! - every insert appends rows
//! - a `FINAL` read keeps one row per `(project_id, event_id)`: the highest
//!   `deleted`, then the most recently inserted
//! - a plain read sees every row, superseded versions included
//!
//! Scenarios:
//! 1. Group deletion, seen through final reads, plain reads and the gate
//! 2. Re-applying a replacement changes nothing
//! 3. Rows received after the cutoff are left alone
//! 4. Merge and unmerge
//! 5. Promoted and unpromoted tag deletion
//! 6. A poison message halts the replacer with nothing committed

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quarry_query::{
    Condition, Expression, ExtensionQueryProcessor, Literal, Operator, ProjectExtension,
    ProjectWithGroupsProcessor, Query, RequestSettings,
};
use quarry_replacer::{
    AnalyticsStore, BatchingConsumer, DatasetSchema, MemoryLogConsumer, ReplacementTranslator,
    ReplacerConfig, ReplacerError, ReplacerWorker, Result, TopicPartition,
};
use quarry_state::{ConsistencyFlagStore, FlagStoreConfig, GateConfig, MemoryStateStore, RuntimeConfig};
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};

const TOPIC: &str = "event-replacements";
const READ_TABLE: &str = "events_ro";
const WRITE_TABLE: &str = "events_rw";
const CUTOFF: &str = "2024-03-01T12:00:00.000000Z";
const BEFORE_CUTOFF: &str = "2024-03-01 11:00:00";
const AFTER_CUTOFF: &str = "2024-03-01 13:00:00";

// ---------------------------------------------------------------
// Schema
// ---------------------------------------------------------------

struct TestSchema {
    all: Vec<String>,
    required: Vec<String>,
    promoted: HashMap<String, String>,
}

impl TestSchema {
    fn new() -> Self {
        let all: Vec<String> = [
            "event_id",
            "project_id",
            "group_id",
            "timestamp",
            "deleted",
            "retention_days",
            "primary_hash",
            "received",
            "sentry:user",
            "browser_name",
            "tags.key",
            "tags.value",
        ]
        .iter()
        .map(|c| c.to_string())
        .collect();
        Self {
            required: all[..6].to_vec(),
            all,
            promoted: HashMap::from([
                ("sentry:user".to_string(), "sentry:user".to_string()),
                ("browser.name".to_string(), "browser_name".to_string()),
            ]),
        }
    }
}

impl DatasetSchema for TestSchema {
    fn all_columns(&self) -> &[String] {
        &self.all
    }

    fn required_columns(&self) -> &[String] {
        &self.required
    }

    fn promoted_column(&self, tag: &str) -> Option<&str> {
        self.promoted.get(tag).map(String::as_str)
    }
}

// ---------------------------------------------------------------
// In-memory events table
// ---------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Cell {
    Int(i64),
    Str(String),
    Array(Vec<String>),
    Null,
}

impl Cell {
    fn as_int(&self) -> i64 {
        match self {
            Cell::Int(v) => *v,
            _ => 0,
        }
    }

    fn as_array(&self) -> Vec<String> {
        match self {
            Cell::Array(items) => items.clone(),
            _ => Vec::new(),
        }
    }
}

type Row = BTreeMap<String, Cell>;

#[derive(Default)]
struct EventsTable {
    rows: Mutex<Vec<Row>>,
    statements: Mutex<Vec<String>>,
}

struct Event<'a> {
    event_id: &'a str,
    project_id: i64,
    group_id: i64,
    primary_hash: &'a str,
    received: &'a str,
    tags: &'a [(&'a str, &'a str)],
}

impl<'a> Event<'a> {
    fn new(event_id: &'a str, project_id: i64, group_id: i64) -> Self {
        Self {
            event_id,
            project_id,
            group_id,
            primary_hash: "00000000000000000000000000000000",
            received: BEFORE_CUTOFF,
            tags: &[],
        }
    }
}

fn unquote_identifier(name: &str) -> String {
    name.trim()
        .trim_start_matches('`')
        .trim_end_matches('`')
        .to_string()
}

fn parse_literal(text: &str) -> Cell {
    let text = text.trim();
    if text == "NULL" {
        return Cell::Null;
    }
    if let Ok(v) = text.parse::<i64>() {
        return Cell::Int(v);
    }
    let inner = text
        .strip_prefix('\'')
        .and_then(|t| t.strip_suffix('\''))
        .unwrap_or_else(|| panic!("not a literal: {}", text));
    let mut out = String::new();
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            out.extend(chars.next());
        } else {
            out.push(c);
        }
    }
    Cell::Str(out)
}

/// Split on top-level commas, outside parentheses and quotes.
fn split_top_level(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0;
    let mut in_quote = false;
    let mut escaped = false;
    for c in text.chars() {
        if in_quote {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '\'' {
                in_quote = false;
            }
            continue;
        }
        match c {
            '\'' => {
                in_quote = true;
                current.push(c);
            }
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

fn parse_list(text: &str) -> Vec<Cell> {
    let inner = text
        .trim()
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
        .unwrap_or_else(|| panic!("not a list: {}", text));
    split_top_level(inner).iter().map(|v| parse_literal(v)).collect()
}

/// First quoted literal inside an expression.
fn embedded_literal(expr: &str) -> String {
    let start = expr.find('\'').unwrap_or_else(|| panic!("no literal in {}", expr));
    let rest = &expr[start..];
    let mut end = 1;
    let bytes = rest.as_bytes();
    while end < bytes.len() {
        if bytes[end] == b'\\' {
            end += 2;
            continue;
        }
        if bytes[end] == b'\'' {
            break;
        }
        end += 1;
    }
    match parse_literal(&rest[..=end]) {
        Cell::Str(s) => s,
        other => panic!("unexpected literal {:?}", other),
    }
}

/// 1-based position of the first occurrence, 0 if absent.
fn index_of(items: &[String], value: &str) -> usize {
    items.iter().position(|i| i == value).map(|p| p + 1).unwrap_or(0)
}

fn matches(row: &Row, condition: &str) -> bool {
    let cell = |name: &str| row.get(&unquote_identifier(name)).cloned().unwrap_or(Cell::Null);

    if condition == "NOT deleted" {
        return cell("deleted").as_int() == 0;
    }
    if let Some(column) = condition.strip_suffix(" IS NOT NULL") {
        return cell(column) != Cell::Null;
    }
    if condition.starts_with("has(`tags.key`, ") {
        let tag = embedded_literal(condition);
        return cell("tags.key").as_array().contains(&tag);
    }
    if let Some((lhs, list)) = condition.split_once(" NOT IN ") {
        let lhs = lhs
            .strip_prefix("assumeNotNull(")
            .and_then(|l| l.strip_suffix(')'))
            .unwrap_or(lhs);
        return !parse_list(list).contains(&cell(lhs));
    }
    if let Some((lhs, list)) = condition.split_once(" IN ") {
        return parse_list(list).contains(&cell(lhs));
    }
    if let Some((lhs, _)) = condition.split_once(" <= CAST(") {
        let cutoff = embedded_literal(condition);
        return match cell(lhs) {
            Cell::Str(received) => received <= cutoff,
            _ => false,
        };
    }
    if let Some((lhs, rhs)) = condition.split_once(" = ") {
        return cell(lhs) == parse_literal(rhs);
    }
    panic!("unsupported condition: {}", condition)
}

fn evaluate(row: &Row, expr: &str) -> Cell {
    if expr.starts_with("arrayFilter(") {
        let tag = embedded_literal(expr);
        let keys = row["tags.key"].as_array();
        let target = index_of(&keys, &tag);
        return Cell::Array(
            keys.iter()
                .filter(|k| index_of(&keys, k) != target)
                .cloned()
                .collect(),
        );
    }
    if expr.starts_with("arrayMap(") {
        let tag = embedded_literal(expr);
        let target = index_of(&row["tags.key"].as_array(), &tag);
        return Cell::Array(
            row["tags.value"]
                .as_array()
                .into_iter()
                .enumerate()
                .filter(|(i, _)| i + 1 != target)
                .map(|(_, v)| v)
                .collect(),
        );
    }
    match parse_literal_or_column(expr) {
        Ok(literal) => literal,
        Err(column) => row.get(&column).cloned().unwrap_or(Cell::Null),
    }
}

fn parse_literal_or_column(expr: &str) -> std::result::Result<Cell, String> {
    if expr == "NULL" || expr.parse::<i64>().is_ok() || expr.starts_with('\'') {
        Ok(parse_literal(expr))
    } else {
        Err(unquote_identifier(expr))
    }
}

fn between<'a>(text: &'a str, start: &str, end: &str) -> (&'a str, &'a str) {
    let from = text
        .find(start)
        .unwrap_or_else(|| panic!("missing {:?} in {}", start, text))
        + start.len();
    let rest = &text[from..];
    let to = rest
        .find(end)
        .unwrap_or_else(|| panic!("missing {:?} in {}", end, text));
    (&rest[..to], &rest[to + end.len()..])
}

impl EventsTable {
    async fn insert(&self, event: Event<'_>) {
        let (keys, values): (Vec<_>, Vec<_>) = event
            .tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .unzip();
        let tag = |name: &str| {
            event
                .tags
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| Cell::Str(v.to_string()))
                .unwrap_or(Cell::Null)
        };
        let row = Row::from([
            ("event_id".to_string(), Cell::Str(event.event_id.to_string())),
            ("project_id".to_string(), Cell::Int(event.project_id)),
            ("group_id".to_string(), Cell::Int(event.group_id)),
            ("timestamp".to_string(), Cell::Str(BEFORE_CUTOFF.to_string())),
            ("deleted".to_string(), Cell::Int(0)),
            ("retention_days".to_string(), Cell::Int(90)),
            ("primary_hash".to_string(), Cell::Str(event.primary_hash.to_string())),
            ("received".to_string(), Cell::Str(event.received.to_string())),
            ("sentry:user".to_string(), tag("sentry:user")),
            ("browser_name".to_string(), tag("browser.name")),
            ("tags.key".to_string(), Cell::Array(keys)),
            ("tags.value".to_string(), Cell::Array(values)),
        ]);
        self.rows.lock().await.push(row);
    }

    async fn row_count(&self) -> usize {
        self.rows.lock().await.len()
    }

    fn final_view(rows: &[Row]) -> Vec<Row> {
        let mut latest: BTreeMap<(i64, String), Row> = BTreeMap::new();
        for row in rows {
            let key = (
                row["project_id"].as_int(),
                match &row["event_id"] {
                    Cell::Str(s) => s.clone(),
                    other => format!("{:?}", other),
                },
            );
            let replace = latest
                .get(&key)
                .map(|current| row["deleted"].as_int() >= current["deleted"].as_int())
                .unwrap_or(true);
            if replace {
                latest.insert(key, row.clone());
            }
        }
        latest.into_values().collect()
    }

    fn select(rows: &[Row], use_final: bool, where_clause: &str) -> Vec<Row> {
        let source = if use_final {
            Self::final_view(rows)
        } else {
            rows.to_vec()
        };
        let conditions: Vec<&str> = where_clause.split(" AND ").collect();
        source
            .into_iter()
            .filter(|row| conditions.iter().all(|c| matches(row, c)))
            .collect()
    }

    /// Rows a project query sees, as the query layer would run it.
    async fn query(&self, query: &Query) -> Vec<Row> {
        let mut query = query.clone();
        query.add_condition(Condition::new(
            Expression::column("deleted"),
            Operator::Eq,
            Literal::Int(0),
        ));
        let where_clause = query.where_clause().unwrap_or_default();
        Self::select(&self.rows.lock().await, query.is_final(), &where_clause)
    }

    /// Event ids a query sees, sorted, duplicates kept.
    async fn query_event_ids(&self, query: &Query) -> Vec<String> {
        let mut ids: Vec<String> = self
            .query(query)
            .await
            .into_iter()
            .map(|row| match &row["event_id"] {
                Cell::Str(s) => s.clone(),
                other => format!("{:?}", other),
            })
            .collect();
        ids.sort();
        ids
    }

    async fn final_row(&self, event_id: &str) -> Row {
        Self::final_view(&self.rows.lock().await)
            .into_iter()
            .find(|row| row["event_id"] == Cell::Str(event_id.to_string()))
            .unwrap_or_else(|| panic!("no row for {}", event_id))
    }
}

#[async_trait]
impl AnalyticsStore for EventsTable {
    async fn execute(&self, sql: &str) -> Result<Vec<Vec<Value>>> {
        self.statements.lock().await.push(sql.to_string());
        let mut rows = self.rows.lock().await;

        if let Some(rest) = sql.strip_prefix("SELECT count() FROM ") {
            let (table, where_clause) = between(rest, "", " FINAL WHERE ");
            assert_eq!(table, READ_TABLE);
            let count = Self::select(&rows, true, where_clause).len();
            return Ok(vec![vec![json!(count)]]);
        }

        if let Some(rest) = sql.strip_prefix("INSERT INTO ") {
            let (table, rest) = between(rest, "", " (");
            assert_eq!(table, WRITE_TABLE);
            let (columns, rest) = between(rest, "", ") SELECT ");
            let (exprs, rest) = between(rest, "", " FROM ");
            let (table, where_clause) = between(rest, "", " FINAL WHERE ");
            assert_eq!(table, READ_TABLE);

            let columns: Vec<String> = split_top_level(columns)
                .iter()
                .map(|c| unquote_identifier(c))
                .collect();
            let exprs = split_top_level(exprs);
            assert_eq!(columns.len(), exprs.len(), "column and select lists differ");

            let new_rows: Vec<Row> = Self::select(&rows, true, where_clause)
                .iter()
                .map(|row| {
                    columns
                        .iter()
                        .zip(&exprs)
                        .map(|(column, expr)| (column.clone(), evaluate(row, expr)))
                        .collect()
                })
                .collect();
            rows.extend(new_rows);
            return Ok(vec![]);
        }

        Err(ReplacerError::StoreExecutionError(format!(
            "unsupported statement: {}",
            sql
        )))
    }
}

// ---------------------------------------------------------------
// Harness
// ---------------------------------------------------------------

struct Harness {
    table: Arc<EventsTable>,
    flags: ConsistencyFlagStore,
    gate: ProjectWithGroupsProcessor,
}

fn harness() -> Harness {
    let state = Arc::new(MemoryStateStore::new());
    let flags = ConsistencyFlagStore::new(state.clone(), FlagStoreConfig::default());
    Harness {
        table: Arc::new(EventsTable::default()),
        gate: ProjectWithGroupsProcessor::new(
            flags.clone(),
            RuntimeConfig::new(state),
            GateConfig::default(),
        ),
        flags,
    }
}

impl Harness {
    /// Publish messages to a fresh log and run the replacer over it until
    /// they are all consumed.
    async fn run_replacer(&self, messages: Vec<Value>) -> (MemoryLogConsumer, Result<()>) {
        let log = MemoryLogConsumer::new();
        for message in messages {
            log.push(TOPIC, 0, serde_json::to_vec(&message).unwrap())
                .await;
        }

        let config = ReplacerConfig {
            read_table: READ_TABLE.to_string(),
            write_table: WRITE_TABLE.to_string(),
            max_batch_size: 10,
            max_batch_time_ms: 50,
            poll_timeout_ms: 10,
            ..Default::default()
        };
        let worker = ReplacerWorker::new(
            self.table.clone(),
            self.flags.clone(),
            ReplacementTranslator::new(Arc::new(TestSchema::new())),
            &config,
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(BatchingConsumer::new(log.clone(), worker, &config).run(rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let _ = tx.send(true);
        let result = handle.await.unwrap();
        (log, result)
    }

    async fn replace(&self, messages: Vec<Value>) -> MemoryLogConsumer {
        let (log, result) = self.run_replacer(messages).await;
        result.unwrap();
        log
    }

    /// A project query after the read-side gate.
    async fn gated_query(&self, project_ids: Vec<u64>) -> Query {
        let mut query = Query::new();
        let mut settings = RequestSettings::new(false);
        self.gate
            .process_query(&mut query, &ProjectExtension { project_ids }, &mut settings)
            .await
            .unwrap();
        query
    }
}

fn plain_query(project_id: u64) -> Query {
    let mut query = Query::new();
    query.add_condition(Condition::new(
        Expression::column("project_id"),
        Operator::In,
        Literal::int_list([project_id]),
    ));
    query
}

fn final_query(project_id: u64) -> Query {
    let mut query = plain_query(project_id);
    query.set_final(true);
    query
}

fn delete_groups(project_id: u64, group_ids: &[u64]) -> Value {
    json!([2, "end_delete_groups", {
        "project_id": project_id,
        "group_ids": group_ids,
        "datetime": CUTOFF,
    }])
}

fn delete_tag(project_id: u64, tag: &str) -> Value {
    json!([2, "end_delete_tag", {
        "project_id": project_id,
        "tag": tag,
        "datetime": CUTOFF,
    }])
}

fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn strings(cell: &Cell) -> Vec<String> {
    cell.as_array()
}

// ---------------------------------------------------------------
// Group deletion
// ---------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_delete_groups_end_to_end() {
    let h = harness();
    h.table.insert(Event::new("e1", 1, 1)).await;
    h.table.insert(Event::new("e2", 1, 2)).await;
    h.table.insert(Event::new("e3", 1, 3)).await;
    h.table.insert(Event::new("e4", 2, 1)).await;

    let log = h.replace(vec![delete_groups(1, &[1, 2])]).await;

    // Merged view is exact.
    assert_eq!(h.table.query_event_ids(&final_query(1)).await, ids(&["e3"]));
    // Before the merge, a plain read still sees the superseded rows.
    assert_eq!(
        h.table.query_event_ids(&plain_query(1)).await,
        ids(&["e1", "e2", "e3"])
    );
    // The gate hides them.
    let gated = h.gated_query(vec![1]).await;
    assert!(!gated.is_final());
    assert_eq!(h.table.query_event_ids(&gated).await, ids(&["e3"]));

    // Other projects are untouched.
    assert_eq!(h.table.query_event_ids(&final_query(2)).await, ids(&["e4"]));
    assert!(h.flags.get_excluded_groups(2).await.is_empty());

    assert_eq!(
        log.committed().await,
        BTreeMap::from([(TopicPartition::new(TOPIC, 0), 1)])
    );
}

#[tokio::test(start_paused = true)]
async fn test_reapplying_replacement_is_a_no_op() {
    let h = harness();
    h.table.insert(Event::new("e1", 1, 1)).await;
    h.table.insert(Event::new("e2", 1, 2)).await;

    h.replace(vec![delete_groups(1, &[1])]).await;
    let rows_after_first = h.table.row_count().await;
    let final_after_first = h.table.query_event_ids(&final_query(1)).await;

    // Redelivery of the same mutation.
    h.replace(vec![delete_groups(1, &[1])]).await;

    assert_eq!(rows_after_first, 3);
    assert_eq!(h.table.row_count().await, rows_after_first);
    assert_eq!(h.table.query_event_ids(&final_query(1)).await, final_after_first);

    let inserts = h
        .table
        .statements
        .lock()
        .await
        .iter()
        .filter(|s| s.starts_with("INSERT"))
        .count();
    assert_eq!(inserts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_rows_after_cutoff_are_kept() {
    let h = harness();
    h.table.insert(Event::new("early", 1, 1)).await;
    h.table
        .insert(Event {
            received: AFTER_CUTOFF,
            ..Event::new("late", 1, 1)
        })
        .await;

    h.replace(vec![delete_groups(1, &[1])]).await;

    assert_eq!(h.table.query_event_ids(&final_query(1)).await, ids(&["late"]));
}

// ---------------------------------------------------------------
// Merge and unmerge
// ---------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_merge_moves_rows_to_new_group() {
    let h = harness();
    h.table.insert(Event::new("e1", 1, 1)).await;
    h.table.insert(Event::new("e2", 1, 2)).await;
    h.table.insert(Event::new("e3", 1, 5)).await;

    h.replace(vec![json!([2, "end_merge", {
        "project_id": 1,
        "previous_group_ids": [1, 2],
        "new_group_id": 3,
        "datetime": CUTOFF,
    }])])
    .await;

    for event_id in ["e1", "e2"] {
        assert_eq!(h.table.final_row(event_id).await["group_id"], Cell::Int(3));
    }
    assert_eq!(h.table.final_row("e3").await["group_id"], Cell::Int(5));

    // The gate hides the old versions in groups 1 and 2.
    let gated = h.gated_query(vec![1]).await;
    let visible = h.table.query(&gated).await;
    assert_eq!(visible.len(), 3);
    assert!(visible.iter().all(|row| row["group_id"] != Cell::Int(1)
        && row["group_id"] != Cell::Int(2)));
    assert_eq!(
        h.flags.get_excluded_groups(1).await,
        BTreeSet::from([1, 2])
    );
}

#[tokio::test(start_paused = true)]
async fn test_unmerge_moves_matching_hashes() {
    let h = harness();
    let moved = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    let kept = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    h.table
        .insert(Event {
            primary_hash: moved,
            ..Event::new("e1", 1, 1)
        })
        .await;
    h.table
        .insert(Event {
            primary_hash: kept,
            ..Event::new("e2", 1, 1)
        })
        .await;

    h.replace(vec![json!([2, "end_unmerge", {
        "project_id": 1,
        "previous_group_id": 1,
        "new_group_id": 2,
        "hashes": [moved],
        "datetime": CUTOFF,
    }])])
    .await;

    assert_eq!(h.table.final_row("e1").await["group_id"], Cell::Int(2));
    assert_eq!(h.table.final_row("e2").await["group_id"], Cell::Int(1));

    // Unmerge cannot be expressed as an exclusion, so reads go final.
    let gated = h.gated_query(vec![1]).await;
    assert!(gated.is_final());
    assert_eq!(h.table.query_event_ids(&gated).await, ids(&["e1", "e2"]));
}

// ---------------------------------------------------------------
// Tag deletion
// ---------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_delete_promoted_tag() {
    let h = harness();
    h.table
        .insert(Event {
            tags: &[("sentry:user", "alice"), ("env", "prod")],
            ..Event::new("e1", 1, 1)
        })
        .await;
    h.table
        .insert(Event {
            tags: &[("env", "dev")],
            ..Event::new("e2", 1, 1)
        })
        .await;

    h.replace(vec![delete_tag(1, "sentry:user")]).await;

    let row = h.table.final_row("e1").await;
    assert_eq!(row["sentry:user"], Cell::Null);
    assert_eq!(strings(&row["tags.key"]), ids(&["env"]));
    assert_eq!(strings(&row["tags.value"]), ids(&["prod"]));

    // Only the row carrying the tag was rewritten.
    assert_eq!(h.table.row_count().await, 3);
    assert!(h.gated_query(vec![1]).await.is_final());
}

#[tokio::test(start_paused = true)]
async fn test_delete_context_tag_nulls_its_column() {
    let h = harness();
    h.table
        .insert(Event {
            tags: &[("browser.name", "Firefox")],
            ..Event::new("e1", 1, 1)
        })
        .await;

    h.replace(vec![delete_tag(1, "browser.name")]).await;

    let row = h.table.final_row("e1").await;
    assert_eq!(row["browser_name"], Cell::Null);
    assert!(strings(&row["tags.key"]).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_delete_unpromoted_tag() {
    let h = harness();
    h.table
        .insert(Event {
            tags: &[("foo", "1"), ("bar", "2"), ("browser.name", "Chrome")],
            ..Event::new("e1", 1, 1)
        })
        .await;
    h.table
        .insert(Event {
            tags: &[("bar", "3")],
            ..Event::new("e2", 1, 1)
        })
        .await;

    h.replace(vec![delete_tag(1, "foo")]).await;

    let row = h.table.final_row("e1").await;
    assert_eq!(strings(&row["tags.key"]), ids(&["bar", "browser.name"]));
    assert_eq!(strings(&row["tags.value"]), ids(&["2", "Chrome"]));
    assert_eq!(row["browser_name"], Cell::Str("Chrome".to_string()));
    assert_eq!(h.table.row_count().await, 3);
}

#[tokio::test(start_paused = true)]
async fn test_tag_named_like_a_column_uses_arrays() {
    let h = harness();
    h.table
        .insert(Event {
            tags: &[("browser_name", "x"), ("browser.name", "Safari")],
            ..Event::new("e1", 1, 1)
        })
        .await;

    h.replace(vec![delete_tag(1, "browser_name")]).await;

    let row = h.table.final_row("e1").await;
    assert_eq!(strings(&row["tags.key"]), ids(&["browser.name"]));
    assert_eq!(row["browser_name"], Cell::Str("Safari".to_string()));
}

// ---------------------------------------------------------------
// Failures
// ---------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_poison_message_halts_without_commit() {
    let h = harness();
    h.table.insert(Event::new("e1", 1, 1)).await;

    let (log, result) = h
        .run_replacer(vec![
            json!([2, "end_delete_groups", {"project_id": 1}]),
            delete_groups(1, &[1]),
        ])
        .await;

    assert!(matches!(result, Err(ReplacerError::DecodeError(_))));
    assert!(log.committed().await.is_empty());
    assert_eq!(log.pending().await, 1);
    assert_eq!(h.table.row_count().await, 1);
    assert!(h.flags.get_excluded_groups(1).await.is_empty());
}
