//! Mutation event decoding
//!
//! Replacement payloads are JSON arrays of the form
//! `[version, action, data, state?]`:
//!
//! | version | actions |
//! |---|---|
//! | 0 | `insert` (exactly three elements) |
//! | 1 | `insert` |
//! | 2 | `insert`, `start_*` and `end_*` for `delete_groups`, `merge`, `unmerge`, `delete_tag` |
//!
//! Only the `end_*` actions describe a mutation to apply. `insert` and the
//! `start_*` actions are recognized and skipped. The upstream change-data
//! log also interleaves transaction markers, `{"event": "begin" | "commit"}`,
//! which are skipped as well. Anything else is a decode error.

use std::collections::BTreeSet;

use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::{ReplacerError, Result};

/// Datetime format used by mutation payloads.
pub const PAYLOAD_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

const SKIPPED_ACTIONS: &[&str] = &[
    "insert",
    "start_delete_groups",
    "start_merge",
    "start_unmerge",
    "start_delete_tag",
];

/// Groups deleted from a project.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeleteGroups {
    pub project_id: u64,
    pub group_ids: BTreeSet<u64>,
    #[serde(rename = "datetime", deserialize_with = "deserialize_payload_datetime")]
    pub cutoff_timestamp: NaiveDateTime,
}

/// Groups merged into `new_group_id`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Merge {
    pub project_id: u64,
    pub previous_group_ids: Vec<u64>,
    pub new_group_id: u64,
    #[serde(rename = "datetime", deserialize_with = "deserialize_payload_datetime")]
    pub cutoff_timestamp: NaiveDateTime,
    /// Set by publishers that may emit the same merge more than once.
    #[serde(default)]
    pub transaction_id: Option<String>,
}

/// Events with the given hashes split out of `previous_group_id`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Unmerge {
    pub project_id: u64,
    pub previous_group_id: u64,
    pub new_group_id: u64,
    pub hashes: Vec<String>,
    #[serde(rename = "datetime", deserialize_with = "deserialize_payload_datetime")]
    pub cutoff_timestamp: NaiveDateTime,
}

/// A tag removed from every event of a project.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeleteTag {
    pub project_id: u64,
    #[serde(rename = "tag")]
    pub tag_name: String,
    #[serde(rename = "datetime", deserialize_with = "deserialize_payload_datetime")]
    pub cutoff_timestamp: NaiveDateTime,
}

/// A logical mutation to materialize against the analytical store.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationEvent {
    EndDeleteGroups(DeleteGroups),
    EndMerge(Merge),
    EndUnmerge(Unmerge),
    EndDeleteTag(DeleteTag),
}

impl MutationEvent {
    pub fn project_id(&self) -> u64 {
        match self {
            MutationEvent::EndDeleteGroups(e) => e.project_id,
            MutationEvent::EndMerge(e) => e.project_id,
            MutationEvent::EndUnmerge(e) => e.project_id,
            MutationEvent::EndDeleteTag(e) => e.project_id,
        }
    }

    pub fn kind(&self) -> MutationKind {
        match self {
            MutationEvent::EndDeleteGroups(_) => MutationKind::DeleteGroups,
            MutationEvent::EndMerge(_) => MutationKind::Merge,
            MutationEvent::EndUnmerge(_) => MutationKind::Unmerge,
            MutationEvent::EndDeleteTag(_) => MutationKind::DeleteTag,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    DeleteGroups,
    Merge,
    Unmerge,
    DeleteTag,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::DeleteGroups => "delete_groups",
            MutationKind::Merge => "merge",
            MutationKind::Unmerge => "unmerge",
            MutationKind::DeleteTag => "delete_tag",
        }
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction boundary emitted by the change-data log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMarker {
    Begin,
    Commit,
}

/// Result of decoding one raw replacement message.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    Marker(TransactionMarker),
    /// A valid message that carries nothing to apply.
    Skipped { version: u64, action: String },
    Mutation(MutationEvent),
}

/// Decode a raw replacement payload.
pub fn decode(payload: &[u8]) -> Result<DecodedMessage> {
    let value: Value = serde_json::from_slice(payload)?;
    match value {
        Value::Object(ref object) if object.contains_key("event") => decode_marker(&value),
        Value::Array(items) => decode_versioned(items),
        other => Err(ReplacerError::DecodeError(format!(
            "expected an array or a transaction marker, got {}",
            json_type(&other)
        ))),
    }
}

fn decode_marker(value: &Value) -> Result<DecodedMessage> {
    match value.get("event").and_then(Value::as_str) {
        Some("begin") => Ok(DecodedMessage::Marker(TransactionMarker::Begin)),
        Some("commit") => Ok(DecodedMessage::Marker(TransactionMarker::Commit)),
        Some(other) => Err(ReplacerError::DecodeError(format!(
            "unknown transaction marker '{}'",
            other
        ))),
        None => Err(ReplacerError::DecodeError(
            "transaction marker without a string event".to_string(),
        )),
    }
}

fn decode_versioned(items: Vec<Value>) -> Result<DecodedMessage> {
    if items.len() < 3 || items.len() > 4 {
        return Err(ReplacerError::DecodeError(format!(
            "expected 3 or 4 elements, got {}",
            items.len()
        )));
    }

    let mut items = items.into_iter();
    let version = items
        .next()
        .and_then(|v| v.as_u64())
        .ok_or_else(|| ReplacerError::DecodeError("version must be an integer".to_string()))?;
    let action = match items.next() {
        Some(Value::String(action)) => action,
        _ => {
            return Err(ReplacerError::DecodeError(
                "action must be a string".to_string(),
            ))
        }
    };
    let data = match items.next() {
        Some(data @ Value::Object(_)) => data,
        Some(other) => {
            return Err(ReplacerError::DecodeError(format!(
                "data must be an object, got {}",
                json_type(&other)
            )))
        }
        None => return Err(ReplacerError::DecodeError("missing data".to_string())),
    };
    let has_state = match items.next() {
        None => false,
        Some(Value::Object(_)) => true,
        Some(other) => {
            return Err(ReplacerError::DecodeError(format!(
                "state must be an object, got {}",
                json_type(&other)
            )))
        }
    };

    match version {
        0 if has_state => Err(ReplacerError::DecodeError(
            "version 0 messages carry exactly three elements".to_string(),
        )),
        0 | 1 if action == "insert" => Ok(DecodedMessage::Skipped { version, action }),
        0 | 1 => Err(ReplacerError::DecodeError(format!(
            "action '{}' not supported by version {}",
            action, version
        ))),
        2 => decode_v2(action, data),
        other => Err(ReplacerError::DecodeError(format!(
            "unsupported version {}",
            other
        ))),
    }
}

fn decode_v2(action: String, data: Value) -> Result<DecodedMessage> {
    if SKIPPED_ACTIONS.contains(&action.as_str()) {
        return Ok(DecodedMessage::Skipped { version: 2, action });
    }

    let event = match action.as_str() {
        "end_delete_groups" => MutationEvent::EndDeleteGroups(parse_data(&action, data)?),
        "end_merge" => MutationEvent::EndMerge(parse_data(&action, data)?),
        "end_unmerge" => MutationEvent::EndUnmerge(parse_data(&action, data)?),
        "end_delete_tag" => MutationEvent::EndDeleteTag(parse_data(&action, data)?),
        other => {
            return Err(ReplacerError::DecodeError(format!(
                "unknown action '{}'",
                other
            )))
        }
    };
    Ok(DecodedMessage::Mutation(event))
}

fn parse_data<T: for<'de> Deserialize<'de>>(action: &str, data: Value) -> Result<T> {
    serde_json::from_value(data)
        .map_err(|e| ReplacerError::DecodeError(format!("invalid '{}' data: {}", action, e)))
}

fn deserialize_payload_datetime<'de, D>(deserializer: D) -> std::result::Result<NaiveDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    NaiveDateTime::parse_from_str(&raw, PAYLOAD_DATETIME_FORMAT).map_err(serde::de::Error::custom)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
