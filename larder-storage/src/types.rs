//! Shared record, action-log and cache types.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Key of a record inside a partition.
///
/// Server-issued ids are usually integers; temporary client ids are strings.
/// `1` and `"1"` are distinct keys.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordKey {
    Int(i64),
    Text(String),
}

impl RecordKey {
    /// Extracts a key from a JSON value (`id` field contents).
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(RecordKey::Int),
            Value::String(s) if !s.is_empty() => Some(RecordKey::Text(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RecordKey::Int(n) => Value::from(*n),
            RecordKey::Text(s) => Value::String(s.clone()),
        }
    }

    /// Encoded form stored in the `key` column. Keeps integer and string keys apart.
    pub(crate) fn encode(&self) -> String {
        match self {
            RecordKey::Int(n) => format!("i:{n}"),
            RecordKey::Text(s) => format!("s:{s}"),
        }
    }

    pub(crate) fn sort_num(&self) -> Option<i64> {
        match self {
            RecordKey::Int(n) => Some(*n),
            RecordKey::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RecordKey::Text(s) => Some(s),
            RecordKey::Int(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RecordKey::Int(n) => Some(*n),
            RecordKey::Text(_) => None,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Int(n) => write!(f, "{n}"),
            RecordKey::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RecordKey {
    fn from(value: i64) -> Self {
        RecordKey::Int(value)
    }
}

impl From<&str> for RecordKey {
    fn from(value: &str) -> Self {
        RecordKey::Text(value.to_string())
    }
}

impl From<String> for RecordKey {
    fn from(value: String) -> Self {
        RecordKey::Text(value)
    }
}

/// HTTP method recorded with an action so replay matches the direct call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of mutation recorded in the action log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// Replay status of an action-log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Synced,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Synced => "synced",
            ActionStatus::Failed => "failed",
        }
    }
}

/// A mutation about to be appended to the action log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewAction {
    pub entity_type: String,
    /// Local partition holding the affected record.
    pub partition: String,
    /// Local key of the affected record (may be a temporary id).
    pub record_id: RecordKey,
    pub operation: Operation,
    pub data: Value,
    pub endpoint: String,
    pub method: HttpMethod,
}

/// An entry of the action log as persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionEntry {
    pub id: i64,
    pub entity_type: String,
    pub partition: String,
    pub record_id: RecordKey,
    pub operation: Operation,
    pub data: Value,
    pub endpoint: String,
    pub method: HttpMethod,
    /// Creation time in epoch milliseconds. Defines replay order.
    pub timestamp: i64,
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionEntry {
    pub fn created_at(&self) -> DateTime<Utc> {
        millis_to_datetime(self.timestamp)
    }
}

/// A cached read payload with an absolute expiry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub data: Value,
    /// Fetch time in epoch milliseconds.
    pub timestamp: i64,
    /// Deadline in epoch milliseconds; always `timestamp + ttl`.
    pub expiry: i64,
}

impl CacheEntry {
    /// An entry is dead from its expiry instant onwards.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp_millis() >= self.expiry
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        millis_to_datetime(self.timestamp)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        millis_to_datetime(self.expiry)
    }
}

/// Version number for serialized [`Backup`] documents.
pub const BACKUP_FORMAT_VERSION: u16 = 1;

/// Full dump of every partition, for manual backup and restore.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    pub format_version: u16,
    pub schema_version: u32,
    pub exported_at: DateTime<Utc>,
    pub partitions: BTreeMap<String, Vec<Value>>,
}

pub(crate) fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}
