//! Offline action log: the ordered record of mutations the server has not
//! acknowledged yet.
//!
//! Entries are appended with status `pending` and afterwards only change
//! `status`/`error`. Replay order is `(timestamp, id)` ascending; callers sort
//! with [`sort_for_replay`] since index reads come back in key order.

use crate::error::{StorageError, StorageResult};
use crate::object_store::{json_path, read_record, write_record, LocalStore, StoreTxn, WriteMode};
use crate::schema::{ACTION_LOG, ID_ALIASES};
use crate::types::{ActionEntry, ActionStatus, NewAction, RecordKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use rusqlite::params;
use serde_json::Value;
use tracing::debug;

/// Sorts entries into replay order: oldest first, ties broken by id.
pub fn sort_for_replay(entries: &mut [ActionEntry]) {
    entries.sort_by_key(|e| (e.timestamp, e.id));
}

#[derive(Serialize, Deserialize)]
struct IdAlias {
    temp_id: String,
    server_id: RecordKey,
}

fn status_value(status: ActionStatus) -> Value {
    Value::String(status.as_str().to_string())
}

fn parse_entries(values: Vec<Value>) -> StorageResult<Vec<ActionEntry>> {
    values
        .into_iter()
        .map(|v| serde_json::from_value(v).map_err(StorageError::from))
        .collect()
}

impl LocalStore {
    /// Appends a pending entry stamped with the current time. Returns its id.
    pub fn queue_action(&self, action: NewAction) -> StorageResult<i64> {
        self.queue_action_at(action, Utc::now())
    }

    /// Appends a pending entry with an explicit creation time.
    pub fn queue_action_at(&self, action: NewAction, now: DateTime<Utc>) -> StorageResult<i64> {
        self.transaction(|txn| txn.queue_action_at(action, now))
    }

    pub fn get_action(&self, id: i64) -> StorageResult<Option<ActionEntry>> {
        self.get_by_id(ACTION_LOG, &RecordKey::Int(id))?
            .map(serde_json::from_value)
            .transpose()
            .map_err(StorageError::from)
    }

    /// Every entry still waiting for replay, in no particular order.
    pub fn get_pending_actions(&self) -> StorageResult<Vec<ActionEntry>> {
        parse_entries(self.get_by_index(ACTION_LOG, "status", &status_value(ActionStatus::Pending))?)
    }

    pub fn get_failed_actions(&self) -> StorageResult<Vec<ActionEntry>> {
        parse_entries(self.get_by_index(ACTION_LOG, "status", &status_value(ActionStatus::Failed))?)
    }

    pub fn get_actions_for_entity(&self, entity_type: &str) -> StorageResult<Vec<ActionEntry>> {
        parse_entries(self.get_by_index(
            ACTION_LOG,
            "entity_type",
            &Value::String(entity_type.to_string()),
        )?)
    }

    /// The whole log in replay order.
    pub fn get_all_actions(&self) -> StorageResult<Vec<ActionEntry>> {
        let mut entries = parse_entries(self.get_all(ACTION_LOG)?)?;
        sort_for_replay(&mut entries);
        Ok(entries)
    }

    pub fn pending_action_count(&self) -> StorageResult<usize> {
        self.count_by_index(ACTION_LOG, "status", &status_value(ActionStatus::Pending))
    }

    pub fn mark_action_synced(&self, id: i64) -> StorageResult<()> {
        self.set_action_status(id, ActionStatus::Synced, None)
    }

    pub fn mark_action_failed(&self, id: i64, error: &str) -> StorageResult<()> {
        self.set_action_status(id, ActionStatus::Failed, Some(error.to_string()))
    }

    fn set_action_status(&self, id: i64, status: ActionStatus, error: Option<String>) -> StorageResult<()> {
        let def = self.schema().require(ACTION_LOG)?.clone();
        let key = RecordKey::Int(id);
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let value = read_record(&tx, ACTION_LOG, &key)?.ok_or_else(|| StorageError::NotFound {
                partition: ACTION_LOG.to_string(),
                key: key.to_string(),
            })?;
            let mut entry: ActionEntry = serde_json::from_value(value)?;
            entry.status = status;
            entry.error = error;
            write_record(&tx, &def, serde_json::to_value(&entry)?, WriteMode::Put)?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Moves every failed entry back to pending. Returns how many were reset.
    pub fn reset_failed_actions(&self) -> StorageResult<usize> {
        let failed = self.get_failed_actions()?;
        let reset: Vec<Value> = failed
            .into_iter()
            .map(|mut entry| {
                entry.status = ActionStatus::Pending;
                entry.error = None;
                serde_json::to_value(entry)
            })
            .collect::<Result<_, _>>()?;
        let count = reset.len();
        if count > 0 {
            self.bulk_put(ACTION_LOG, reset)?;
        }
        Ok(count)
    }

    /// Deletes terminal `synced` entries. Returns how many were removed.
    pub fn clear_synced_actions(&self) -> StorageResult<usize> {
        let removed = self.delete_by_index(ACTION_LOG, "status", &status_value(ActionStatus::Synced))?;
        debug!("swept {removed} synced actions");
        Ok(removed)
    }

    // ── Temporary id aliases ──

    /// Remembers that a temporary id now lives under a server-issued id.
    pub fn record_id_alias(&self, temp_id: &str, server_id: &RecordKey) -> StorageResult<()> {
        self.transaction(|txn| txn.record_id_alias(temp_id, server_id))
    }

    /// Maps a temporary id to its server id if one was recorded.
    pub fn resolve_id(&self, key: &RecordKey) -> StorageResult<RecordKey> {
        let RecordKey::Text(temp) = key else {
            return Ok(key.clone());
        };
        match self.get_by_id(ID_ALIASES, &RecordKey::Text(temp.clone()))? {
            Some(value) => {
                let alias: IdAlias = serde_json::from_value(value)?;
                Ok(alias.server_id)
            }
            None => Ok(key.clone()),
        }
    }
}

impl StoreTxn<'_> {
    /// Appends a pending entry alongside whatever else the transaction writes.
    pub fn queue_action(&self, action: NewAction) -> StorageResult<i64> {
        self.queue_action_at(action, Utc::now())
    }

    pub fn queue_action_at(&self, action: NewAction, now: DateTime<Utc>) -> StorageResult<i64> {
        let mut value = serde_json::to_value(&action)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("timestamp".into(), Value::from(now.timestamp_millis()));
            obj.insert("status".into(), status_value(ActionStatus::Pending));
        }
        let key = self.add(ACTION_LOG, value)?;
        let id = key
            .as_i64()
            .ok_or_else(|| StorageError::InvalidRecord(format!("non-integer action id {key}")))?;
        debug!(
            "queued {:?} {} {} for {} (action {id})",
            action.operation, action.method, action.endpoint, action.entity_type
        );
        Ok(id)
    }

    /// Pending entries on `partition` whose record is any of `keys`,
    /// other than `except`. Read from the log as it is now.
    pub fn pending_actions_for(
        &self,
        partition: &str,
        keys: &[RecordKey],
        except: i64,
    ) -> StorageResult<Vec<ActionEntry>> {
        let def = self.def(ACTION_LOG)?;
        let sql = format!(
            "SELECT data FROM records WHERE partition = ?1 AND {} = ?2",
            json_path("status")
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![def.name, ActionStatus::Pending.as_str()], |row| {
            row.get::<_, String>(0)
        })?;
        let mut entries = Vec::new();
        for raw in rows {
            let entry: ActionEntry = serde_json::from_str(&raw?)?;
            if entry.id != except && entry.partition == partition && keys.contains(&entry.record_id) {
                entries.push(entry);
            }
        }
        sort_for_replay(&mut entries);
        Ok(entries)
    }

    pub fn record_id_alias(&self, temp_id: &str, server_id: &RecordKey) -> StorageResult<()> {
        let alias = IdAlias {
            temp_id: temp_id.to_string(),
            server_id: server_id.clone(),
        };
        self.put(ID_ALIASES, serde_json::to_value(alias)?)?;
        Ok(())
    }
}
