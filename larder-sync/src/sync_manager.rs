//! Action-log replay.
//!
//! Drains pending entries strictly in `(timestamp, id)` order, one request at
//! a time, reconciling the local record after each acknowledged call. Each
//! entry is marked `synced` before the next one is attempted, so an
//! interrupted drain resumes exactly where it stopped.

use crate::api_client::RemoteClient;
use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor};
use crate::error::{SyncError, SyncResult};
use crate::record::{is_temp_id, ENGINE_FIELDS};
use larder_storage::{ActionEntry, HttpMethod, LocalStore, Operation, RecordKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the report broadcast channel.
const REPORT_CHANNEL_CAPACITY: usize = 16;

/// How a call to [`SyncManager::sync_all_actions`] ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Every pending entry was attempted.
    Completed,
    /// The batch stopped early, because connectivity dropped or the log
    /// could not be updated; the rest stays pending.
    Interrupted,
    /// Another drain was in progress; nothing was done.
    AlreadyRunning,
    /// Offline; the log was not touched.
    Offline,
}

/// One entry that could not be replayed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionFailure {
    pub action_id: i64,
    pub entity_type: String,
    pub operation: Operation,
    pub error: String,
}

/// Result of one drain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    pub synced: usize,
    pub failed: usize,
    pub errors: Vec<ActionFailure>,
}

impl SyncReport {
    fn skipped(outcome: SyncOutcome) -> Self {
        Self {
            outcome,
            synced: 0,
            failed: 0,
            errors: Vec::new(),
        }
    }

    fn push_failure(&mut self, entry: &ActionEntry, error: String) {
        self.failed += 1;
        self.errors.push(ActionFailure {
            action_id: entry.id,
            entity_type: entry.entity_type.clone(),
            operation: entry.operation,
            error,
        });
    }

    pub fn is_success(&self) -> bool {
        self.outcome == SyncOutcome::Completed && self.failed == 0
    }
}

/// Clears the single-flight flag on every exit path.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Replays the action log against the remote service.
pub struct SyncManager {
    store: LocalStore,
    client: Arc<RemoteClient>,
    connectivity: ConnectivityMonitor,
    syncing: AtomicBool,
    events: broadcast::Sender<SyncReport>,
    debounce: Duration,
}

impl SyncManager {
    pub fn new(
        store: LocalStore,
        client: Arc<RemoteClient>,
        connectivity: ConnectivityMonitor,
        debounce: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        Self {
            store,
            client,
            connectivity,
            syncing: AtomicBool::new(false),
            events,
            debounce,
        }
    }

    /// Reports of processed batches, published once per drain.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncReport> {
        self.events.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> SyncResult<usize> {
        Ok(self.store.pending_action_count()?)
    }

    /// Drains every pending entry. Concurrent calls return `AlreadyRunning`
    /// immediately; per-entry failures are recorded in the report.
    pub async fn sync_all_actions(&self) -> SyncResult<SyncReport> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("sync already in progress, skipping");
            return Ok(SyncReport::skipped(SyncOutcome::AlreadyRunning));
        }
        let _guard = FlightGuard(&self.syncing);

        if !self.connectivity.is_online() {
            debug!("offline, not syncing");
            return Ok(SyncReport::skipped(SyncOutcome::Offline));
        }

        let mut entries = self.store.get_pending_actions()?;
        larder_storage::action_log::sort_for_replay(&mut entries);
        info!("syncing {} pending actions", entries.len());

        let mut report = SyncReport::skipped(SyncOutcome::Completed);
        for (i, entry) in entries.iter().enumerate() {
            if !self.connectivity.is_online() {
                warn!("connectivity lost, {} actions left pending", entries.len() - i);
                report.outcome = SyncOutcome::Interrupted;
                break;
            }
            let replayed = self.replay(entry).await;
            let recorded = match &replayed {
                Ok(()) => self.store.mark_action_synced(entry.id),
                Err(e) => self.store.mark_action_failed(entry.id, &e.to_string()),
            };
            match (replayed, recorded) {
                (Ok(()), Ok(())) => report.synced += 1,
                (Err(e), Ok(())) => {
                    warn!(
                        "action {} ({:?} {}) failed: {e}",
                        entry.id, entry.operation, entry.endpoint
                    );
                    report.push_failure(entry, e.to_string());
                }
                (_, Err(e)) => {
                    error!("action {}: could not update the action log, stopping: {e}", entry.id);
                    report.push_failure(entry, format!("action log: {e}"));
                    report.outcome = SyncOutcome::Interrupted;
                    break;
                }
            }
        }

        info!("sync finished: {} synced, {} failed", report.synced, report.failed);
        // No receivers is fine.
        let _ = self.events.send(report.clone());
        Ok(report)
    }

    /// Moves failed entries back to pending and drains again.
    pub async fn retry_failed_actions(&self) -> SyncResult<SyncReport> {
        let reset = self.store.reset_failed_actions()?;
        debug!("reset {reset} failed actions");
        self.sync_all_actions().await
    }

    pub fn clear_synced_actions(&self) -> SyncResult<usize> {
        Ok(self.store.clear_synced_actions()?)
    }

    /// Syncs after every reconnect, once the debounce delay has passed and
    /// only if the link is still up and work is pending.
    pub fn spawn_auto_sync(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut events = self.connectivity.events();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if event != ConnectivityEvent::Restored {
                    continue;
                }
                tokio::time::sleep(manager.debounce).await;
                if !manager.connectivity.is_online() {
                    continue;
                }
                match manager.pending_count() {
                    Ok(0) => {}
                    Ok(n) => {
                        info!("back online with {n} pending actions");
                        if let Err(e) = manager.sync_all_actions().await {
                            error!("auto-sync failed: {e}");
                        }
                    }
                    Err(e) => error!("auto-sync could not read the action log: {e}"),
                }
            }
            debug!("connectivity monitor closed, auto-sync stopped");
        })
    }

    // ── Replay ──

    /// Sends one entry. Once the server has accepted it, local reconcile
    /// problems are logged and the entry still counts as synced: replaying
    /// it again would apply the mutation twice.
    async fn replay(&self, entry: &ActionEntry) -> SyncResult<()> {
        let target = self.store.resolve_id(&entry.record_id)?;
        if entry.operation != Operation::Create && is_temp_id(&target) {
            return Err(SyncError::InvalidInput(format!(
                "{} was never created on the server",
                entry.record_id
            )));
        }

        let endpoint = match (entry.record_id.as_str(), &target) {
            (Some(temp), server) if server != &entry.record_id => {
                rewrite_endpoint(&entry.endpoint, temp, &server.to_string())
            }
            _ => entry.endpoint.clone(),
        };
        let body = match entry.method {
            HttpMethod::Post | HttpMethod::Put => Some(&entry.data),
            HttpMethod::Get | HttpMethod::Delete => None,
        };

        let response = match self.client.send(entry.method, &endpoint, body).await {
            Ok(value) => value,
            Err(e) if entry.operation == Operation::Delete && e.status() == Some(404) => {
                debug!("{endpoint} already deleted on server");
                Value::Null
            }
            Err(e) => return Err(e),
        };

        let reconciled = match entry.operation {
            Operation::Create => self.reconcile_create(entry, &response),
            Operation::Update => self.reconcile_update(entry, &target, &response),
            Operation::Delete => self.reconcile_delete(entry, &target),
        };
        if let Err(e) = reconciled {
            warn!(
                "action {}: server accepted {:?} but local reconcile failed: {e}",
                entry.id, entry.operation
            );
        }
        Ok(())
    }

    /// Moves the temporary record under the server id and remembers the alias.
    fn reconcile_create(&self, entry: &ActionEntry, response: &Value) -> SyncResult<()> {
        let Some(server_id) = response.get("id").and_then(RecordKey::from_value) else {
            warn!(
                "action {}: server accepted {} {} without returning an id, keeping the local copy",
                entry.id, entry.entity_type, entry.record_id
            );
            // `_offline` stays set: the server's copy was never adopted.
            self.store.transaction(|txn| {
                let keys = [entry.record_id.clone()];
                let pending = !txn.pending_actions_for(&entry.partition, &keys, entry.id)?.is_empty();
                if let Some(mut record) = txn.get_by_id(&entry.partition, &entry.record_id)? {
                    set_sync_flags(&mut record, &entry.record_id, true, pending);
                    txn.put(&entry.partition, record)?;
                }
                Ok(())
            })?;
            return Ok(());
        };

        let moved = self.store.transaction(|txn| {
            let keys = [entry.record_id.clone(), server_id.clone()];
            let pending = !txn.pending_actions_for(&entry.partition, &keys, entry.id)?.is_empty();
            let mut record = txn
                .get_by_id(&entry.partition, &entry.record_id)?
                .unwrap_or_else(|| entry.data.clone());
            if !pending {
                overlay(&mut record, response);
            }
            set_sync_flags(&mut record, &server_id, pending, pending);
            txn.put(&entry.partition, record)?;
            if server_id != entry.record_id {
                txn.delete(&entry.partition, &entry.record_id)?;
            }
            if let Some(temp) = entry.record_id.as_str() {
                txn.record_id_alias(temp, &server_id)?;
            }
            Ok(())
        });
        if let Err(e) = moved {
            // Later entries for the temporary id still need to find the server id.
            if let Some(temp) = entry.record_id.as_str() {
                self.store.record_id_alias(temp, &server_id)?;
            }
            return Err(e.into());
        }
        debug!("{} {} is now {server_id}", entry.entity_type, entry.record_id);
        Ok(())
    }

    /// Adopts the server's copy unless newer local writes are still queued.
    fn reconcile_update(&self, entry: &ActionEntry, target: &RecordKey, response: &Value) -> SyncResult<()> {
        self.store.transaction(|txn| {
            let keys = [entry.record_id.clone(), target.clone()];
            let pending = !txn.pending_actions_for(&entry.partition, &keys, entry.id)?.is_empty();
            let Some(mut record) = txn.get_by_id(&entry.partition, target)? else {
                if !pending && response.get("id").and_then(RecordKey::from_value).is_some() {
                    txn.put(&entry.partition, response.clone())?;
                }
                return Ok(());
            };
            if pending {
                debug!("{} {target} has newer queued writes, keeping local copy", entry.entity_type);
            } else {
                overlay(&mut record, response);
            }
            set_sync_flags(&mut record, target, pending, pending);
            txn.put(&entry.partition, record)?;
            Ok(())
        })?;
        Ok(())
    }

    fn reconcile_delete(&self, entry: &ActionEntry, target: &RecordKey) -> SyncResult<()> {
        self.store.transaction(|txn| {
            txn.delete(&entry.partition, target)?;
            if target != &entry.record_id {
                txn.delete(&entry.partition, &entry.record_id)?;
            }
            Ok(())
        })?;
        Ok(())
    }
}

fn set_sync_flags(record: &mut Value, id: &RecordKey, offline: bool, pending: bool) {
    if let Some(obj) = record.as_object_mut() {
        obj.insert("id".into(), id.to_value());
        obj.insert("_offline".into(), Value::Bool(offline));
        obj.insert("_pending_sync".into(), Value::Bool(pending));
    }
}

/// Copies the server's domain fields over a local record.
fn overlay(record: &mut Value, response: &Value) {
    let (Some(record), Some(response)) = (record.as_object_mut(), response.as_object()) else {
        return;
    };
    for (k, v) in response {
        if k == "id" || !ENGINE_FIELDS.contains(&k.as_str()) {
            record.insert(k.clone(), v.clone());
        }
    }
}

/// Replaces path segments equal to `temp` with `server`.
fn rewrite_endpoint(endpoint: &str, temp: &str, server: &str) -> String {
    endpoint
        .split('/')
        .map(|segment| if segment == temp { server } else { segment })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rewrites_only_whole_segments() {
        assert_eq!(
            rewrite_endpoint("/api/suppliers/temp_1_abc", "temp_1_abc", "42"),
            "/api/suppliers/42"
        );
        assert_eq!(
            rewrite_endpoint("/api/temp_1_abcd/x", "temp_1_abc", "42"),
            "/api/temp_1_abcd/x"
        );
    }

    #[test]
    fn overlay_keeps_local_flags() {
        let mut record = json!({"id": "temp_1", "name": "Salt", "_deleted": true});
        overlay(&mut record, &json!({"id": 9, "name": "Sea salt", "_deleted": false}));
        assert_eq!(record, json!({"id": 9, "name": "Sea salt", "_deleted": true}));
    }

    #[test]
    fn success_requires_completed_without_failures() {
        let mut report = SyncReport::skipped(SyncOutcome::Completed);
        assert!(report.is_success());
        report.failed = 1;
        assert!(!report.is_success());
        assert!(!SyncReport::skipped(SyncOutcome::Offline).is_success());
    }
}
