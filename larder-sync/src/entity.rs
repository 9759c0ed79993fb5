//! Network-transparent CRUD over one entity type.
//!
//! Writes always land locally first. When the remote call is possible and
//! succeeds, the server's copy replaces the local one; otherwise the write is
//! appended to the action log with the method, endpoint and payload the
//! direct call would have used, and the record is flagged `_pending_sync`.
//!
//! A record that already has unsynced actions (or still carries a temporary
//! id) never goes to the server directly: its later writes are queued behind
//! the earlier ones so replay preserves their order.

use crate::api_client::RemoteClient;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{SyncError, SyncResult};
use crate::record::{generate_temp_id, is_temp_id, merge_shallow, EntityConfig, Record};
use larder_storage::{ActionStatus, HttpMethod, LocalStore, NewAction, Operation, RecordKey};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Offline-capable storage for records of type `T`.
pub struct EntityStorage<T> {
    config: EntityConfig,
    store: LocalStore,
    client: Arc<RemoteClient>,
    connectivity: ConnectivityMonitor,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for EntityStorage<T> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            store: self.store.clone(),
            client: Arc::clone(&self.client),
            connectivity: self.connectivity.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> EntityStorage<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(
        config: EntityConfig,
        store: LocalStore,
        client: Arc<RemoteClient>,
        connectivity: ConnectivityMonitor,
    ) -> Self {
        Self {
            config,
            store,
            client,
            connectivity,
            _marker: PhantomData,
        }
    }

    pub fn config(&self) -> &EntityConfig {
        &self.config
    }

    // ── Reads ──

    /// Server data when reachable (refreshing the local copy), else the local copy.
    pub async fn get_all(&self) -> SyncResult<Vec<Record<T>>> {
        if self.connectivity.is_online() {
            match self.fetch_all().await {
                Ok(records) => return Ok(records),
                Err(e) if e.is_remote() => {
                    warn!("{}: remote list failed, serving local copy: {e}", self.config.entity_type);
                }
                Err(e) => return Err(e),
            }
        }
        self.local_all()
    }

    /// Reloads from the server without falling back.
    pub async fn refresh(&self) -> SyncResult<Vec<Record<T>>> {
        if !self.connectivity.is_online() {
            return Err(SyncError::UnavailableOffline(self.config.entity_type.clone()));
        }
        self.fetch_all().await
    }

    pub async fn get_by_id(&self, id: &RecordKey) -> SyncResult<Option<Record<T>>> {
        if self.connectivity.is_online() && !is_temp_id(id) {
            match self.fetch_one(id).await {
                Ok(record) => return Ok(Some(record)),
                Err(e) if e.is_remote() => {
                    debug!("{}: remote get {id} failed, using local copy: {e}", self.config.entity_type);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(self.local_get(id)?.filter(|r| !r.deleted))
    }

    /// Client-side filter over [`get_all`](Self::get_all).
    pub async fn search<F>(&self, predicate: F) -> SyncResult<Vec<Record<T>>>
    where
        F: Fn(&Record<T>) -> bool,
    {
        Ok(self.get_all().await?.into_iter().filter(|r| predicate(r)).collect())
    }

    async fn fetch_all(&self) -> SyncResult<Vec<Record<T>>> {
        let body = self.client.get(self.config.collection_url()).await?;
        let items = match body {
            Value::Array(items) => items,
            Value::Object(mut obj) => match obj.remove("data") {
                Some(Value::Array(items)) => items,
                _ => return Err(SyncError::InvalidResponse("expected a list of records".into())),
            },
            _ => return Err(SyncError::InvalidResponse("expected a list of records".into())),
        };
        let records = items
            .into_iter()
            .map(Record::from_server)
            .collect::<SyncResult<Vec<Record<T>>>>()?;

        // Records with queued work keep their local state until replay.
        let pending: HashSet<RecordKey> = self
            .local_raw()?
            .into_iter()
            .filter(|r| r.pending_sync)
            .map(|r| r.id)
            .collect();
        let fresh = records
            .iter()
            .filter(|r| !pending.contains(&r.id))
            .map(Record::to_value)
            .collect::<SyncResult<Vec<_>>>()?;
        self.store.bulk_put(&self.config.partition, fresh)?;
        debug!("{}: refreshed {} records from server", self.config.entity_type, records.len());
        Ok(records)
    }

    async fn fetch_one(&self, id: &RecordKey) -> SyncResult<Record<T>> {
        let body = self.client.get(&self.config.item_url(id)).await?;
        let record = Record::<T>::from_server(body)?;
        let keep_local = self.local_get(&record.id)?.is_some_and(|r| r.pending_sync);
        if !keep_local {
            self.write_local(&record)?;
        }
        Ok(record)
    }

    // ── Writes ──

    /// Creates a record. Returns the server's copy, or the temporary local
    /// record (flagged `_pending_sync`) when the server could not be reached.
    pub async fn create(&self, data: T) -> SyncResult<Record<T>> {
        let online = self.connectivity.is_online();
        let mut record = Record {
            id: RecordKey::Text(generate_temp_id()),
            data,
            offline: !online,
            pending_sync: !online,
            deleted: false,
        };
        self.write_local(&record)?;
        let payload = record.payload()?;
        let endpoint = self.config.collection_url().to_string();

        if online {
            match self.client.post(&endpoint, &payload).await {
                Ok(body) => {
                    let server = match Record::<T>::from_server(body) {
                        Ok(server) => server,
                        Err(e) => {
                            self.store.delete(&self.config.partition, &record.id)?;
                            return Err(e);
                        }
                    };
                    self.store.delete(&self.config.partition, &record.id)?;
                    self.write_local(&server)?;
                    debug!("{}: created {}", self.config.entity_type, server.id);
                    return Ok(server);
                }
                Err(e) if e.is_remote() => {
                    warn!("{}: create failed, queueing for sync: {e}", self.config.entity_type);
                }
                Err(e) => return Err(e),
            }
        }

        record.offline = true;
        record.pending_sync = true;
        self.write_and_queue(&record, Operation::Create, payload, endpoint, HttpMethod::Post)?;
        Ok(record)
    }

    /// Merges `patch` into an existing local record.
    pub async fn update(&self, id: &RecordKey, patch: Value) -> SyncResult<Record<T>> {
        let existing = self
            .local_get(id)?
            .ok_or_else(|| SyncError::NotFound(format!("{} {id}", self.config.entity_type)))?;
        if existing.deleted {
            return Err(SyncError::RecordDeleted(format!("{} {id}", self.config.entity_type)));
        }

        let mut merged = serde_json::to_value(&existing.data)?;
        merge_shallow(&mut merged, &patch)?;
        let data: T = serde_json::from_value(merged)?;

        let online = self.connectivity.is_online();
        let direct = online && !existing.pending_sync && !existing.is_temporary();
        let mut record = Record {
            id: existing.id.clone(),
            data,
            offline: !online,
            pending_sync: !direct,
            deleted: false,
        };
        self.write_local(&record)?;
        let payload = record.payload()?;
        let endpoint = self.config.item_url(&record.id);

        if direct {
            match self.client.put(&endpoint, &payload).await {
                Ok(body) => {
                    let confirmed = match Record::<T>::from_server(body) {
                        Ok(server) => server,
                        Err(_) => Record {
                            offline: false,
                            pending_sync: false,
                            ..record
                        },
                    };
                    self.write_local(&confirmed)?;
                    return Ok(confirmed);
                }
                Err(e) if e.is_remote() => {
                    warn!("{}: update of {id} failed, queueing for sync: {e}", self.config.entity_type);
                }
                Err(e) => return Err(e),
            }
        } else if online {
            debug!("{}: {id} has unsynced actions, queueing update behind them", self.config.entity_type);
        }

        record.offline = true;
        record.pending_sync = true;
        self.write_and_queue(&record, Operation::Update, payload, endpoint, HttpMethod::Put)?;
        Ok(record)
    }

    /// Deletes a record. Without a confirmed remote delete the record is
    /// kept, soft-deleted, until the queued DELETE replays.
    pub async fn delete(&self, id: &RecordKey) -> SyncResult<()> {
        let existing = self.local_get(id)?;
        if existing.as_ref().is_some_and(|r| r.deleted) {
            debug!("{}: {id} already pending deletion", self.config.entity_type);
            return Ok(());
        }

        let endpoint = self.config.item_url(id);
        let has_pending = existing.as_ref().is_some_and(|r| r.pending_sync);
        if self.connectivity.is_online() && !has_pending && !is_temp_id(id) {
            match self.client.delete(&endpoint).await {
                Ok(_) => {
                    self.store.delete(&self.config.partition, id)?;
                    return Ok(());
                }
                Err(e) if e.status() == Some(404) => {
                    debug!("{}: {id} already gone on server", self.config.entity_type);
                    self.store.delete(&self.config.partition, id)?;
                    return Ok(());
                }
                Err(e) if e.is_remote() => {
                    warn!("{}: delete of {id} failed, queueing for sync: {e}", self.config.entity_type);
                }
                Err(e) => return Err(e),
            }
        }

        let Some(mut record) = existing else {
            return Err(SyncError::NotFound(format!("{} {id}", self.config.entity_type)));
        };
        record.deleted = true;
        record.offline = true;
        record.pending_sync = true;
        self.write_and_queue(&record, Operation::Delete, Value::Null, endpoint, HttpMethod::Delete)?;
        Ok(())
    }

    /// Unsynced actions recorded for this entity type.
    pub fn pending_count(&self) -> SyncResult<usize> {
        Ok(self
            .store
            .get_actions_for_entity(&self.config.entity_type)?
            .iter()
            .filter(|a| a.status == ActionStatus::Pending)
            .count())
    }

    /// Drops every local record of this type. Queued actions are kept.
    pub fn clear_local(&self) -> SyncResult<usize> {
        let removed = self.store.clear(&self.config.partition)?;
        info!("{}: cleared {removed} local records", self.config.entity_type);
        Ok(removed)
    }

    // ── Local helpers ──

    fn local_raw(&self) -> SyncResult<Vec<Record<T>>> {
        self.store
            .get_all(&self.config.partition)?
            .into_iter()
            .map(Record::from_stored)
            .collect()
    }

    fn local_all(&self) -> SyncResult<Vec<Record<T>>> {
        Ok(self.local_raw()?.into_iter().filter(|r| !r.deleted).collect())
    }

    fn local_get(&self, id: &RecordKey) -> SyncResult<Option<Record<T>>> {
        self.store
            .get_by_id(&self.config.partition, id)?
            .map(Record::from_stored)
            .transpose()
    }

    fn write_local(&self, record: &Record<T>) -> SyncResult<()> {
        self.store.put(&self.config.partition, record.to_value()?)?;
        Ok(())
    }

    /// Stores the record and appends its action in one transaction.
    fn write_and_queue(
        &self,
        record: &Record<T>,
        operation: Operation,
        data: Value,
        endpoint: String,
        method: HttpMethod,
    ) -> SyncResult<i64> {
        let value = record.to_value()?;
        let action = NewAction {
            entity_type: self.config.entity_type.clone(),
            partition: self.config.partition.clone(),
            record_id: record.id.clone(),
            operation,
            data,
            endpoint,
            method,
        };
        Ok(self.store.transaction(|txn| {
            txn.put(&self.config.partition, value)?;
            txn.queue_action(action)
        })?)
    }
}
