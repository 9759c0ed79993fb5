//! Top-level handle the application holds for the whole session.

use crate::api_client::RemoteClient;
use crate::config::EngineConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::entity::EntityStorage;
use crate::error::{SyncError, SyncResult};
use crate::record::EntityConfig;
use crate::report_cache::{ReportCache, ReportSpec};
use crate::sync_manager::{SyncManager, SyncReport};
use larder_storage::{Backup, LocalStore, StorageError, StoreLocation, StoreSchema};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Snapshot for a status bar.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub online: bool,
    pub syncing: bool,
    pub pending_actions: usize,
    pub failed_actions: usize,
}

/// Owns the local store, the remote client, connectivity and the sync manager.
pub struct OfflineEngine {
    config: EngineConfig,
    store: LocalStore,
    client: Arc<RemoteClient>,
    connectivity: ConnectivityMonitor,
    sync: Arc<SyncManager>,
    auto_sync: Mutex<Option<JoinHandle<()>>>,
}

impl OfflineEngine {
    /// Builds the engine. The store is opened lazily on first use.
    pub fn new(config: EngineConfig, schema: StoreSchema, initially_online: bool) -> SyncResult<Self> {
        config.validate()?;
        schema.validate()?;
        let location = match &config.database_path {
            Some(path) => StoreLocation::File(path.clone()),
            None => StoreLocation::Memory,
        };
        let store = LocalStore::lazy(location, schema);
        let client = Arc::new(RemoteClient::new(&config)?);
        let connectivity = ConnectivityMonitor::new(initially_online);
        let sync = Arc::new(SyncManager::new(
            store.clone(),
            Arc::clone(&client),
            connectivity.clone(),
            config.reconnect_debounce(),
        ));
        info!("offline engine ready (api {})", client.base_url());
        Ok(Self {
            config,
            store,
            client,
            connectivity,
            sync,
            auto_sync: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn sync_manager(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    /// Storage façade for one entity type. The partition must be declared in the schema.
    pub fn entity<T>(&self, config: EntityConfig) -> SyncResult<EntityStorage<T>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        if self.store.schema().partition(&config.partition).is_none() {
            return Err(StorageError::UnknownPartition(config.partition).into());
        }
        Ok(EntityStorage::new(
            config,
            self.store.clone(),
            Arc::clone(&self.client),
            self.connectivity.clone(),
        ))
    }

    pub fn report<T>(&self, spec: ReportSpec) -> ReportCache<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        ReportCache::new(
            spec,
            self.store.clone(),
            Arc::clone(&self.client),
            self.connectivity.clone(),
            self.config.report_reconnect_delay(),
        )
    }

    // ── Sync ──

    pub async fn sync(&self) -> SyncResult<SyncReport> {
        self.sync.sync_all_actions().await
    }

    pub async fn retry_failed(&self) -> SyncResult<SyncReport> {
        self.sync.retry_failed_actions().await
    }

    pub fn pending_sync_count(&self) -> SyncResult<usize> {
        self.sync.pending_count()
    }

    pub fn subscribe_sync(&self) -> broadcast::Receiver<SyncReport> {
        self.sync.subscribe()
    }

    /// Starts syncing automatically on reconnect. Calling it again is a no-op.
    pub fn start_auto_sync(&self) -> SyncResult<()> {
        let mut slot = self
            .auto_sync
            .lock()
            .map_err(|_| SyncError::Storage(StorageError::LockPoisoned))?;
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("auto-sync already running");
            return Ok(());
        }
        *slot = Some(self.sync.spawn_auto_sync());
        Ok(())
    }

    pub fn stop_auto_sync(&self) {
        if let Ok(mut slot) = self.auto_sync.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }

    // ── Connectivity & session ──

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    pub fn set_online(&self, online: bool) {
        self.connectivity.set_online(online);
    }

    pub async fn set_auth_token(&self, token: Option<String>) {
        self.client.set_token(token).await;
    }

    pub fn status(&self) -> SyncResult<EngineStatus> {
        Ok(EngineStatus {
            online: self.is_online(),
            syncing: self.sync.is_syncing(),
            pending_actions: self.store.pending_action_count()?,
            failed_actions: self.store.get_failed_actions()?.len(),
        })
    }

    // ── Maintenance ──

    pub fn clear_synced_actions(&self) -> SyncResult<usize> {
        self.sync.clear_synced_actions()
    }

    pub fn clear_expired_cache(&self) -> SyncResult<usize> {
        Ok(self.store.clear_expired_cache()?)
    }

    pub fn export_backup(&self) -> SyncResult<Backup> {
        Ok(self.store.export_backup()?)
    }

    pub fn import_backup(&self, backup: &Backup) -> SyncResult<usize> {
        Ok(self.store.import_backup(backup)?)
    }
}

impl Drop for OfflineEngine {
    fn drop(&mut self) {
        self.stop_auto_sync();
    }
}
