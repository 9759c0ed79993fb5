//! Cache-first loading for read-only reports.
//!
//! A report is served from the local cache whenever a live entry exists, so
//! screens render immediately and keep working offline. Fresh data is fetched
//! when nothing is cached, when the cached copy is getting old, or when
//! connectivity returns while cached data is on screen.

use crate::api_client::RemoteClient;
use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor};
use crate::error::SyncResult;
use chrono::{DateTime, Duration, Utc};
use larder_storage::LocalStore;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What to fetch and how long to keep it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportSpec {
    /// Cache key.
    pub key: String,
    pub endpoint: String,
    /// Lifetime of a cache entry.
    pub ttl: Duration,
    /// Age after which a served entry triggers a background refresh.
    pub stale_after: Duration,
}

impl ReportSpec {
    /// A report whose cached copy is refreshed once it is half its TTL old.
    pub fn new(key: impl Into<String>, endpoint: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            endpoint: endpoint.into(),
            ttl,
            stale_after: ttl / 2,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn sales() -> Self {
        Self::new("sales_report", "/api/reports/sales", Duration::minutes(30))
    }

    pub fn inventory_valuation() -> Self {
        Self::new(
            "inventory_valuation_report",
            "/api/reports/inventory-valuation",
            Duration::minutes(15),
        )
    }

    pub fn supplier_summary() -> Self {
        Self::new("supplier_summary_report", "/api/reports/suppliers", Duration::minutes(60))
    }
}

/// Why a report has no data to show.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ReportError {
    #[error("report is not available offline")]
    UnavailableOffline,

    #[error("failed to fetch report: {0}")]
    Fetch(String),
}

/// What a report screen renders.
#[derive(Clone, Debug, PartialEq)]
pub struct ReportState<T> {
    pub data: Option<T>,
    pub loading: bool,
    pub error: Option<ReportError>,
    pub is_from_cache: bool,
    pub last_fetched: Option<DateTime<Utc>>,
}

impl<T> Default for ReportState<T> {
    fn default() -> Self {
        Self {
            data: None,
            loading: false,
            error: None,
            is_from_cache: false,
            last_fetched: None,
        }
    }
}

struct ReportInner<T> {
    spec: ReportSpec,
    store: LocalStore,
    client: Arc<RemoteClient>,
    connectivity: ConnectivityMonitor,
    state: watch::Sender<ReportState<T>>,
    reconnect_delay: std::time::Duration,
    refreshing: AtomicBool,
}

/// One cached report. Clones share state.
pub struct ReportCache<T> {
    inner: Arc<ReportInner<T>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ReportCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _marker: PhantomData,
        }
    }
}

impl<T> ReportCache<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(
        spec: ReportSpec,
        store: LocalStore,
        client: Arc<RemoteClient>,
        connectivity: ConnectivityMonitor,
        reconnect_delay: std::time::Duration,
    ) -> Self {
        let (state, _) = watch::channel(ReportState::default());
        Self {
            inner: Arc::new(ReportInner {
                spec,
                store,
                client,
                connectivity,
                state,
                reconnect_delay,
                refreshing: AtomicBool::new(false),
            }),
            _marker: PhantomData,
        }
    }

    pub fn spec(&self) -> &ReportSpec {
        &self.inner.spec
    }

    pub fn state(&self) -> ReportState<T> {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReportState<T>> {
        self.inner.state.subscribe()
    }

    /// Initial load: cache first, network when nothing usable is cached.
    pub async fn load(&self) -> SyncResult<ReportState<T>> {
        let spec = &self.inner.spec;
        if let Some(entry) = self.inner.store.get_cache_entry(&spec.key)? {
            match serde_json::from_value::<T>(entry.data.clone()) {
                Ok(data) => {
                    let fetched_at = entry.fetched_at();
                    self.publish(ReportState {
                        data: Some(data),
                        loading: false,
                        error: None,
                        is_from_cache: true,
                        last_fetched: Some(fetched_at),
                    });
                    if self.inner.connectivity.is_online() && Utc::now() - fetched_at >= spec.stale_after {
                        debug!("{} cached copy is stale, refreshing in background", spec.key);
                        self.spawn_background_refresh();
                    }
                    return Ok(self.state());
                }
                Err(e) => {
                    warn!("{} cache entry does not decode, dropping it: {e}", spec.key);
                    self.inner.store.invalidate_cache(&spec.key)?;
                }
            }
        }

        if !self.inner.connectivity.is_online() {
            debug!("{} not cached and offline", spec.key);
            self.publish(ReportState {
                error: Some(ReportError::UnavailableOffline),
                ..ReportState::default()
            });
            return Ok(self.state());
        }

        self.fetch().await?;
        Ok(self.state())
    }

    /// Explicit refresh. Returns `false` without doing anything when offline.
    pub async fn refetch(&self) -> SyncResult<bool> {
        if !self.inner.connectivity.is_online() {
            warn!("{}: cannot refresh while offline", self.inner.spec.key);
            return Ok(false);
        }
        self.fetch().await
    }

    /// Refetches once, after a short delay, each time connectivity returns
    /// while cached (or no) data is on screen.
    ///
    /// The task holds no strong reference between events: it exits as soon as
    /// the last clone of this cache is dropped, or when the monitor goes away.
    pub fn spawn_reconnect_refresh(&self) -> JoinHandle<()> {
        let weak: Weak<ReportInner<T>> = Arc::downgrade(&self.inner);
        let mut events = self.inner.connectivity.events();
        // Errors once the state sender, owned by the cache, is dropped.
        let mut dropped = self.inner.state.subscribe();
        let delay = self.inner.reconnect_delay;
        let key = self.inner.spec.key.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.next() => event,
                    Err(_) = dropped.changed() => None,
                };
                let Some(event) = event else { break };
                if event != ConnectivityEvent::Restored {
                    continue;
                }
                let Some(inner) = weak.upgrade() else { break };
                let report = ReportCache {
                    inner,
                    _marker: PhantomData,
                };
                if !report.needs_reconnect_refresh() {
                    continue;
                }
                tokio::time::sleep(delay).await;
                if let Err(e) = report.refetch().await {
                    warn!("{}: reconnect refresh failed: {e}", report.inner.spec.key);
                }
            }
            debug!("{key}: reconnect refresh stopped");
        })
    }

    fn needs_reconnect_refresh(&self) -> bool {
        let state = self.inner.state.borrow();
        state.is_from_cache || state.error == Some(ReportError::UnavailableOffline)
    }

    fn spawn_background_refresh(&self) {
        if self.inner.refreshing.swap(true, Ordering::AcqRel) {
            return;
        }
        let report = self.clone();
        tokio::spawn(async move {
            if let Err(e) = report.fetch().await {
                warn!("{}: background refresh failed: {e}", report.inner.spec.key);
            }
            report.inner.refreshing.store(false, Ordering::Release);
        });
    }

    /// Fetches, caches and publishes. Remote failures keep the data on screen
    /// and surface in `error`; only store failures are returned.
    async fn fetch(&self) -> SyncResult<bool> {
        let spec = &self.inner.spec;
        self.inner.state.send_modify(|s| s.loading = true);

        let fetched = match self.inner.client.get(&spec.endpoint).await {
            Ok(body) => serde_json::from_value::<T>(body.clone())
                .map(|data| (body, data))
                .map_err(|e| format!("unexpected report shape: {e}")),
            Err(e) => Err(e.to_string()),
        };

        match fetched {
            Ok((body, data)) => {
                let entry = self.inner.store.cache_data(&spec.key, body, spec.ttl)?;
                info!("{} refreshed", spec.key);
                self.publish(ReportState {
                    data: Some(data),
                    loading: false,
                    error: None,
                    is_from_cache: false,
                    last_fetched: Some(entry.fetched_at()),
                });
                Ok(true)
            }
            Err(message) => {
                warn!("{} fetch failed: {message}", spec.key);
                self.inner.state.send_modify(|s| {
                    s.loading = false;
                    s.error = Some(ReportError::Fetch(message));
                });
                Ok(false)
            }
        }
    }

    fn publish(&self, state: ReportState<T>) {
        self.inner.state.send_replace(state);
    }
}
