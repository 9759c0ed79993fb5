//! Online/offline signal supplied by the host.
//!
//! The host flips the monitor when the platform reports a change; the
//! engine reads the current value and subscribes to transitions.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// A connectivity transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Restored,
    Lost,
}

/// Shared connectivity flag. Clones observe the same state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Records the platform's current state; only real changes notify.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!("connectivity {}", if online { "restored" } else { "lost" });
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Stream of transitions from now on.
    pub fn events(&self) -> ConnectivityEvents {
        let rx = self.subscribe();
        let last = *rx.borrow();
        ConnectivityEvents { rx, last }
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Receiver side of [`ConnectivityMonitor::events`].
pub struct ConnectivityEvents {
    rx: watch::Receiver<bool>,
    last: bool,
}

impl ConnectivityEvents {
    /// Waits for the next transition. `None` once the monitor is gone.
    ///
    /// Flaps faster than the reader collapse into the latest state.
    pub async fn next(&mut self) -> Option<ConnectivityEvent> {
        loop {
            self.rx.changed().await.ok()?;
            let online = *self.rx.borrow_and_update();
            if online != self.last {
                self.last = online;
                return Some(if online {
                    ConnectivityEvent::Restored
                } else {
                    ConnectivityEvent::Lost
                });
            }
        }
    }
}
