//! Offline-first sync engine for Larder.
//!
//! Sits between the application and the back-office REST API:
//! - Entity façades that write locally first and queue what the server missed
//! - An action log replayed in order once connectivity returns
//! - Cache-first report loading with TTLs
//! - Temporary client ids swapped for server ids during replay

pub mod api_client;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod entity;
pub mod error;
pub mod record;
pub mod report_cache;
pub mod sync_manager;

pub use api_client::RemoteClient;
pub use config::EngineConfig;
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor};
pub use engine::{EngineStatus, OfflineEngine};
pub use entity::EntityStorage;
pub use error::{SyncError, SyncResult};
pub use record::{EntityConfig, Record};
pub use report_cache::{ReportCache, ReportError, ReportSpec, ReportState};
pub use sync_manager::{ActionFailure, SyncManager, SyncOutcome, SyncReport};
