//! Shared helpers for integration tests against a wiremock server.
#![allow(dead_code)]

use larder_storage::StoreSchema;
use larder_sync::{EngineConfig, OfflineEngine};
use serde::{Deserialize, Serialize};
use std::sync::Once;
use std::time::Duration;
use wiremock::MockServer;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub name: String,
    pub qty: i64,
}

impl InventoryItem {
    pub fn new(name: &str, qty: i64) -> Self {
        Self { name: name.into(), qty }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SalesReport {
    pub total: f64,
    pub orders: u32,
}

static TRACING: Once = Once::new();

/// Routes engine logs to the test output; honors `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Config pointing at the mock server, with short reconnect delays.
pub fn test_config(server: &MockServer) -> EngineConfig {
    EngineConfig {
        api_base_url: server.uri(),
        database_path: None,
        request_timeout_secs: 5,
        reconnect_debounce_ms: 50,
        report_reconnect_delay_ms: 50,
    }
}

/// In-memory engine with the restaurant partitions.
pub fn engine(server: &MockServer, online: bool) -> OfflineEngine {
    init_tracing();
    OfflineEngine::new(test_config(server), StoreSchema::restaurant(), online).unwrap()
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
