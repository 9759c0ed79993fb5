//! Offline engine configuration.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the offline engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL of the back-office REST API (e.g., "https://api.larder.app").
    pub api_base_url: String,

    /// SQLite file for the local store. `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,

    /// Per-request timeout enforced by the HTTP client (seconds).
    pub request_timeout_secs: u64,

    /// Delay between "connectivity restored" and the automatic sync (milliseconds).
    pub reconnect_debounce_ms: u64,

    /// Delay before a cache-sourced report refetches after reconnect (milliseconds).
    pub report_reconnect_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000".to_string(),
            database_path: None,
            request_timeout_secs: 30,
            reconnect_debounce_ms: 1_000,
            report_reconnect_delay_ms: 2_000,
        }
    }
}

impl EngineConfig {
    /// Parses a JSON config document; missing fields take their defaults.
    pub fn from_json(raw: &str) -> SyncResult<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        let url = self.api_base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(SyncError::Config(format!(
                "api_base_url must be an http(s) URL, got {:?}",
                self.api_base_url
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(SyncError::Config("request_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reconnect_debounce(&self) -> Duration {
        Duration::from_millis(self.reconnect_debounce_ms)
    }

    pub fn report_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.report_reconnect_delay_ms)
    }
}
