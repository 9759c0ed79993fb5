//! Time-boxed read cache for report data.
//!
//! Entries are overwritten wholesale on refresh (last writer wins) and are
//! treated as absent from their expiry instant onwards. Expired entries are
//! evicted lazily on read or by [`LocalStore::clear_expired_cache`].

use crate::error::StorageResult;
use crate::object_store::{json_path, LocalStore};
use crate::schema::CACHE;
use crate::types::{CacheEntry, RecordKey};
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde_json::Value;
use tracing::debug;

impl LocalStore {
    /// Caches `data` under `key` for `ttl`, starting now.
    pub fn cache_data(&self, key: &str, data: Value, ttl: Duration) -> StorageResult<CacheEntry> {
        self.cache_data_at(key, data, ttl, Utc::now())
    }

    pub fn cache_data_at(
        &self,
        key: &str,
        data: Value,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> StorageResult<CacheEntry> {
        let timestamp = now.timestamp_millis();
        let entry = CacheEntry {
            key: key.to_string(),
            data,
            timestamp,
            expiry: timestamp + ttl.num_milliseconds(),
        };
        self.put(CACHE, serde_json::to_value(&entry)?)?;
        Ok(entry)
    }

    /// The live entry for `key`, evicting it if it has expired.
    pub fn get_cache_entry(&self, key: &str) -> StorageResult<Option<CacheEntry>> {
        self.get_cache_entry_at(key, Utc::now())
    }

    pub fn get_cache_entry_at(&self, key: &str, now: DateTime<Utc>) -> StorageResult<Option<CacheEntry>> {
        let record_key = RecordKey::Text(key.to_string());
        let Some(value) = self.get_by_id(CACHE, &record_key)? else {
            return Ok(None);
        };
        let entry: CacheEntry = serde_json::from_value(value)?;
        if entry.is_expired_at(now) {
            debug!("cache entry {key} expired, evicting");
            self.delete(CACHE, &record_key)?;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Cached payload for `key`, or `None` if absent or expired.
    pub fn get_cached_data(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self.get_cache_entry(key)?.map(|e| e.data))
    }

    pub fn get_cached_data_at(&self, key: &str, now: DateTime<Utc>) -> StorageResult<Option<Value>> {
        Ok(self.get_cache_entry_at(key, now)?.map(|e| e.data))
    }

    pub fn invalidate_cache(&self, key: &str) -> StorageResult<bool> {
        self.delete(CACHE, &RecordKey::Text(key.to_string()))
    }

    /// Sweeps every expired entry. Returns how many were removed.
    pub fn clear_expired_cache(&self) -> StorageResult<usize> {
        self.clear_expired_cache_at(Utc::now())
    }

    pub fn clear_expired_cache_at(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        self.schema().require(CACHE)?;
        let removed = self.with_conn(|conn| {
            let sql = format!(
                "DELETE FROM records WHERE partition = ?1 AND {} <= ?2",
                json_path("expiry")
            );
            Ok(conn.execute(&sql, params![CACHE, now.timestamp_millis()])?)
        })?;
        if removed > 0 {
            debug!("cleared {removed} expired cache entries");
        }
        Ok(removed)
    }
}
