//! SQLite storage layer for Larder.
//!
//! A durable, per-device object store organized into named partitions.
//! Records are JSON documents keyed by a field of the document itself;
//! partitions may declare secondary indexes over top-level fields.
//!
//! # Architecture
//!
//! - All partitions share one `records` table keyed by `(partition, key)`
//! - Declared indexes become SQLite expression indexes over `json_extract`
//! - Auto-increment counters live in the `partitions` table and never go backwards
//! - `PRAGMA user_version` tracks the schema version; a bump re-runs migration
//!
//! The action log and report cache are ordinary partitions with helper
//! methods in [`action_log`] and [`cache`].

mod error;
mod object_store;

pub mod action_log;
pub mod backup;
pub mod cache;
pub mod schema;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use object_store::{LocalStore, StoreLocation, StoreTxn};
pub use schema::{IndexDef, PartitionDef, StoreSchema};
pub use types::*;

use std::path::Path;
use tracing::warn;

/// Open an SQLite connection with the pragmas every store connection uses.
///
/// Any failure here means the device cannot offer durable storage at all,
/// so it is reported as [`StorageError::Unavailable`].
pub fn open_sqlite(path: &Path) -> StorageResult<rusqlite::Connection> {
    let conn = rusqlite::Connection::open(path).map_err(|e| {
        warn!("failed to open local store at {}: {e}", path.display());
        StorageError::Unavailable(format!("{}: {e}", path.display()))
    })?;
    apply_pragmas(&conn).map_err(|e| StorageError::Unavailable(e.to_string()))?;
    Ok(conn)
}

/// Open a private in-memory SQLite connection (tests, ephemeral sessions).
pub fn open_sqlite_in_memory() -> StorageResult<rusqlite::Connection> {
    let conn = rusqlite::Connection::open_in_memory()
        .map_err(|e| StorageError::Unavailable(e.to_string()))?;
    apply_pragmas(&conn).map_err(|e| StorageError::Unavailable(e.to_string()))?;
    Ok(conn)
}

fn apply_pragmas(conn: &rusqlite::Connection) -> StorageResult<()> {
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    // journal_mode returns a row, so it cannot go through execute_batch
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
    conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
    Ok(())
}
