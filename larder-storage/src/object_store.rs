//! Partitioned object store: JSON records keyed per partition, with
//! optional secondary indexes.
//!
//! The connection is opened lazily on first use and shared by every clone
//! of the handle. Opening runs the (idempotent) schema migration, so a
//! fresh database and a version bump take the same path.

use crate::error::{StorageError, StorageResult};
use crate::schema::{PartitionDef, StoreSchema};
use crate::types::RecordKey;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Where the store keeps its data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreLocation {
    File(PathBuf),
    Memory,
}

/// Handle to the local object store. Cheap to clone.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    location: StoreLocation,
    schema: StoreSchema,
    conn: Mutex<Option<Connection>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteMode {
    Add,
    Put,
}

impl LocalStore {
    /// Creates a handle without touching the disk. The database is opened
    /// on the first operation (or an explicit [`init`](Self::init)).
    pub fn lazy(location: StoreLocation, schema: StoreSchema) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                location,
                schema,
                conn: Mutex::new(None),
            }),
        }
    }

    /// Opens or creates a store at the given path.
    pub fn open(path: &Path, schema: StoreSchema) -> StorageResult<Self> {
        let store = Self::lazy(StoreLocation::File(path.to_path_buf()), schema);
        store.init()?;
        Ok(store)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory(schema: StoreSchema) -> StorageResult<Self> {
        let store = Self::lazy(StoreLocation::Memory, schema);
        store.init()?;
        Ok(store)
    }

    pub fn schema(&self) -> &StoreSchema {
        &self.inner.schema
    }

    pub fn location(&self) -> &StoreLocation {
        &self.inner.location
    }

    /// Opens the database if it is not open yet. Idempotent.
    ///
    /// Callers racing here serialize on the connection lock; the first one
    /// opens, the rest find the handle already in place.
    pub fn init(&self) -> StorageResult<()> {
        let mut guard = self.lock()?;
        self.ensure_open(&mut guard)?;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    /// Drops the current connection, as happens when another process
    /// upgrades the database. The next operation reopens it.
    ///
    /// In-memory stores keep their connection: dropping it would lose the data.
    pub fn invalidate(&self) -> StorageResult<()> {
        if self.inner.location == StoreLocation::Memory {
            debug!("ignoring invalidate on in-memory store");
            return Ok(());
        }
        let mut guard = self.lock()?;
        if guard.take().is_some() {
            debug!("local store connection invalidated");
        }
        Ok(())
    }

    fn reopen(&self) -> StorageResult<()> {
        self.invalidate()?;
        self.init()
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Option<Connection>>> {
        self.inner.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn ensure_open<'a>(
        &self,
        guard: &'a mut MutexGuard<'_, Option<Connection>>,
    ) -> StorageResult<&'a mut Connection> {
        if guard.is_none() {
            let mut conn = match &self.inner.location {
                StoreLocation::File(path) => crate::open_sqlite(path)?,
                StoreLocation::Memory => crate::open_sqlite_in_memory()?,
            };
            migrate(&mut conn, &self.inner.schema).map_err(|e| match e {
                StorageError::Unavailable(_) | StorageError::InvalidSchema(_) => e,
                other => StorageError::Unavailable(other.to_string()),
            })?;
            **guard = Some(conn);
        }
        (**guard).as_mut().ok_or(StorageError::ConnectionClosed)
    }

    /// Runs `f` against the open connection, opening it first if needed.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut guard = self.lock()?;
        let conn = self.ensure_open(&mut guard)?;
        f(conn)
    }

    // ── Reads ──

    /// All records of a partition, integer keys first in numeric order,
    /// then string keys.
    pub fn get_all(&self, partition: &str) -> StorageResult<Vec<Value>> {
        let def = self.inner.schema.require(partition)?;
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT data FROM records WHERE partition = ?1 \
                 ORDER BY key_num IS NULL, key_num, key",
            )?;
            let rows = stmt.query_map(params![def.name], |row| row.get::<_, String>(0))?;
            let records: StorageResult<Vec<Value>> = rows.map(|r| decode(&r?)).collect();
            records
        })
    }

    pub fn get_by_id(&self, partition: &str, key: &RecordKey) -> StorageResult<Option<Value>> {
        let def = self.inner.schema.require(partition)?;
        self.with_conn(|conn| read_record(conn, &def.name, key))
    }

    pub fn count(&self, partition: &str) -> StorageResult<usize> {
        let def = self.inner.schema.require(partition)?;
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM records WHERE partition = ?1",
                params![def.name],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }

    /// All records whose indexed field equals `value`, in key order.
    ///
    /// If the connection turns out to be stale, the store is reopened and
    /// the query retried exactly once.
    pub fn get_by_index(&self, partition: &str, index: &str, value: &Value) -> StorageResult<Vec<Value>> {
        match self.query_index(partition, index, value) {
            Err(e) if e.is_connection_lost() => {
                warn!("index read on {partition}.{index} hit a stale connection, reopening: {e}");
                self.reopen()?;
                self.query_index(partition, index, value)
            }
            other => other,
        }
    }

    pub fn count_by_index(&self, partition: &str, index: &str, value: &Value) -> StorageResult<usize> {
        let (def, field) = self.index_field(partition, index)?;
        let (clause, param) = index_clause(&field, value)?;
        self.with_conn(|conn| {
            let sql = format!("SELECT COUNT(*) FROM records WHERE partition = ?1 AND {clause}");
            let n: i64 = conn.query_row(&sql, params![def, param], |row| row.get(0))?;
            Ok(n as usize)
        })
    }

    fn query_index(&self, partition: &str, index: &str, value: &Value) -> StorageResult<Vec<Value>> {
        let (def, field) = self.index_field(partition, index)?;
        let (clause, param) = index_clause(&field, value)?;
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT data FROM records WHERE partition = ?1 AND {clause} \
                 ORDER BY key_num IS NULL, key_num, key"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![def, param], |row| row.get::<_, String>(0))?;
            let records: StorageResult<Vec<Value>> = rows.map(|r| decode(&r?)).collect();
            records
        })
    }

    fn index_field(&self, partition: &str, index: &str) -> StorageResult<(String, String)> {
        let def = self.inner.schema.require(partition)?;
        let idx = def.index(index).ok_or_else(|| StorageError::UnknownIndex {
            partition: partition.to_string(),
            index: index.to_string(),
        })?;
        Ok((def.name.clone(), idx.field.clone()))
    }

    // ── Writes ──

    /// Inserts a record; fails with [`StorageError::DuplicateKey`] if the key exists.
    /// Returns the record's key (assigned here for auto-increment partitions).
    pub fn add(&self, partition: &str, value: Value) -> StorageResult<RecordKey> {
        let def = self.inner.schema.require(partition)?.clone();
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let key = write_record(&tx, &def, value, WriteMode::Add)?;
            tx.commit()?;
            Ok(key)
        })
    }

    /// Inserts or replaces a record.
    pub fn put(&self, partition: &str, value: Value) -> StorageResult<RecordKey> {
        let def = self.inner.schema.require(partition)?.clone();
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let key = write_record(&tx, &def, value, WriteMode::Put)?;
            tx.commit()?;
            Ok(key)
        })
    }

    /// Upserts every item in one transaction; nothing is written if any item fails.
    pub fn bulk_put(&self, partition: &str, items: Vec<Value>) -> StorageResult<Vec<RecordKey>> {
        let def = self.inner.schema.require(partition)?.clone();
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let keys = items
                .into_iter()
                .map(|item| write_record(&tx, &def, item, WriteMode::Put))
                .collect::<StorageResult<Vec<_>>>()?;
            tx.commit()?;
            debug!("bulk put {} records into {}", keys.len(), def.name);
            Ok(keys)
        })
    }

    /// Removes a record. Deleting a missing key is not an error.
    pub fn delete(&self, partition: &str, key: &RecordKey) -> StorageResult<bool> {
        let def = self.inner.schema.require(partition)?;
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM records WHERE partition = ?1 AND key = ?2",
                params![def.name, key.encode()],
            )?;
            Ok(n > 0)
        })
    }

    /// Removes every record of a partition whose indexed field equals `value`.
    pub fn delete_by_index(&self, partition: &str, index: &str, value: &Value) -> StorageResult<usize> {
        let (def, field) = self.index_field(partition, index)?;
        let (clause, param) = index_clause(&field, value)?;
        self.with_conn(|conn| {
            let sql = format!("DELETE FROM records WHERE partition = ?1 AND {clause}");
            Ok(conn.execute(&sql, params![def, param])?)
        })
    }

    /// Removes every record of a partition. Auto-increment counters are kept.
    pub fn clear(&self, partition: &str) -> StorageResult<usize> {
        let def = self.inner.schema.require(partition)?;
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM records WHERE partition = ?1", params![def.name])?;
            info!("cleared {n} records from {}", def.name);
            Ok(n)
        })
    }

    /// Runs `f` inside one transaction spanning every partition.
    ///
    /// Commits when `f` returns `Ok`; any error rolls back everything `f` wrote.
    pub fn transaction<T>(&self, f: impl FnOnce(&StoreTxn<'_>) -> StorageResult<T>) -> StorageResult<T> {
        let schema = &self.inner.schema;
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let out = f(&StoreTxn { conn: &tx, schema })?;
            tx.commit()?;
            Ok(out)
        })
    }
}

/// Writes staged inside [`LocalStore::transaction`].
pub struct StoreTxn<'a> {
    pub(crate) conn: &'a Connection,
    schema: &'a StoreSchema,
}

impl StoreTxn<'_> {
    pub(crate) fn def(&self, partition: &str) -> StorageResult<&PartitionDef> {
        self.schema.require(partition)
    }

    pub fn get_by_id(&self, partition: &str, key: &RecordKey) -> StorageResult<Option<Value>> {
        let def = self.def(partition)?;
        read_record(self.conn, &def.name, key)
    }

    pub fn put(&self, partition: &str, value: Value) -> StorageResult<RecordKey> {
        write_record(self.conn, self.def(partition)?, value, WriteMode::Put)
    }

    pub fn add(&self, partition: &str, value: Value) -> StorageResult<RecordKey> {
        write_record(self.conn, self.def(partition)?, value, WriteMode::Add)
    }

    pub fn delete(&self, partition: &str, key: &RecordKey) -> StorageResult<bool> {
        let def = self.def(partition)?;
        let n = self.conn.execute(
            "DELETE FROM records WHERE partition = ?1 AND key = ?2",
            params![def.name, key.encode()],
        )?;
        Ok(n > 0)
    }
}

// ── Row helpers ──

fn decode(raw: &str) -> StorageResult<Value> {
    Ok(serde_json::from_str(raw)?)
}

pub(crate) fn read_record(conn: &Connection, partition: &str, key: &RecordKey) -> StorageResult<Option<Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT data FROM records WHERE partition = ?1 AND key = ?2",
            params![partition, key.encode()],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|r| decode(&r)).transpose()
}

/// Writes one record inside the caller's transaction.
pub(crate) fn write_record(
    conn: &Connection,
    def: &PartitionDef,
    mut value: Value,
    mode: WriteMode,
) -> StorageResult<RecordKey> {
    let Some(obj) = value.as_object_mut() else {
        return Err(StorageError::InvalidRecord(format!(
            "{} records must be JSON objects",
            def.name
        )));
    };

    let existing = obj.get(&def.key_field).and_then(RecordKey::from_value);
    let key = match existing {
        Some(key) => key,
        None if def.auto_increment => {
            let next = next_key(conn, &def.name)?;
            obj.insert(def.key_field.clone(), Value::from(next));
            RecordKey::Int(next)
        }
        None => {
            return Err(StorageError::InvalidRecord(format!(
                "{} record has no usable `{}`",
                def.name, def.key_field
            )));
        }
    };

    if def.auto_increment {
        if let RecordKey::Int(n) = key {
            conn.execute(
                "UPDATE partitions SET next_key = MAX(next_key, ?2) WHERE name = ?1",
                params![def.name, n + 1],
            )?;
        }
    }

    let encoded = key.encode();
    if mode == WriteMode::Add {
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM records WHERE partition = ?1 AND key = ?2",
                params![def.name, encoded],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StorageError::DuplicateKey {
                partition: def.name.clone(),
                key: key.to_string(),
            });
        }
    }

    let data = serde_json::to_string(&value)?;
    conn.execute(
        "INSERT OR REPLACE INTO records (partition, key, key_num, data) VALUES (?1, ?2, ?3, ?4)",
        params![def.name, encoded, key.sort_num(), data],
    )?;
    Ok(key)
}

fn next_key(conn: &Connection, partition: &str) -> StorageResult<i64> {
    let next: i64 = conn
        .query_row(
            "SELECT next_key FROM partitions WHERE name = ?1",
            params![partition],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StorageError::UnknownPartition(partition.to_string()))?;
    conn.execute(
        "UPDATE partitions SET next_key = ?2 WHERE name = ?1",
        params![partition, next + 1],
    )?;
    Ok(next)
}

pub(crate) fn json_path(field: &str) -> String {
    format!("json_extract(data, '$.{field}')")
}

/// Builds the WHERE fragment (parameter `?2`) matching an indexed field.
fn index_clause(field: &str, value: &Value) -> StorageResult<(String, rusqlite::types::Value)> {
    use rusqlite::types::Value as Sql;

    let expr = json_path(field);
    let param = match value {
        Value::Null => return Ok((format!("{expr} IS ?2"), Sql::Null)),
        Value::Bool(b) => Sql::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Sql::Integer(i),
            None => Sql::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Sql::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => {
            return Err(StorageError::InvalidRecord(
                "index lookups take scalar values".into(),
            ));
        }
    };
    Ok((format!("{expr} = ?2"), param))
}

// ── Schema ──

fn migrate(conn: &mut Connection, schema: &StoreSchema) -> StorageResult<()> {
    schema.validate()?;

    let stored: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if stored > schema.version {
        return Err(StorageError::Unavailable(format!(
            "database schema version {stored} is newer than supported version {}",
            schema.version
        )));
    }

    let tx = conn.transaction()?;
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS partitions (
            name TEXT PRIMARY KEY,
            key_field TEXT NOT NULL,
            auto_increment INTEGER NOT NULL DEFAULT 0,
            next_key INTEGER NOT NULL DEFAULT 1
        );
        CREATE TABLE IF NOT EXISTS records (
            partition TEXT NOT NULL,
            key TEXT NOT NULL,
            key_num INTEGER,
            data TEXT NOT NULL,
            PRIMARY KEY (partition, key)
        );
        "#,
    )?;

    for def in schema.partitions() {
        tx.execute(
            "INSERT INTO partitions (name, key_field, auto_increment) VALUES (?1, ?2, ?3) \
             ON CONFLICT(name) DO UPDATE SET key_field = excluded.key_field, \
             auto_increment = excluded.auto_increment",
            params![def.name, def.key_field, def.auto_increment],
        )?;
        for idx in &def.indexes {
            tx.execute_batch(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{}_{} ON records(partition, {});",
                def.name,
                idx.name,
                json_path(&idx.field)
            ))?;
        }
    }

    if stored < schema.version {
        tx.pragma_update(None, "user_version", schema.version)?;
        info!("local store migrated from schema v{stored} to v{}", schema.version);
    }
    tx.commit()?;
    Ok(())
}
