//! Whole-store export and import for manual backup/restore.

use crate::error::{StorageError, StorageResult};
use crate::object_store::{write_record, LocalStore, WriteMode};
use crate::types::{Backup, BACKUP_FORMAT_VERSION};
use chrono::Utc;
use rusqlite::params;
use std::collections::BTreeMap;
use tracing::info;

impl LocalStore {
    /// Serializes every partition into one document.
    pub fn export_backup(&self) -> StorageResult<Backup> {
        let mut partitions = BTreeMap::new();
        for def in self.schema().partitions() {
            partitions.insert(def.name.clone(), self.get_all(&def.name)?);
        }
        Ok(Backup {
            format_version: BACKUP_FORMAT_VERSION,
            schema_version: self.schema().version,
            exported_at: Utc::now(),
            partitions,
        })
    }

    /// Replaces the contents of every partition present in `backup`.
    ///
    /// Runs in a single transaction: a bad record leaves the store untouched.
    /// Partitions missing from the document keep their current contents.
    pub fn import_backup(&self, backup: &Backup) -> StorageResult<usize> {
        if backup.format_version > BACKUP_FORMAT_VERSION {
            return Err(StorageError::InvalidRecord(format!(
                "backup format v{} is newer than supported v{BACKUP_FORMAT_VERSION}",
                backup.format_version
            )));
        }
        let defs = backup
            .partitions
            .keys()
            .map(|name| self.schema().require(name).cloned())
            .collect::<StorageResult<Vec<_>>>()?;

        let imported = self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut imported = 0;
            for def in &defs {
                tx.execute("DELETE FROM records WHERE partition = ?1", params![def.name])?;
                for item in backup.partitions.get(&def.name).into_iter().flatten() {
                    write_record(&tx, def, item.clone(), WriteMode::Add)?;
                    imported += 1;
                }
            }
            tx.commit()?;
            Ok(imported)
        })?;

        info!("imported {imported} records from backup taken at {}", backup.exported_at);
        Ok(imported)
    }
}
