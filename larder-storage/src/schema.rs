//! Partition and index declarations for the local store.
//!
//! Every store carries three built-in partitions next to the entity
//! partitions supplied by the application:
//! - [`ACTION_LOG`]: auto-increment keys, indexed on `entity_type`, `status`, `timestamp`
//! - [`CACHE`]: keyed by cache key
//! - [`ID_ALIASES`]: temporary id → server id mappings recorded during replay

use crate::error::{StorageError, StorageResult};

/// Offline action log partition.
pub const ACTION_LOG: &str = "offline_actions";
/// Report cache partition.
pub const CACHE: &str = "report_cache";
/// Temporary-id alias partition.
pub const ID_ALIASES: &str = "id_aliases";

/// Current schema version. Bump when partitions or indexes change.
pub const SCHEMA_VERSION: u32 = 1;

/// A secondary index over one top-level field of a partition's records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexDef {
    pub name: String,
    pub field: String,
}

impl IndexDef {
    pub fn new(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field: field.into(),
        }
    }

    /// Index named after the field it covers.
    pub fn on(field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            name: field.clone(),
            field,
        }
    }
}

/// A named collection of records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionDef {
    pub name: String,
    /// Field of each record holding its key.
    pub key_field: String,
    /// Assign monotonically increasing integer keys to records without one.
    pub auto_increment: bool,
    pub indexes: Vec<IndexDef>,
}

impl PartitionDef {
    /// Entity partition keyed by `id`.
    pub fn entity(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_field: "id".into(),
            auto_increment: false,
            indexes: Vec::new(),
        }
    }

    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn index(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.iter().find(|i| i.name == name)
    }
}

/// Versioned set of partitions opened by a [`LocalStore`](crate::LocalStore).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreSchema {
    pub version: u32,
    partitions: Vec<PartitionDef>,
}

impl StoreSchema {
    /// Schema holding only the built-in partitions.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            partitions: vec![
                PartitionDef {
                    name: ACTION_LOG.into(),
                    key_field: "id".into(),
                    auto_increment: true,
                    indexes: vec![
                        IndexDef::on("entity_type"),
                        IndexDef::on("status"),
                        IndexDef::on("timestamp"),
                    ],
                },
                PartitionDef {
                    name: CACHE.into(),
                    key_field: "key".into(),
                    auto_increment: false,
                    indexes: Vec::new(),
                },
                PartitionDef {
                    name: ID_ALIASES.into(),
                    key_field: "temp_id".into(),
                    auto_increment: false,
                    indexes: Vec::new(),
                },
            ],
        }
    }

    /// Adds (or replaces) a partition declaration.
    pub fn with_partition(mut self, def: PartitionDef) -> Self {
        self.partitions.retain(|p| p.name != def.name);
        self.partitions.push(def);
        self
    }

    /// The restaurant back-office partitions.
    pub fn restaurant() -> Self {
        Self::new(SCHEMA_VERSION)
            .with_partition(PartitionDef::entity("menu_items").with_index(IndexDef::on("category")))
            .with_partition(
                PartitionDef::entity("inventory_items")
                    .with_index(IndexDef::on("category"))
                    .with_index(IndexDef::on("supplier_id")),
            )
            .with_partition(PartitionDef::entity("suppliers").with_index(IndexDef::on("name")))
            .with_partition(PartitionDef::entity("recipes").with_index(IndexDef::on("menu_item_id")))
            .with_partition(PartitionDef::entity("purchase_orders").with_index(IndexDef::on("supplier_id")))
            .with_partition(PartitionDef::entity("users").with_index(IndexDef::on("role")))
    }

    pub fn partition(&self, name: &str) -> Option<&PartitionDef> {
        self.partitions.iter().find(|p| p.name == name)
    }

    pub fn partitions(&self) -> &[PartitionDef] {
        &self.partitions
    }

    pub(crate) fn require(&self, name: &str) -> StorageResult<&PartitionDef> {
        self.partition(name)
            .ok_or_else(|| StorageError::UnknownPartition(name.to_string()))
    }

    /// Checks names are safe to splice into SQL identifiers and JSON paths.
    pub fn validate(&self) -> StorageResult<()> {
        if self.version == 0 {
            return Err(StorageError::InvalidSchema("version must be at least 1".into()));
        }
        for p in &self.partitions {
            check_ident(&p.name)?;
            check_ident(&p.key_field)?;
            for i in &p.indexes {
                check_ident(&i.name)?;
                check_ident(&i.field)?;
            }
        }
        Ok(())
    }
}

impl Default for StoreSchema {
    fn default() -> Self {
        Self::new(SCHEMA_VERSION)
    }
}

fn check_ident(name: &str) -> StorageResult<()> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(StorageError::InvalidSchema(format!("invalid name: {name:?}")))
    }
}
