//! Records as the façade hands them out, and per-entity configuration.

use crate::error::{SyncError, SyncResult};
use chrono::Utc;
use larder_storage::RecordKey;
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix of client-generated ids that the server has not replaced yet.
pub const TEMP_ID_PREFIX: &str = "temp_";

/// Engine-owned fields stored next to the domain fields of every record.
pub const ENGINE_FIELDS: [&str; 4] = ["id", "_offline", "_pending_sync", "_deleted"];

/// Generates `temp_<millis>_<9 random chars>`.
pub fn generate_temp_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(9)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("{TEMP_ID_PREFIX}{}_{suffix}", Utc::now().timestamp_millis())
}

pub fn is_temp_id(key: &RecordKey) -> bool {
    key.as_str().is_some_and(|s| s.starts_with(TEMP_ID_PREFIX))
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A stored entity: domain fields plus the engine's sync flags.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record<T> {
    pub id: RecordKey,
    #[serde(flatten)]
    pub data: T,
    /// Last write did not reach the server.
    #[serde(rename = "_offline", default)]
    pub offline: bool,
    /// The action log still holds an unsynced action for this record.
    #[serde(rename = "_pending_sync", default)]
    pub pending_sync: bool,
    /// Soft-delete marker, set while a DELETE waits for replay.
    #[serde(rename = "_deleted", default, skip_serializing_if = "is_false")]
    pub deleted: bool,
}

impl<T> Record<T> {
    pub fn is_temporary(&self) -> bool {
        is_temp_id(&self.id)
    }
}

impl<T: Serialize + for<'de> Deserialize<'de>> Record<T> {
    /// Decodes a server response body; the server's copy carries no pending work.
    pub fn from_server(value: Value) -> SyncResult<Self> {
        if value.get("id").and_then(RecordKey::from_value).is_none() {
            return Err(SyncError::InvalidResponse(format!(
                "record without an id: {value}"
            )));
        }
        let mut record: Self = serde_json::from_value(value)?;
        record.offline = false;
        record.pending_sync = false;
        record.deleted = false;
        Ok(record)
    }

    pub fn to_value(&self) -> SyncResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_stored(value: Value) -> SyncResult<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// The request payload: domain fields only.
    pub fn payload(&self) -> SyncResult<Value> {
        Ok(serde_json::to_value(&self.data)?)
    }
}

/// Where an entity type lives locally and remotely.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityConfig {
    /// Name recorded in the action log.
    pub entity_type: String,
    /// Local partition.
    pub partition: String,
    /// Collection endpoint, e.g. `/api/suppliers`.
    pub endpoint: String,
}

impl EntityConfig {
    pub fn new(
        entity_type: impl Into<String>,
        partition: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            partition: partition.into(),
            endpoint: endpoint.into(),
        }
    }

    pub fn collection_url(&self) -> &str {
        &self.endpoint
    }

    pub fn item_url(&self, id: &RecordKey) -> String {
        format!("{}/{id}", self.endpoint.trim_end_matches('/'))
    }

    pub fn menu_items() -> Self {
        Self::new("menu_item", "menu_items", "/api/menu-items")
    }

    pub fn inventory_items() -> Self {
        Self::new("inventory_item", "inventory_items", "/api/inventory")
    }

    pub fn suppliers() -> Self {
        Self::new("supplier", "suppliers", "/api/suppliers")
    }

    pub fn recipes() -> Self {
        Self::new("recipe", "recipes", "/api/recipes")
    }

    pub fn purchase_orders() -> Self {
        Self::new("purchase_order", "purchase_orders", "/api/purchase-orders")
    }

    pub fn users() -> Self {
        Self::new("user", "users", "/api/users")
    }
}

/// Copies the fields of `patch` over `base`, top level only.
/// Engine-owned fields in `patch` are ignored.
pub(crate) fn merge_shallow(base: &mut Value, patch: &Value) -> SyncResult<()> {
    let Some(patch) = patch.as_object() else {
        return Err(SyncError::InvalidInput("update patch must be a JSON object".into()));
    };
    let Some(base) = base.as_object_mut() else {
        return Err(SyncError::InvalidInput("record data must be a JSON object".into()));
    };
    for (k, v) in patch {
        if !ENGINE_FIELDS.contains(&k.as_str()) {
            base.insert(k.clone(), v.clone());
        }
    }
    Ok(())
}
