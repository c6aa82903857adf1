//! Dataset handles, REST configuration and the dataset catalog.
//!
//! The engine never owns dataset metadata; it receives a [`Dataset`] handle
//! per call and persists only the small catalog record (attribution stamps,
//! partial status, TTL bookkeeping) that the surrounding platform reads.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::indice::IndiceMode;
use crate::line::{self, Doc};
use crate::store::{Backend, StoreResult};

/// How line ids are derived from the primary key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimaryKeyMode {
    /// Base64 of the stripped JSON key array, for ids minted before sha256.
    Legacy,
    #[default]
    Sha256,
}

/// Declared JSON type of a schema field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
}

/// One field of the dataset schema.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchemaField {
    pub key: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,

    /// Computed by the platform, never written by callers.
    #[serde(default)]
    pub calculated: bool,

    /// Produced by the enrichment pipeline, never written by callers.
    #[serde(default)]
    pub extension: bool,

    /// Holds the relative path of the line's attachment.
    #[serde(default)]
    pub attachment: bool,
}

impl SchemaField {
    pub fn new(key: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            key: key.into(),
            field_type,
            calculated: false,
            extension: false,
            attachment: false,
        }
    }
}

/// Delay expressed as a value and unit.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TtlDelay {
    pub value: u64,
    pub unit: TtlUnit,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtlUnit {
    Seconds,
    Hours,
    Days,
}

impl TtlDelay {
    pub fn as_seconds(&self) -> i64 {
        let value = self.value as i64;
        match self.unit {
            TtlUnit::Seconds => value,
            TtlUnit::Hours => value * 3600,
            TtlUnit::Days => value * 86_400,
        }
    }
}

/// Expire-by-date sweep rule: lines whose `field` precedes `now - delay`
/// are deleted by [`crate::sweep::apply_ttl`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TtlRule {
    pub field: String,
    pub delay: TtlDelay,
}

/// REST-dataset configuration, read-only to the engine.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RestConfig {
    /// Keep one immutable revision per effective change.
    #[serde(default)]
    pub history: bool,

    /// Expiry policy for revisions, applied on `_updatedAt`.
    #[serde(default)]
    pub history_ttl: Option<TtlDelay>,

    #[serde(default)]
    pub primary_key_mode: PrimaryKeyMode,

    #[serde(default)]
    pub indice_mode: IndiceMode,

    /// Stamp `_updatedBy`/`_updatedByName` on writes.
    #[serde(default)]
    pub store_updated_by: bool,

    /// Schema failures become warnings instead of dropping the operation.
    #[serde(default)]
    pub non_blocking_validation: bool,

    /// Expire-by-date sweep rule.
    #[serde(default)]
    pub ttl: Option<TtlRule>,
}

/// A dataset handle: everything the engine needs to know about the dataset
/// it is writing to.
#[derive(Clone, Debug)]
pub struct Dataset {
    pub id: String,
    pub created_at: DateTime<Utc>,

    /// Ordered field list the line id derives from; empty means random ids.
    pub primary_key: Vec<String>,

    pub schema: Vec<SchemaField>,

    /// Bumped by the platform whenever the schema changes; keys the
    /// caller-owned validator cache.
    pub schema_version: u64,

    /// Whether an enrichment extension is active (writes are flagged
    /// `_needsExtending` instead of `_needsIndexing`).
    pub extensions_active: bool,

    pub rest: RestConfig,
}

impl Dataset {
    /// A fresh dataset with no schema and default REST settings.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            primary_key: Vec::new(),
            schema: Vec::new(),
            schema_version: 0,
            extensions_active: false,
            rest: RestConfig::default(),
        }
    }

    pub fn data_collection_name(&self) -> String {
        format!("dataset-data-{}", self.id)
    }

    pub fn revisions_collection_name(&self) -> String {
        format!("dataset-revisions-{}", self.id)
    }

    /// The schema field holding the attachment path, if any.
    pub fn attachment_field(&self) -> Option<&SchemaField> {
        self.schema.iter().find(|f| f.attachment)
    }

    /// Writable schema keys (neither calculated nor extension).
    pub fn writable_keys(&self) -> impl Iterator<Item = &str> {
        self.schema
            .iter()
            .filter(|f| !f.calculated && !f.extension)
            .map(|f| f.key.as_str())
    }
}

/// Creates the dataset's line collection, discarding any badly cleaned
/// leftovers from a previous dataset with the same id.
pub fn init_dataset(backend: &Backend, dataset: &Dataset) -> StoreResult<()> {
    delete_dataset(backend, dataset)?;
    backend.collection(&dataset.data_collection_name())?;
    Ok(())
}

/// Drops the dataset's line collection and revision log.
pub fn delete_dataset(backend: &Backend, dataset: &Dataset) -> StoreResult<()> {
    backend.drop_collection(&dataset.data_collection_name())?;
    backend.drop_collection(&dataset.revisions_collection_name())?;
    Ok(())
}

/// The caller performing a write, for attribution and privileged overrides.
#[derive(Clone, Debug)]
pub struct Actor {
    pub id: String,
    pub name: String,

    /// Privileged callers may override `_updatedAt` (history backfill).
    pub admin: bool,
}

/// Line-ownership scope for multi-tenant datasets: stamped as columns on
/// every written line and enforced as a filter on every targeted write.
#[derive(Clone, Debug)]
pub struct LinesOwner {
    pub owner_type: String,
    pub id: String,
    pub department: Option<String>,
    pub name: Option<String>,
    pub department_name: Option<String>,
}

impl LinesOwner {
    /// The `_owner` filter value.
    pub fn key(&self) -> String {
        match &self.department {
            Some(dep) => format!("{}:{}:{}", self.owner_type, self.id, dep),
            None => format!("{}:{}", self.owner_type, self.id),
        }
    }

    /// The `_owner`/`_ownerName` columns merged into written bodies.
    pub fn columns(&self) -> Doc {
        let mut cols = Doc::new();
        cols.insert(line::OWNER.to_string(), Value::String(self.key()));
        if let Some(name) = &self.name {
            let display = match (&self.department, &self.department_name) {
                (Some(dep), Some(_)) => format!("{name} ({dep})"),
                _ => name.clone(),
            };
            cols.insert(line::OWNER_NAME.to_string(), Value::String(display));
        }
        cols
    }
}

/// Attribution stamp kept on the catalog record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActorRef {
    pub id: String,
    pub name: String,
}

/// Per-dataset catalog record maintained by the engine for the platform's
/// status machine.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DatasetRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// Set when lines changed and the search index lags behind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_updated_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_updated_by: Option<ActorRef>,

    /// Revision expiry policy as applied by the last configure call;
    /// [`crate::history::expire_revisions`] reads it at sweep time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_ttl_seconds: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_checked_at: Option<DateTime<Utc>>,
}

/// Catalog of dataset records, stored in a fixed backend tree.
#[derive(Clone)]
pub struct Catalog {
    tree: sled::Tree,
}

impl Catalog {
    pub fn new(backend: &Backend) -> Self {
        Self {
            tree: backend.datasets_tree(),
        }
    }

    pub fn get(&self, dataset_id: &str) -> StoreResult<DatasetRecord> {
        match self.tree.get(dataset_id.as_bytes())? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
            None => Ok(DatasetRecord::default()),
        }
    }

    fn update(
        &self,
        dataset_id: &str,
        apply: impl FnOnce(&mut DatasetRecord),
    ) -> StoreResult<()> {
        let mut record = self.get(dataset_id)?;
        apply(&mut record);
        self.tree.insert(
            dataset_id.as_bytes(),
            serde_json::to_vec(&record).unwrap_or_default(),
        )?;
        Ok(())
    }

    /// Attribution stamp after any effective write.
    pub fn stamp_data_updated(
        &self,
        dataset_id: &str,
        at: DateTime<Utc>,
        by: Option<ActorRef>,
    ) -> StoreResult<()> {
        self.update(dataset_id, |r| {
            r.data_updated_at = Some(at);
            r.data_updated_by = by;
        })
    }

    pub fn set_status(&self, dataset_id: &str, status: &str) -> StoreResult<()> {
        self.update(dataset_id, |r| r.status = Some(status.to_string()))
    }

    pub fn set_partial_status(&self, dataset_id: &str, status: &str) -> StoreResult<()> {
        self.update(dataset_id, |r| r.partial_status = Some(status.to_string()))
    }

    pub fn set_history_ttl(&self, dataset_id: &str, seconds: Option<i64>) -> StoreResult<()> {
        self.update(dataset_id, |r| r.history_ttl_seconds = seconds)
    }

    pub fn set_ttl_checked(&self, dataset_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        self.update(dataset_id, |r| r.ttl_checked_at = Some(at))
    }
}

/// Storage-quota accounting hook: called best-effort after mutating calls.
/// Failures are logged by the engine and never propagated.
pub trait StorageAccounting: Send + Sync {
    fn storage_changed(&self, dataset_id: &str) -> anyhow::Result<()>;
}

/// Invokes the accounting hook and swallows (but logs) its failure.
pub(crate) fn notify_accounting(hook: Option<&Arc<dyn StorageAccounting>>, dataset_id: &str) {
    if let Some(hook) = hook {
        if let Err(err) = hook.storage_changed(dataset_id) {
            warn!(dataset = dataset_id, error = %err, "storage accounting failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BackendConfig;
    use tempfile::TempDir;

    #[test]
    fn test_owner_columns_and_key() {
        let owner = LinesOwner {
            owner_type: "organization".to_string(),
            id: "org1".to_string(),
            department: Some("dep1".to_string()),
            name: Some("Org One".to_string()),
            department_name: Some("Dep One".to_string()),
        };
        assert_eq!(owner.key(), "organization:org1:dep1");
        let cols = owner.columns();
        assert_eq!(cols["_owner"], "organization:org1:dep1");
        assert_eq!(cols["_ownerName"], "Org One (dep1)");
    }

    #[test]
    fn test_catalog_round_trip() {
        let dir = TempDir::new().unwrap();
        let backend = Backend::new(BackendConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();
        let catalog = Catalog::new(&backend);

        let at = Utc::now();
        catalog
            .stamp_data_updated(
                "ds1",
                at,
                Some(ActorRef {
                    id: "u1".to_string(),
                    name: "User".to_string(),
                }),
            )
            .unwrap();
        catalog.set_partial_status("ds1", "updated").unwrap();

        let record = catalog.get("ds1").unwrap();
        assert_eq!(record.data_updated_by.unwrap().id, "u1");
        assert_eq!(record.partial_status.as_deref(), Some("updated"));
        assert!(record.data_updated_at.is_some());
    }

    #[test]
    fn test_ttl_delay_units() {
        let d = TtlDelay {
            value: 2,
            unit: TtlUnit::Days,
        };
        assert_eq!(d.as_seconds(), 172_800);
    }
}
