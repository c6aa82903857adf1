//! Schema validation seam.
//!
//! The platform compiles a validator from the dataset's declared schema and
//! hands it to the engine per call; validation failures are hard (400, the
//! operation is dropped) or soft (attached as a warning) depending on the
//! dataset's `non_blocking_validation` flag — that policy lives in the
//! engine, not here.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::dataset::{Dataset, FieldType};
use crate::line::{self, Doc};

/// Pluggable line validator.
pub trait LineValidator: Send + Sync {
    /// Returns a human-readable error message on failure.
    fn validate(&self, body: &Doc) -> Result<(), String>;
}

/// Validator compiled from the dataset schema: declared keys only
/// (additional properties rejected), JSON types checked. `_id` and the
/// ownership columns are always admitted; `_updatedAt` only on privileged
/// compiles (history backfill rewrites timestamps).
pub struct SchemaValidator {
    fields: HashMap<String, FieldType>,
    admin: bool,
}

impl SchemaValidator {
    pub fn compile(dataset: &Dataset, admin: bool) -> Self {
        let fields = dataset
            .schema
            .iter()
            .filter(|f| !f.calculated && !f.extension)
            .map(|f| (f.key.clone(), f.field_type))
            .collect();
        Self { fields, admin }
    }

    fn check_type(expected: FieldType, value: &Value) -> bool {
        match expected {
            FieldType::String => value.is_string() || value.is_null(),
            FieldType::Number => value.is_number() || value.is_null(),
            FieldType::Integer => value.is_i64() || value.is_u64() || value.is_null(),
            FieldType::Boolean => value.is_boolean() || value.is_null(),
        }
    }
}

impl LineValidator for SchemaValidator {
    fn validate(&self, body: &Doc) -> Result<(), String> {
        for (key, value) in body {
            match key.as_str() {
                line::ID | line::OWNER | line::OWNER_NAME => {
                    if !value.is_string() {
                        return Err(format!("field {key} must be a string"));
                    }
                }
                line::UPDATED_AT if self.admin => {
                    if line::updated_at(body).is_none() {
                        return Err("field _updatedAt must be an RFC 3339 date-time".to_string());
                    }
                }
                _ => match self.fields.get(key) {
                    Some(expected) if Self::check_type(*expected, value) => {}
                    Some(expected) => {
                        return Err(format!("field {key} is not of type {expected:?}"));
                    }
                    None => return Err(format!("unknown field {key}")),
                },
            }
        }
        Ok(())
    }
}

/// Caller-owned validator cache, keyed by dataset id plus schema version so
/// a schema change invalidates by key rather than by time.
#[derive(Default)]
pub struct ValidatorCache {
    compiled: DashMap<(String, u64, bool), Arc<SchemaValidator>>,
}

impl ValidatorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, dataset: &Dataset, admin: bool) -> Arc<SchemaValidator> {
        self.compiled
            .entry((dataset.id.clone(), dataset.schema_version, admin))
            .or_insert_with(|| Arc::new(SchemaValidator::compile(dataset, admin)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{RestConfig, SchemaField};
    use chrono::Utc;
    use serde_json::json;

    fn dataset() -> Dataset {
        Dataset {
            id: "ds1".to_string(),
            created_at: Utc::now(),
            primary_key: vec![],
            schema: vec![
                SchemaField::new("name", FieldType::String),
                SchemaField::new("size", FieldType::Integer),
            ],
            schema_version: 1,
            extensions_active: false,
            rest: RestConfig::default(),
        }
    }

    fn doc(v: serde_json::Value) -> Doc {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_accepts_declared_fields() {
        let v = SchemaValidator::compile(&dataset(), false);
        assert!(v
            .validate(&doc(json!({ "_id": "a", "name": "x", "size": 3 })))
            .is_ok());
    }

    #[test]
    fn test_rejects_unknown_field() {
        let v = SchemaValidator::compile(&dataset(), false);
        let err = v
            .validate(&doc(json!({ "_id": "a", "nope": 1 })))
            .unwrap_err();
        assert!(err.contains("unknown field"));
    }

    #[test]
    fn test_rejects_wrong_type() {
        let v = SchemaValidator::compile(&dataset(), false);
        assert!(v.validate(&doc(json!({ "size": "three" }))).is_err());
    }

    #[test]
    fn test_updated_at_admin_only() {
        let ds = dataset();
        let body = doc(json!({ "_updatedAt": "2024-01-01T00:00:00Z" }));
        assert!(SchemaValidator::compile(&ds, true).validate(&body).is_ok());
        assert!(SchemaValidator::compile(&ds, false).validate(&body).is_err());
    }

    #[test]
    fn test_cache_invalidates_on_schema_version() {
        let cache = ValidatorCache::new();
        let mut ds = dataset();
        let a = cache.get(&ds, false);
        ds.schema_version = 2;
        let b = cache.get(&ds, false);
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
