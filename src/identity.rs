//! Line identity and content hashing.
//!
//! When a dataset declares a primary key, the line id is derived from the
//! key values so that "delete by primary key" and explicit-id consistency
//! checks work. The content hash is a CRC32 over a canonical serialization
//! of the logical body; it backs both idempotency (identical resubmission
//! reads back as "not modified") and the hash-gated upsert filter.

use base64::Engine as _;
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::dataset::PrimaryKeyMode;
use crate::line::Doc;

/// Derives the line id from the configured primary key, or `None` when the
/// dataset has no primary key (ids are then random).
pub fn derive_id(body: &Doc, primary_key: &[String], mode: PrimaryKeyMode) -> Option<String> {
    if primary_key.is_empty() {
        return None;
    }
    let values: Vec<String> = primary_key
        .iter()
        .map(|k| stringify(body.get(k)))
        .collect();
    // serializing a Vec<String> cannot fail
    let encoded = serde_json::to_string(&values).unwrap_or_default();
    match mode {
        PrimaryKeyMode::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(encoded.as_bytes());
            Some(hex(&hasher.finalize()))
        }
        PrimaryKeyMode::Legacy => {
            // outer brackets and their adjoining quotes stripped, kept for
            // ids minted before the sha256 mode existed
            let inner = encoded
                .get(2..encoded.len().saturating_sub(2))
                .unwrap_or("");
            Some(base64::engine::general_purpose::STANDARD.encode(inner))
        }
    }
}

/// Content hash of a logical body: CRC32 over the canonical serialization
/// (object keys sorted recursively), lowercase hex.
pub fn content_hash(body: &Doc) -> String {
    let mut out = String::new();
    canonical_object(body, &mut out);
    format!("{:x}", crc32fast::hash(out.as_bytes()))
}

/// Random id for create-like operations on datasets without a primary key.
pub fn random_line_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Stringification of a primary-key value, matching JS `value + ''`.
fn stringify(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => other.to_string(),
        None => "null".to_string(),
    }
}

fn canonical_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => canonical_object(map, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                canonical_value(item, out);
            }
            out.push(']');
        }
        scalar => {
            // scalar serialization cannot fail
            out.push_str(&serde_json::to_string(scalar).unwrap_or_default());
        }
    }
}

fn canonical_object(map: &Doc, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    out.push('{');
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&serde_json::to_string(key).unwrap_or_default());
        out.push(':');
        canonical_value(&map[key.as_str()], out);
    }
    out.push('}');
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
