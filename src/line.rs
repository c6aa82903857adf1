//! Line documents and their internal marker fields.
//!
//! A line is one row of a REST dataset, stored as a JSON document keyed by
//! `_id`. Besides the user-defined schema fields, the engine maintains a set
//! of internal `_`-prefixed markers:
//!
//! - `_hash`: content digest of the logical body, `null` when deleted
//! - `_deleted`: soft-delete flag (physical removal is deferred, see
//!   [`crate::index_sync`])
//! - `_updatedAt`: RFC 3339 write timestamp
//! - `_i`: ordering indice, unique per dataset (see [`crate::indice`])
//! - `_needsIndexing` / `_needsExtending`: sparse markers drained by the
//!   external indexing and enrichment pipelines
//! - `_updatedBy` / `_updatedByName`: optional attribution
//! - `_owner` / `_ownerName`: optional line-ownership scope columns

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

/// A line document. Field order is irrelevant; hashing canonicalizes.
pub type Doc = serde_json::Map<String, Value>;

pub const ID: &str = "_id";
pub const HASH: &str = "_hash";
pub const DELETED: &str = "_deleted";
pub const UPDATED_AT: &str = "_updatedAt";
pub const INDICE: &str = "_i";
pub const NEEDS_INDEXING: &str = "_needsIndexing";
pub const NEEDS_EXTENDING: &str = "_needsExtending";
pub const UPDATED_BY: &str = "_updatedBy";
pub const UPDATED_BY_NAME: &str = "_updatedByName";
pub const OWNER: &str = "_owner";
pub const OWNER_NAME: &str = "_ownerName";
pub const ACTION: &str = "_action";
pub const LINE_ID: &str = "_lineId";

/// Returns the `_id` of a document, if present.
pub fn doc_id(doc: &Doc) -> Option<&str> {
    doc.get(ID).and_then(Value::as_str)
}

/// Returns a string field.
pub fn doc_str<'a>(doc: &'a Doc, key: &str) -> Option<&'a str> {
    doc.get(key).and_then(Value::as_str)
}

/// Returns the ordering indice `_i`.
pub fn doc_indice(doc: &Doc) -> Option<i64> {
    doc.get(INDICE).and_then(Value::as_i64)
}

/// Returns the `_hash`, with JSON `null` mapped to `None`.
pub fn doc_hash(doc: &Doc) -> Option<&str> {
    doc.get(HASH).and_then(Value::as_str)
}

/// Whether the line carries the soft-delete marker.
pub fn is_deleted(doc: &Doc) -> bool {
    doc.get(DELETED).and_then(Value::as_bool).unwrap_or(false)
}

/// Parses the `_updatedAt` timestamp.
pub fn updated_at(doc: &Doc) -> Option<DateTime<Utc>> {
    doc_str(doc, UPDATED_AT)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Formats a timestamp the way it is stored in documents.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Removes the pending-pipeline markers (`_needsIndexing`, `_needsExtending`).
pub fn strip_pending_flags(doc: &mut Doc) {
    doc.remove(NEEDS_INDEXING);
    doc.remove(NEEDS_EXTENDING);
}

/// Strips the internal markers that are never returned to API callers.
/// `_id`, `_updatedAt` and `_i` are kept.
pub fn clean_line(mut doc: Doc) -> Doc {
    doc.remove(NEEDS_INDEXING);
    doc.remove(NEEDS_EXTENDING);
    doc.remove(DELETED);
    doc.remove(ACTION);
    doc.remove(HASH);
    doc
}
