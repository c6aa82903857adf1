//! Two-phase synchronization with the external search index.
//!
//! Phase one snapshots the lines flagged as pending and hands them to the
//! indexer; phase two acknowledges them. Acknowledgement re-reads each line
//! and only acts when its `_updatedAt` still matches the snapshot: an
//! unchanged tombstone is physically removed, an unchanged live line has
//! its pending flag cleared, and a line written in between keeps its flag
//! so the next cycle picks it up again.

use serde_json::Value;
use tracing::debug;

use crate::line::{self, Doc};
use crate::store::{Collection, DocFilter, StoreResult, WriteOp};

/// Which pending marker a cycle is draining.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingFlag {
    /// Waiting for the search index.
    Indexing,
    /// Waiting for an enrichment extension (which then requeues for
    /// indexing).
    Extending,
}

impl PendingFlag {
    pub fn key(&self) -> &'static str {
        match self {
            PendingFlag::Indexing => line::NEEDS_INDEXING,
            PendingFlag::Extending => line::NEEDS_EXTENDING,
        }
    }
}

/// A snapshot entry handed to the indexer: the line id and the timestamp it
/// carried when read.
#[derive(Clone, Debug)]
pub struct IndexedLine {
    pub id: String,
    pub updated_at: String,
}

impl IndexedLine {
    pub fn from_doc(doc: &Doc) -> Option<Self> {
        Some(Self {
            id: line::doc_id(doc)?.to_string(),
            updated_at: line::doc_str(doc, line::UPDATED_AT)?.to_string(),
        })
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct MarkOutcome {
    /// Lines whose pending flag was cleared.
    pub cleared: u64,
    /// Acknowledged tombstones physically removed.
    pub removed: u64,
    /// Lines rewritten since the snapshot, left flagged.
    pub requeued: u64,
}

pub fn count_pending(collection: &Collection, flag: PendingFlag) -> StoreResult<u64> {
    let key = flag.key();
    collection.count_matching(|doc| doc.get(key) == Some(&Value::Bool(true)))
}

/// Reads up to `limit` flagged lines, internal markers included.
pub fn pending_lines(
    collection: &Collection,
    flag: PendingFlag,
    limit: usize,
) -> StoreResult<Vec<Doc>> {
    let key = flag.key();
    let mut out = Vec::new();
    for doc in collection.iter() {
        let doc = doc?;
        if doc.get(key) == Some(&Value::Bool(true)) {
            out.push(doc);
            if out.len() == limit {
                break;
            }
        }
    }
    Ok(out)
}

/// Phase-two acknowledgement for a batch of indexed lines.
pub fn mark_indexed(collection: &Collection, seen: &[IndexedLine]) -> StoreResult<MarkOutcome> {
    let mut outcome = MarkOutcome::default();
    let mut writes: Vec<WriteOp> = Vec::new();
    for entry in seen {
        let Some(stored) = collection.get(&entry.id)? else {
            continue;
        };
        if line::doc_str(&stored, line::UPDATED_AT) != Some(entry.updated_at.as_str()) {
            outcome.requeued += 1;
            continue;
        }
        if line::is_deleted(&stored) {
            writes.push(WriteOp::Remove {
                id: entry.id.clone(),
            });
        } else {
            let mut doc = stored;
            line::strip_pending_flags(&mut doc);
            writes.push(WriteOp::Replace {
                filter: DocFilter::by_id(&entry.id),
                doc,
            });
        }
    }
    if !writes.is_empty() {
        let bulk = collection.bulk_write(writes)?;
        outcome.cleared = bulk.modified;
        outcome.removed = bulk.removed;
    }
    debug!(
        collection = collection.name(),
        cleared = outcome.cleared,
        removed = outcome.removed,
        requeued = outcome.requeued,
        "acknowledged indexed lines"
    );
    Ok(outcome)
}

/// Writes enrichment results back onto their lines: merges the extension's
/// fields, drops the extending flag and requeues the line for indexing.
/// Each entry must carry `_id`; entries whose line vanished are skipped.
pub fn write_extended(collection: &Collection, extended: Vec<Doc>) -> StoreResult<u64> {
    let mut writes: Vec<WriteOp> = Vec::new();
    for entry in extended {
        let Some(id) = line::doc_id(&entry).map(str::to_string) else {
            continue;
        };
        let Some(mut stored) = collection.get(&id)? else {
            continue;
        };
        for (k, v) in entry {
            if k == line::ID {
                continue;
            }
            stored.insert(k, v);
        }
        stored.remove(line::NEEDS_EXTENDING);
        stored.insert(line::NEEDS_INDEXING.to_string(), Value::Bool(true));
        writes.push(WriteOp::Replace {
            filter: DocFilter::by_id(&id),
            doc: stored,
        });
    }
    if writes.is_empty() {
        return Ok(0);
    }
    Ok(collection.bulk_write(writes)?.modified)
}
