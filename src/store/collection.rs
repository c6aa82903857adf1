//! Line collections and revision logs.
//!
//! A [`Collection`] stores line documents keyed by `_id` and enforces a
//! unique ordering indice through a secondary tree keyed by the big-endian
//! `_i` value. Its [`Collection::bulk_write`] mirrors a document database's
//! unordered bulk call: per-item outcomes, duplicate-key conflicts reported
//! with the item index, no cross-item atomicity.
//!
//! A [`RevisionLog`] is append-only and keyed by `u64::MAX - _i` big-endian,
//! so a plain forward scan yields revisions in descending `_i` order — the
//! order the revision listing paginates in.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::line::{self, Doc};
use crate::store::{StoreError, StoreResult};

/// Selector applied to the stored document before a replace or upsert.
#[derive(Clone, Debug)]
pub struct DocFilter {
    /// Target line id.
    pub id: String,

    /// Ownership scope: the stored `_owner` column must equal this value.
    pub owner: Option<String>,

    /// Hash gate: the stored `_hash` must differ from this value. This is
    /// what makes `createOrUpdate` safe against redundant concurrent
    /// duplicate writes — an unchanged document matches nothing and the
    /// upsert degenerates into an insert attempt that conflicts.
    pub hash_ne: Option<String>,
}

impl DocFilter {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner: None,
            hash_ne: None,
        }
    }

    fn matches(&self, doc: &Doc) -> bool {
        if let Some(owner) = &self.owner {
            if line::doc_str(doc, line::OWNER) != Some(owner.as_str()) {
                return false;
            }
        }
        if let Some(hash) = &self.hash_ne {
            if line::doc_hash(doc) == Some(hash.as_str()) {
                return false;
            }
        }
        true
    }
}

/// One item of a bulk write.
#[derive(Clone, Debug)]
pub enum WriteOp {
    /// Insert a new document; conflicts when the id (or `_i`) exists.
    Insert(Doc),

    /// Replace the document matching the filter; a no-op when unmatched.
    Replace { filter: DocFilter, doc: Doc },

    /// Replace when the filter matches, insert when the id is absent, and
    /// conflict when the document exists but the filter rejects it.
    FilteredUpsert { filter: DocFilter, doc: Doc },

    /// Physically remove a document (two-phase deletion endpoint).
    Remove { id: String },
}

/// Why a bulk item failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteErrorKind {
    /// Unique constraint violated (`_id` or `_i`).
    DuplicateKey,

    /// Anything else the store reported.
    Store,
}

/// Per-item bulk write failure.
#[derive(Clone, Debug)]
pub struct WriteError {
    /// Index of the failing op in the submitted batch.
    pub index: usize,
    pub kind: WriteErrorKind,
    pub message: String,
}

/// Counts and per-item errors from one bulk write.
#[derive(Clone, Debug, Default)]
pub struct BulkWriteResult {
    pub inserted: u64,
    pub modified: u64,
    pub upserted: u64,
    pub removed: u64,
    pub write_errors: Vec<WriteError>,
}

/// A line collection.
#[derive(Clone)]
pub struct Collection {
    name: String,
    docs: sled::Tree,
    indices: sled::Tree,
    write_lock: Arc<Mutex<()>>,
}

impl Collection {
    pub(crate) fn new(
        name: String,
        docs: sled::Tree,
        indices: sled::Tree,
        write_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            name,
            docs,
            indices,
            write_lock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn decode(&self, bytes: &[u8]) -> StoreResult<Doc> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt {
            collection: self.name.clone(),
            message: e.to_string(),
        })
    }

    fn encode(doc: &Doc) -> Vec<u8> {
        // Map<String, Value> serialization cannot fail
        serde_json::to_vec(doc).unwrap_or_default()
    }

    /// Point read by line id.
    pub fn get(&self, id: &str) -> StoreResult<Option<Doc>> {
        match self.docs.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(self.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Batched point reads, skipping missing ids. When `owner` is set only
    /// documents carrying that `_owner` column are returned.
    pub fn find_ids(&self, ids: &[String], owner: Option<&str>) -> StoreResult<Vec<Doc>> {
        let mut out = Vec::new();
        for id in ids {
            if let Some(doc) = self.get(id)? {
                if let Some(owner) = owner {
                    if line::doc_str(&doc, line::OWNER) != Some(owner) {
                        continue;
                    }
                }
                out.push(doc);
            }
        }
        Ok(out)
    }

    /// Full scan in id order.
    pub fn iter(&self) -> impl Iterator<Item = StoreResult<Doc>> + '_ {
        self.docs.iter().map(move |item| {
            let (_, bytes) = item?;
            self.decode(&bytes)
        })
    }

    /// Total document count (soft-deleted lines included).
    pub fn count(&self) -> u64 {
        self.docs.len() as u64
    }

    /// Counts documents satisfying a predicate.
    pub fn count_matching(&self, pred: impl Fn(&Doc) -> bool) -> StoreResult<u64> {
        let mut n = 0u64;
        for doc in self.iter() {
            if pred(&doc?) {
                n += 1;
            }
        }
        Ok(n)
    }

    fn indice_key(i: i64) -> [u8; 8] {
        (i as u64).to_be_bytes()
    }

    /// Claims the `_i` slot for `id`; duplicate-key error when another line
    /// already holds it.
    fn claim_indice(&self, i: i64, id: &str, index: usize) -> Result<(), WriteError> {
        let key = Self::indice_key(i);
        match self.indices.get(key) {
            Ok(Some(holder)) if holder.as_ref() != id.as_bytes() => Err(WriteError {
                index,
                kind: WriteErrorKind::DuplicateKey,
                message: format!("duplicate ordering indice {i}"),
            }),
            Ok(_) => match self.indices.insert(key, id.as_bytes()) {
                Ok(_) => Ok(()),
                Err(e) => Err(WriteError {
                    index,
                    kind: WriteErrorKind::Store,
                    message: e.to_string(),
                }),
            },
            Err(e) => Err(WriteError {
                index,
                kind: WriteErrorKind::Store,
                message: e.to_string(),
            }),
        }
    }

    fn release_indice(&self, i: i64) {
        let _ = self.indices.remove(Self::indice_key(i));
    }

    /// Executes an unordered bulk write. All items are attempted; failures
    /// are collected per item. The per-collection write mutex is held for
    /// the whole call so each item's read-check-write is atomic relative to
    /// concurrent bulk writes.
    pub fn bulk_write(&self, ops: Vec<WriteOp>) -> StoreResult<BulkWriteResult> {
        let _guard = self.write_lock.lock();
        let mut result = BulkWriteResult::default();

        for (index, op) in ops.into_iter().enumerate() {
            match self.apply_one(index, op) {
                Ok(outcome) => match outcome {
                    ItemOutcome::Inserted => result.inserted += 1,
                    ItemOutcome::Modified => result.modified += 1,
                    ItemOutcome::Upserted => result.upserted += 1,
                    ItemOutcome::Removed => result.removed += 1,
                    ItemOutcome::Unmatched => {}
                },
                Err(err) => {
                    debug!(
                        collection = %self.name,
                        index = err.index,
                        kind = ?err.kind,
                        "bulk write item failed"
                    );
                    result.write_errors.push(err);
                }
            }
        }

        Ok(result)
    }

    fn apply_one(&self, index: usize, op: WriteOp) -> Result<ItemOutcome, WriteError> {
        let store_err = |e: String| WriteError {
            index,
            kind: WriteErrorKind::Store,
            message: e,
        };

        match op {
            WriteOp::Insert(doc) => {
                let id = line::doc_id(&doc)
                    .ok_or_else(|| store_err("document without _id".to_string()))?
                    .to_string();
                if self
                    .docs
                    .contains_key(id.as_bytes())
                    .map_err(|e| store_err(e.to_string()))?
                {
                    return Err(WriteError {
                        index,
                        kind: WriteErrorKind::DuplicateKey,
                        message: format!("duplicate line id {id}"),
                    });
                }
                if let Some(i) = line::doc_indice(&doc) {
                    self.claim_indice(i, &id, index)?;
                }
                self.docs
                    .insert(id.as_bytes(), Self::encode(&doc))
                    .map_err(|e| store_err(e.to_string()))?;
                Ok(ItemOutcome::Inserted)
            }
            WriteOp::Replace { filter, doc } => {
                match self.replace_matching(index, &filter, doc)? {
                    true => Ok(ItemOutcome::Modified),
                    false => Ok(ItemOutcome::Unmatched),
                }
            }
            WriteOp::FilteredUpsert { filter, doc } => {
                let existing = self
                    .docs
                    .get(filter.id.as_bytes())
                    .map_err(|e| store_err(e.to_string()))?;
                match existing {
                    None => {
                        // no match, upsert inserts
                        if let Some(i) = line::doc_indice(&doc) {
                            self.claim_indice(i, &filter.id, index)?;
                        }
                        self.docs
                            .insert(filter.id.as_bytes(), Self::encode(&doc))
                            .map_err(|e| store_err(e.to_string()))?;
                        Ok(ItemOutcome::Upserted)
                    }
                    Some(_) => {
                        if self.replace_matching(index, &filter, doc)? {
                            Ok(ItemOutcome::Modified)
                        } else {
                            // the document exists but the filter rejected it
                            // (unchanged hash or foreign owner): the upsert's
                            // insert attempt conflicts on the id
                            Err(WriteError {
                                index,
                                kind: WriteErrorKind::DuplicateKey,
                                message: format!("duplicate line id {}", filter.id),
                            })
                        }
                    }
                }
            }
            WriteOp::Remove { id } => {
                let removed = self
                    .docs
                    .remove(id.as_bytes())
                    .map_err(|e| store_err(e.to_string()))?;
                match removed {
                    Some(bytes) => {
                        if let Ok(doc) = self.decode(&bytes) {
                            if let Some(i) = line::doc_indice(&doc) {
                                self.release_indice(i);
                            }
                        }
                        Ok(ItemOutcome::Removed)
                    }
                    None => Ok(ItemOutcome::Unmatched),
                }
            }
        }
    }

    /// Replaces the document matching `filter`, maintaining the `_i` index.
    /// Returns false when nothing matched.
    fn replace_matching(
        &self,
        index: usize,
        filter: &DocFilter,
        doc: Doc,
    ) -> Result<bool, WriteError> {
        let store_err = |e: String| WriteError {
            index,
            kind: WriteErrorKind::Store,
            message: e,
        };

        let Some(bytes) = self
            .docs
            .get(filter.id.as_bytes())
            .map_err(|e| store_err(e.to_string()))?
        else {
            return Ok(false);
        };
        let existing = self.decode(&bytes).map_err(|e| store_err(e.to_string()))?;
        if !filter.matches(&existing) {
            return Ok(false);
        }

        let old_i = line::doc_indice(&existing);
        let new_i = line::doc_indice(&doc);
        if old_i != new_i {
            if let Some(i) = new_i {
                self.claim_indice(i, &filter.id, index)?;
            }
            if let Some(i) = old_i {
                self.release_indice(i);
            }
        }
        self.docs
            .insert(filter.id.as_bytes(), Self::encode(&doc))
            .map_err(|e| store_err(e.to_string()))?;
        Ok(true)
    }
}

enum ItemOutcome {
    Inserted,
    Modified,
    Upserted,
    Removed,
    Unmatched,
}

/// Append-only revision storage for one dataset.
#[derive(Clone)]
pub struct RevisionLog {
    name: String,
    tree: sled::Tree,
}

impl RevisionLog {
    pub(crate) fn new(name: String, tree: sled::Tree) -> Self {
        Self { name, tree }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key layout: `u64::MAX - _i` big-endian plus a collision suffix, so
    /// ascending key order is descending `_i` order and two revisions that
    /// happen to share an `_i` both survive.
    fn rev_key(i: i64, suffix: u32) -> [u8; 12] {
        let mut key = [0u8; 12];
        key[..8].copy_from_slice(&(u64::MAX - i as u64).to_be_bytes());
        key[8..].copy_from_slice(&suffix.to_be_bytes());
        key
    }

    fn decode(&self, bytes: &[u8]) -> StoreResult<Doc> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt {
            collection: self.name.clone(),
            message: e.to_string(),
        })
    }

    /// Appends a batch of revision rows (each must carry `_i`). An `_i`
    /// already present in the log gets the next free suffix instead of
    /// overwriting the stored revision.
    pub fn append_batch(&self, revisions: &[Doc]) -> StoreResult<()> {
        let mut batch = sled::Batch::default();
        let mut claimed = std::collections::HashSet::new();
        for rev in revisions {
            let Some(i) = line::doc_indice(rev) else {
                continue;
            };
            let mut suffix = 0u32;
            let mut key = Self::rev_key(i, suffix);
            while claimed.contains(&key) || self.tree.contains_key(key)? {
                suffix += 1;
                key = Self::rev_key(i, suffix);
            }
            claimed.insert(key);
            batch.insert(&key, serde_json::to_vec(rev).unwrap_or_default());
        }
        self.tree.apply_batch(batch)?;
        Ok(())
    }

    /// Iterates revisions by descending `_i`, starting strictly below
    /// `before` when given.
    pub fn iter_desc(&self, before: Option<i64>) -> impl Iterator<Item = StoreResult<Doc>> + '_ {
        let iter = match before {
            // the max suffix skips every revision sharing `before`'s _i
            Some(b) => self.tree.range((
                std::ops::Bound::Excluded(Self::rev_key(b, u32::MAX).to_vec()),
                std::ops::Bound::Unbounded,
            )),
            None => self.tree.range::<Vec<u8>, _>(..),
        };
        iter.map(move |item| {
            let (_, bytes) = item?;
            self.decode(&bytes)
        })
    }

    /// Total number of revisions satisfying a predicate.
    pub fn count_matching(&self, pred: impl Fn(&Doc) -> bool) -> StoreResult<u64> {
        let mut n = 0u64;
        for rev in self.iter_desc(None) {
            if pred(&rev?) {
                n += 1;
            }
        }
        Ok(n)
    }

    pub fn len(&self) -> u64 {
        self.tree.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Removes revisions whose `_updatedAt` is older than the cutoff.
    /// Returns the number removed.
    pub fn remove_older_than(&self, cutoff: chrono::DateTime<chrono::Utc>) -> StoreResult<u64> {
        let mut batch = sled::Batch::default();
        let mut removed = 0u64;
        for item in self.tree.iter() {
            let (key, bytes) = item?;
            let rev = self.decode(&bytes)?;
            if let Some(ts) = line::updated_at(&rev) {
                if ts < cutoff {
                    batch.remove(key);
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            self.tree.apply_batch(batch)?;
        }
        Ok(removed)
    }
}
