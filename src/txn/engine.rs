//! The staged write pipeline.
//!
//! A batch moves through fixed stages: normalize, resolve patch and delete
//! predecessors, validate and hash, detect create/update conflicts, execute
//! one bulk write, log revisions, stamp attribution. Operations knocked out
//! by an early stage (304/4xx) ride along so the caller gets one outcome per
//! submitted transaction, in submission order.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::attachments;
use crate::dataset::{notify_accounting, Actor, ActorRef, Dataset, LinesOwner};
use crate::history;
use crate::identity;
use crate::indice::IndiceGenerator;
use crate::line::{self, Doc};
use crate::store::{Collection, DocFilter, WriteErrorKind, WriteOp};
use crate::txn::{Action, Operation, TxnEngine, TxnError, TxnResult};
use crate::validate::LineValidator;

/// How often the pipeline yields back to the runtime on large batches.
const YIELD_EVERY: usize = 100;

/// Per-batch outcome: one [`Operation`] per submitted transaction plus the
/// raw counters from the bulk write.
#[derive(Debug)]
pub struct TxnOutcome {
    pub operations: Vec<Operation>,
    pub inserted: u64,
    pub modified: u64,
    pub upserted: u64,
    pub removed: u64,
}

impl TxnEngine {
    /// Applies a batch of raw transactions against a dataset.
    ///
    /// `target` overrides the destination collection (bulk loads in drop
    /// mode stage into a scratch collection); `None` resolves the dataset's
    /// live collection. Each transaction must carry `_id`; `_action`
    /// defaults are the caller's business, an unknown or missing action
    /// aborts the whole batch with [`TxnError::BadRequest`].
    pub async fn apply(
        &self,
        dataset: &Dataset,
        actor: Option<&Actor>,
        transactions: Vec<Doc>,
        validator: Option<&dyn LineValidator>,
        lines_owner: Option<&LinesOwner>,
        target: Option<&Collection>,
    ) -> TxnResult<TxnOutcome> {
        let collection = match target {
            Some(c) => c.clone(),
            None => self.backend().collection(&dataset.data_collection_name())?,
        };
        let updated_at = Utc::now();
        let owner_key = lines_owner.map(|o| o.key());
        let owner_columns = lines_owner.map(|o| o.columns());

        let mut indices = IndiceGenerator::new(
            dataset.rest.indice_mode,
            dataset.created_at,
            self.config().max_bulk_ops,
        );

        // Stage 1: normalize every transaction into an Operation.
        let admin = actor.map_or(false, |a| a.admin);
        let mut operations: Vec<Operation> = Vec::with_capacity(transactions.len());
        let mut patch_ids: Vec<String> = Vec::new();
        let mut delete_ids: Vec<String> = Vec::new();
        for (n, mut body) in transactions.into_iter().enumerate() {
            if n > 0 && n % YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
            let action = match body.remove(line::ACTION) {
                Some(Value::String(s)) => Action::from_str(&s)
                    .map_err(|_| TxnError::BadRequest(format!("unknown action \"{s}\"")))?,
                Some(other) => {
                    return Err(TxnError::BadRequest(format!(
                        "unknown action \"{other}\""
                    )))
                }
                None => {
                    return Err(TxnError::BadRequest(
                        "\"_action\" attribute is required".to_string(),
                    ))
                }
            };
            if let Some(cols) = &owner_columns {
                for (k, v) in cols {
                    body.insert(k.clone(), v.clone());
                }
            }
            let id = match line::doc_id(&body) {
                Some(id) => id.to_string(),
                None => {
                    return Err(TxnError::BadRequest(
                        "\"_id\" attribute is required".to_string(),
                    ))
                }
            };

            // Explicit timestamps are honored for privileged callers only;
            // for everyone else the schema validator rejects them later.
            let op_updated_at = if admin {
                line::updated_at(&body).unwrap_or(updated_at)
            } else {
                updated_at
            };

            let mut filter = DocFilter::by_id(&id);
            filter.owner = owner_key.clone();

            let mut op = Operation::new(id, action, body, filter);
            op.full_body.insert(
                line::UPDATED_AT.to_string(),
                Value::String(line::format_ts(op_updated_at)),
            );
            op.full_body
                .insert(line::INDICE.to_string(), Value::from(indices.next(op_updated_at)));
            if dataset.extensions_active {
                op.full_body
                    .insert(line::NEEDS_EXTENDING.to_string(), Value::Bool(true));
            } else {
                op.full_body
                    .insert(line::NEEDS_INDEXING.to_string(), Value::Bool(true));
            }
            if dataset.rest.store_updated_by {
                if let Some(actor) = actor {
                    op.full_body
                        .insert(line::UPDATED_BY.to_string(), Value::String(actor.id.clone()));
                    op.full_body.insert(
                        line::UPDATED_BY_NAME.to_string(),
                        Value::String(actor.name.clone()),
                    );
                }
            }
            match action {
                Action::Delete => {
                    op.full_body
                        .insert(line::DELETED.to_string(), Value::Bool(true));
                    op.full_body.insert(line::HASH.to_string(), Value::Null);
                    delete_ids.push(op.id.clone());
                }
                Action::Patch => {
                    op.full_body
                        .insert(line::DELETED.to_string(), Value::Bool(false));
                    patch_ids.push(op.id.clone());
                }
                _ => {
                    op.full_body
                        .insert(line::DELETED.to_string(), Value::Bool(false));
                }
            }
            operations.push(op);
        }

        // Stage 2: patch predecessors. Soft-deleted lines are invisible
        // here, so patching one yields the same 404 as a missing line.
        if !patch_ids.is_empty() {
            let mut missing: HashSet<String> = patch_ids.iter().cloned().collect();
            for prev in collection.find_ids(&patch_ids, owner_key.as_deref())? {
                if line::is_deleted(&prev) {
                    continue;
                }
                let Some(prev_id) = line::doc_id(&prev).map(str::to_string) else {
                    continue;
                };
                missing.remove(&prev_id);
                let Some(op) = operations
                    .iter_mut()
                    .find(|op| op.action == Action::Patch && op.id == prev_id)
                else {
                    continue;
                };
                let mut merged = logical_body(&prev, dataset);
                for (k, v) in std::mem::take(&mut op.body) {
                    merged.insert(k, v);
                }
                for (k, v) in &merged {
                    if !v.is_null() {
                        op.full_body.insert(k.clone(), v.clone());
                    }
                }
                // Patching a field to null removes it.
                let nulls: Vec<String> = merged
                    .iter()
                    .filter(|(_, v)| v.is_null())
                    .map(|(k, _)| k.clone())
                    .collect();
                for k in &nulls {
                    merged.remove(k);
                    op.full_body.remove(k);
                }
                op.body = merged;
                let hash = identity::content_hash(&op.body);
                if line::doc_hash(&prev) == Some(hash.as_str()) {
                    op.status = Some(304);
                }
                op.full_body
                    .insert(line::HASH.to_string(), Value::String(hash));
            }
            for op in operations.iter_mut() {
                if op.action == Action::Patch && missing.contains(&op.id) {
                    op.fail(404, "line not found");
                }
            }
        }

        // Stage 3: delete predecessors. The tombstone keeps the primary key
        // columns so the revision log can still name what was deleted.
        if !delete_ids.is_empty() {
            let mut missing: HashSet<String> = delete_ids.iter().cloned().collect();
            for prev in collection.find_ids(&delete_ids, owner_key.as_deref())? {
                if line::is_deleted(&prev) {
                    continue;
                }
                let Some(prev_id) = line::doc_id(&prev).map(str::to_string) else {
                    continue;
                };
                missing.remove(&prev_id);
                let Some(op) = operations
                    .iter_mut()
                    .find(|op| op.action == Action::Delete && op.id == prev_id)
                else {
                    continue;
                };
                for key in &dataset.primary_key {
                    if let Some(v) = prev.get(key) {
                        op.full_body.insert(key.clone(), v.clone());
                    }
                }
            }
            for op in operations.iter_mut() {
                if op.action == Action::Delete && missing.contains(&op.id) {
                    op.fail(404, "line not found");
                }
            }
        }

        // Stage 4: identity check, schema validation, content hash.
        let mut cu_ids: Vec<String> = Vec::new();
        for (n, op) in operations.iter_mut().enumerate() {
            if n > 0 && n % YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
            if op.action == Action::Delete || op.status.is_some() {
                continue;
            }
            if let Some(derived) =
                identity::derive_id(&op.body, &dataset.primary_key, dataset.rest.primary_key_mode)
            {
                if derived != op.id {
                    op.fail(400, "line id does not match the primary key");
                    continue;
                }
            }
            if let Some(validator) = validator {
                if let Err(message) = validator.validate(&op.body) {
                    if dataset.rest.non_blocking_validation {
                        op.warning = Some(message);
                    } else {
                        op.fail(400, message);
                        continue;
                    }
                }
            }
            if op.action != Action::Patch {
                let hash = identity::content_hash(&op.body);
                op.full_body
                    .insert(line::HASH.to_string(), Value::String(hash));
            }
            if matches!(op.action, Action::Create | Action::Update) {
                cu_ids.push(op.id.clone());
            }
        }

        // Stage 5: create/update conflict detection against live lines.
        if !cu_ids.is_empty() {
            let mut existing: HashMap<String, Option<String>> = HashMap::new();
            for prev in collection.find_ids(&cu_ids, owner_key.as_deref())? {
                if line::is_deleted(&prev) {
                    continue;
                }
                if let Some(id) = line::doc_id(&prev) {
                    existing.insert(
                        id.to_string(),
                        line::doc_hash(&prev).map(str::to_string),
                    );
                }
            }
            for op in operations.iter_mut() {
                if op.status.is_some() || !cu_ids.contains(&op.id) {
                    continue;
                }
                match (op.action, existing.get(&op.id)) {
                    (Action::Create, Some(_)) => op.fail(409, "line id already in use"),
                    (Action::Create, None) => op.status = Some(201),
                    (Action::Update, Some(prev_hash)) => {
                        if prev_hash.as_deref() == op.hash() {
                            op.status = Some(304);
                        } else {
                            op.status = Some(200);
                        }
                    }
                    (Action::Update, None) => op.fail(404, "line not found"),
                    _ => {}
                }
            }
        }

        // Stage 6: one bulk write for everything still standing.
        let mut eligible: Vec<usize> = Vec::new();
        let mut writes: Vec<WriteOp> = Vec::new();
        for (idx, op) in operations.iter().enumerate() {
            if op.skipped() {
                continue;
            }
            eligible.push(idx);
            writes.push(match op.action {
                Action::Create => WriteOp::Insert(op.full_body.clone()),
                Action::Update | Action::Patch | Action::Delete => WriteOp::Replace {
                    filter: op.filter.clone(),
                    doc: op.full_body.clone(),
                },
                Action::CreateOrUpdate => {
                    // Hash-gated upsert: an existing line with the same hash
                    // fails the filter and surfaces as a duplicate, which we
                    // report as not-modified.
                    let mut filter = op.filter.clone();
                    filter.hash_ne = op.hash().map(str::to_string);
                    WriteOp::FilteredUpsert {
                        filter,
                        doc: op.full_body.clone(),
                    }
                }
            });
        }

        let mut outcome = TxnOutcome {
            operations: Vec::new(),
            inserted: 0,
            modified: 0,
            upserted: 0,
            removed: 0,
        };
        if !writes.is_empty() {
            let bulk = collection.bulk_write(writes)?;
            outcome.inserted = bulk.inserted;
            outcome.modified = bulk.modified;
            outcome.upserted = bulk.upserted;
            outcome.removed = bulk.removed;
            for werr in &bulk.write_errors {
                let op = &mut operations[eligible[werr.index]];
                match (werr.kind, op.action) {
                    (WriteErrorKind::DuplicateKey, Action::Create) => {
                        op.fail(409, "line id already in use");
                    }
                    (WriteErrorKind::DuplicateKey, Action::CreateOrUpdate) => {
                        // The line exists with an identical hash.
                        op.status = Some(304);
                    }
                    _ => {
                        error!(
                            collection = collection.name(),
                            line = %op.id,
                            error = %werr.message,
                            "bulk write failure"
                        );
                        op.fail(500, werr.message.clone());
                    }
                }
            }
            debug!(
                dataset = %dataset.id,
                collection = collection.name(),
                total = operations.len(),
                written = eligible.len(),
                errors = bulk.write_errors.len(),
                "applied transactions"
            );
        }

        // Stage 7: revision log, or attachment cleanup when history is off.
        if dataset.rest.history {
            let log = self
                .backend()
                .revision_log(&dataset.revisions_collection_name())?;
            let mut revisions: Vec<Doc> = Vec::new();
            for (n, op) in operations.iter().enumerate() {
                if n > 0 && n % YIELD_EVERY == 0 {
                    tokio::task::yield_now().await;
                }
                if op.skipped() {
                    continue;
                }
                revisions.push(history::revision_row(&op.full_body, op.action, &op.id));
            }
            if !revisions.is_empty() {
                log.append_batch(&revisions)?;
            }
        } else {
            for op in operations.iter() {
                if op.action == Action::Delete && !op.skipped() {
                    attachments::remove_line_dir(
                        &self.config().attachments_dir,
                        &dataset.id,
                        &op.id,
                    )?;
                }
            }
        }

        // Stage 8: attribution stamp (fire and forget) and accounting.
        if !eligible.is_empty() {
            let catalog = self.catalog().clone();
            let dataset_id = dataset.id.clone();
            let by = actor.map(|a| ActorRef {
                id: a.id.clone(),
                name: a.name.clone(),
            });
            tokio::spawn(async move {
                if let Err(err) = catalog.stamp_data_updated(&dataset_id, updated_at, by) {
                    warn!(dataset = %dataset_id, error = %err, "attribution stamp failed");
                }
            });
            notify_accounting(self.accounting(), &dataset.id);
        }

        outcome.operations = operations;
        Ok(outcome)
    }

    /// Single-line convenience wrapper around [`TxnEngine::apply`].
    pub async fn apply_one(
        &self,
        dataset: &Dataset,
        actor: Option<&Actor>,
        transaction: Doc,
        validator: Option<&dyn LineValidator>,
        lines_owner: Option<&LinesOwner>,
    ) -> TxnResult<Operation> {
        let outcome = self
            .apply(dataset, actor, vec![transaction], validator, lines_owner, None)
            .await?;
        outcome
            .operations
            .into_iter()
            .next()
            .ok_or_else(|| TxnError::Internal("empty outcome for single transaction".to_string()))
    }
}

/// Projects a stored line down to the keys a caller may write, the base for
/// a patch merge.
fn logical_body(doc: &Doc, dataset: &Dataset) -> Doc {
    let mut out = Doc::new();
    for key in dataset.writable_keys() {
        if let Some(v) = doc.get(key) {
            out.insert(key.to_string(), v.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Dataset, FieldType, SchemaField};
    use crate::store::{Backend, BackendConfig};
    use crate::txn::EngineConfig;
    use std::sync::Arc;

    fn setup() -> (tempfile::TempDir, TxnEngine, Dataset) {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::new(BackendConfig {
            data_dir: dir.path().join("db"),
            ..Default::default()
        })
        .unwrap();
        let engine = TxnEngine::new(Arc::clone(&backend), EngineConfig {
            attachments_dir: dir.path().join("attachments"),
            ..Default::default()
        });
        let mut dataset = Dataset::new("ds1");
        dataset.schema = vec![
            SchemaField::new("name", FieldType::String),
            SchemaField::new("count", FieldType::Integer),
        ];
        crate::dataset::init_dataset(&backend, &dataset).unwrap();
        (dir, engine, dataset)
    }

    fn tx(action: &str, id: &str, fields: &[(&str, Value)]) -> Doc {
        let mut doc = Doc::new();
        doc.insert(line::ACTION.to_string(), Value::String(action.to_string()));
        doc.insert(line::ID.to_string(), Value::String(id.to_string()));
        for (k, v) in fields {
            doc.insert(k.to_string(), v.clone());
        }
        doc
    }

    #[tokio::test]
    async fn test_create_then_conflict() {
        let (_dir, engine, dataset) = setup();
        let op = engine
            .apply_one(&dataset, None, tx("create", "a", &[("name", "x".into())]), None, None)
            .await
            .unwrap();
        assert_eq!(op.status, Some(201));
        let op = engine
            .apply_one(&dataset, None, tx("create", "a", &[("name", "y".into())]), None, None)
            .await
            .unwrap();
        assert_eq!(op.status, Some(409));
    }

    #[tokio::test]
    async fn test_create_or_update_idempotent() {
        let (_dir, engine, dataset) = setup();
        let body = &[("name", Value::from("x"))];
        let first = engine
            .apply_one(&dataset, None, tx("createOrUpdate", "a", body), None, None)
            .await
            .unwrap();
        assert!(first.status.is_none());
        let second = engine
            .apply_one(&dataset, None, tx("createOrUpdate", "a", body), None, None)
            .await
            .unwrap();
        assert_eq!(second.status, Some(304));
        let changed = engine
            .apply_one(
                &dataset,
                None,
                tx("createOrUpdate", "a", &[("name", "y".into())]),
                None,
                None,
            )
            .await
            .unwrap();
        assert!(changed.status.is_none());
    }

    #[tokio::test]
    async fn test_patch_merges_and_null_deletes() {
        let (_dir, engine, dataset) = setup();
        engine
            .apply_one(
                &dataset,
                None,
                tx("create", "a", &[("name", "x".into()), ("count", 3.into())]),
                None,
                None,
            )
            .await
            .unwrap();
        let op = engine
            .apply_one(
                &dataset,
                None,
                tx("patch", "a", &[("count", Value::Null)]),
                None,
                None,
            )
            .await
            .unwrap();
        assert!(!op.failed());
        let collection = engine
            .backend()
            .collection(&dataset.data_collection_name())
            .unwrap();
        let stored = collection.get("a").unwrap().unwrap();
        assert_eq!(stored.get("name"), Some(&Value::from("x")));
        assert!(stored.get("count").is_none());
    }

    #[tokio::test]
    async fn test_patch_missing_line_404() {
        let (_dir, engine, dataset) = setup();
        let op = engine
            .apply_one(
                &dataset,
                None,
                tx("patch", "nope", &[("name", "x".into())]),
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(op.status, Some(404));
    }

    #[tokio::test]
    async fn test_delete_leaves_tombstone_and_allows_no_second_delete() {
        let (_dir, engine, dataset) = setup();
        engine
            .apply_one(&dataset, None, tx("create", "a", &[("name", "x".into())]), None, None)
            .await
            .unwrap();
        let op = engine
            .apply_one(&dataset, None, tx("delete", "a", &[]), None, None)
            .await
            .unwrap();
        assert!(!op.failed());
        let collection = engine
            .backend()
            .collection(&dataset.data_collection_name())
            .unwrap();
        let stored = collection.get("a").unwrap().unwrap();
        assert!(line::is_deleted(&stored));
        // A soft-deleted line is invisible to a second delete.
        let op = engine
            .apply_one(&dataset, None, tx("delete", "a", &[]), None, None)
            .await
            .unwrap();
        assert_eq!(op.status, Some(404));
    }

    #[tokio::test]
    async fn test_unknown_action_aborts_batch() {
        let (_dir, engine, dataset) = setup();
        let err = engine
            .apply(
                &dataset,
                None,
                vec![tx("upsert", "a", &[])],
                None,
                None,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TxnError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_indices_are_monotonic_within_batch() {
        let (_dir, engine, dataset) = setup();
        let batch: Vec<Doc> = (0..10)
            .map(|n| tx("create", &format!("l{n}"), &[("name", "x".into())]))
            .collect();
        let outcome = engine
            .apply(&dataset, None, batch, None, None, None)
            .await
            .unwrap();
        let indices: Vec<i64> = outcome
            .operations
            .iter()
            .map(|op| line::doc_indice(&op.full_body).unwrap())
            .collect();
        for pair in indices.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }
}
