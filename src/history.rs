//! Revision history: the append-only log of effective changes, its
//! enable/disable lifecycle, TTL expiry and paginated reads.
//!
//! A revision is the written line at the time of the change, minus the
//! pending-indexing markers, keyed by the same ordering index `_i` the line
//! received. The log is read newest-first.

use chrono::{Duration, Utc};
use serde_json::Value;
use tracing::{debug, info};

use crate::dataset::{Actor, Dataset};
use crate::indice::IndiceGenerator;
use crate::line::{self, Doc};
use crate::store::{Collection, StoreError};
use crate::txn::{Action, TxnEngine};

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history is not activated on this dataset")]
    NotEnabled,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type HistoryResult<T> = Result<T, HistoryError>;

const BACKFILL_BATCH: usize = 1000;

/// One page of revisions for a line, newest first.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionPage {
    pub total: u64,
    pub results: Vec<Doc>,
    /// Pass back as `before` to fetch the next page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_before: Option<i64>,
}

/// Builds the revision row for a written line.
pub(crate) fn revision_row(full_body: &Doc, action: Action, line_id: &str) -> Doc {
    let mut row = full_body.clone();
    line::strip_pending_flags(&mut row);
    row.remove(line::ID);
    row.insert(line::LINE_ID.to_string(), Value::String(line_id.to_string()));
    row.insert(
        line::ACTION.to_string(),
        Value::String(action.as_str().to_string()),
    );
    if !line::is_deleted(&row) {
        row.remove(line::DELETED);
    }
    row
}

/// Applies the dataset's current history configuration: creates the log and
/// backfills a synthetic `create` revision per live line when history was
/// just enabled, drops the log when it was disabled, and records the TTL
/// policy for the expiry sweep either way.
pub async fn configure_history(engine: &TxnEngine, dataset: &Dataset) -> HistoryResult<()> {
    let backend = engine.backend();
    let name = dataset.revisions_collection_name();
    if dataset.rest.history {
        if !backend.collection_exists(&name)? {
            let log = backend.revision_log(&name)?;
            let collection = backend.collection(&dataset.data_collection_name())?;
            let mut batch: Vec<Doc> = Vec::with_capacity(BACKFILL_BATCH);
            let mut total = 0u64;
            for doc in collection.iter() {
                let doc = doc?;
                if line::is_deleted(&doc) {
                    continue;
                }
                let Some(id) = line::doc_id(&doc).map(str::to_string) else {
                    continue;
                };
                let mut row = doc;
                row.remove(line::ID);
                line::strip_pending_flags(&mut row);
                row.remove(line::DELETED);
                row.insert(line::LINE_ID.to_string(), Value::String(id));
                row.insert(
                    line::ACTION.to_string(),
                    Value::String(Action::Create.as_str().to_string()),
                );
                batch.push(row);
                if batch.len() == BACKFILL_BATCH {
                    log.append_batch(&batch)?;
                    total += batch.len() as u64;
                    batch.clear();
                    tokio::task::yield_now().await;
                }
            }
            if !batch.is_empty() {
                total += batch.len() as u64;
                log.append_batch(&batch)?;
            }
            info!(dataset = %dataset.id, lines = total, "history enabled, backfilled revisions");
        }
    } else if backend.collection_exists(&name)? {
        backend.drop_collection(&name)?;
        info!(dataset = %dataset.id, "history disabled, dropped revisions");
    }
    engine.catalog().set_history_ttl(
        &dataset.id,
        dataset
            .rest
            .history_ttl
            .as_ref()
            .map(|d| d.as_seconds()),
    )?;
    Ok(())
}

/// Removes revisions older than the dataset's recorded TTL policy. Returns
/// the number removed; a dataset without a policy is a no-op.
pub fn expire_revisions(engine: &TxnEngine, dataset: &Dataset) -> HistoryResult<u64> {
    let record = engine.catalog().get(&dataset.id)?;
    let Some(seconds) = record.history_ttl_seconds else {
        return Ok(0);
    };
    let name = dataset.revisions_collection_name();
    if !engine.backend().collection_exists(&name)? {
        return Ok(0);
    }
    let log = engine.backend().revision_log(&name)?;
    let cutoff = Utc::now() - Duration::seconds(seconds);
    let removed = log.remove_older_than(cutoff)?;
    if removed > 0 {
        debug!(dataset = %dataset.id, removed, "expired revisions");
    }
    Ok(removed)
}

/// After a drop-and-replace load, every line present before the load but
/// absent from the replacement silently vanished; this appends the missing
/// `delete` revisions so the history stays complete. `staged` is the
/// replacement collection, read before the pointer swap.
pub async fn create_missing_revisions(
    engine: &TxnEngine,
    dataset: &Dataset,
    staged: &Collection,
    actor: Option<&Actor>,
) -> HistoryResult<u64> {
    if !dataset.rest.history {
        return Ok(0);
    }
    let backend = engine.backend();
    let live = backend.collection(&dataset.data_collection_name())?;
    let log = backend.revision_log(&dataset.revisions_collection_name())?;
    let now = Utc::now();
    let mut indices = IndiceGenerator::new(dataset.rest.indice_mode, dataset.created_at, BACKFILL_BATCH);
    let mut batch: Vec<Doc> = Vec::new();
    let mut total = 0u64;
    for doc in live.iter() {
        let doc = doc?;
        if line::is_deleted(&doc) {
            continue;
        }
        let Some(id) = line::doc_id(&doc).map(str::to_string) else {
            continue;
        };
        if staged.get(&id)?.is_some() {
            continue;
        }
        let mut row = Doc::new();
        for key in &dataset.primary_key {
            if let Some(v) = doc.get(key) {
                row.insert(key.clone(), v.clone());
            }
        }
        row.insert(line::LINE_ID.to_string(), Value::String(id));
        row.insert(
            line::ACTION.to_string(),
            Value::String(Action::Delete.as_str().to_string()),
        );
        row.insert(line::DELETED.to_string(), Value::Bool(true));
        row.insert(line::HASH.to_string(), Value::Null);
        row.insert(
            line::UPDATED_AT.to_string(),
            Value::String(line::format_ts(now)),
        );
        row.insert(line::INDICE.to_string(), Value::from(indices.next(now)));
        if dataset.rest.store_updated_by {
            if let Some(actor) = actor {
                row.insert(line::UPDATED_BY.to_string(), Value::String(actor.id.clone()));
                row.insert(
                    line::UPDATED_BY_NAME.to_string(),
                    Value::String(actor.name.clone()),
                );
            }
        }
        batch.push(row);
        if batch.len() == BACKFILL_BATCH {
            log.append_batch(&batch)?;
            total += batch.len() as u64;
            batch.clear();
            tokio::task::yield_now().await;
        }
    }
    if !batch.is_empty() {
        total += batch.len() as u64;
        log.append_batch(&batch)?;
    }
    if total > 0 {
        debug!(dataset = %dataset.id, revisions = total, "recorded deletions missing from reload");
    }
    Ok(total)
}

/// Reads a page of revisions, newest first. `line_id` restricts to one
/// line's revisions; `owner` restricts to lines owned by that key; `before`
/// excludes revisions at or above that ordering index.
pub fn list_revisions(
    engine: &TxnEngine,
    dataset: &Dataset,
    line_id: Option<&str>,
    owner: Option<&str>,
    before: Option<i64>,
    limit: usize,
) -> HistoryResult<RevisionPage> {
    if !dataset.rest.history {
        return Err(HistoryError::NotEnabled);
    }
    let log = engine
        .backend()
        .revision_log(&dataset.revisions_collection_name())?;
    let matches = |doc: &Doc| {
        line_id.map_or(true, |id| line::doc_str(doc, line::LINE_ID) == Some(id))
            && owner.map_or(true, |o| line::doc_str(doc, line::OWNER) == Some(o))
    };
    let total = log.count_matching(&matches)?;
    let mut results: Vec<Doc> = Vec::with_capacity(limit.min(64));
    let mut next_before = None;
    for doc in log.iter_desc(before) {
        let doc = doc?;
        if !matches(&doc) {
            continue;
        }
        if results.len() == limit {
            break;
        }
        next_before = line::doc_indice(&doc);
        results.push(present_revision(doc));
    }
    if (results.len() as u64) >= total || results.len() < limit {
        next_before = None;
    }
    Ok(RevisionPage {
        total,
        results,
        next_before,
    })
}

/// A revision as returned to callers: `_lineId` becomes `_id`.
fn present_revision(mut doc: Doc) -> Doc {
    if let Some(id) = doc.remove(line::LINE_ID) {
        doc.insert(line::ID.to_string(), id);
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{FieldType, SchemaField};
    use crate::store::{Backend, BackendConfig};
    use crate::txn::EngineConfig;
    use std::sync::Arc;

    fn setup(history: bool) -> (tempfile::TempDir, TxnEngine, Dataset) {
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
        dataset.schema = vec![SchemaField::new("name", FieldType::String)];
        dataset.rest.history = history;
        crate::dataset::init_dataset(&backend, &dataset).unwrap();
        (dir, engine, dataset)
    }

    fn tx(action: &str, id: &str, name: &str) -> Doc {
        let mut doc = Doc::new();
        doc.insert(line::ACTION.to_string(), Value::String(action.to_string()));
        doc.insert(line::ID.to_string(), Value::String(id.to_string()));
        doc.insert("name".to_string(), Value::String(name.to_string()));
        doc
    }

    #[tokio::test]
    async fn test_revisions_accumulate_and_page_newest_first() {
        let (_dir, engine, dataset) = setup(true);
        engine
            .apply_one(&dataset, None, tx("create", "a", "x"), None, None)
            .await
            .unwrap();
        engine
            .apply_one(&dataset, None, tx("update", "a", "y"), None, None)
            .await
            .unwrap();
        let page = list_revisions(&engine, &dataset, Some("a"), None, None, 10).unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.results.len(), 2);
        assert_eq!(page.results[0].get("name"), Some(&Value::from("y")));
        assert_eq!(page.results[1].get("name"), Some(&Value::from("x")));
        assert_eq!(line::doc_str(&page.results[0], line::ID), Some("a"));
        assert!(page.next_before.is_none());
    }

    #[tokio::test]
    async fn test_not_modified_leaves_no_revision() {
        let (_dir, engine, dataset) = setup(true);
        engine
            .apply_one(&dataset, None, tx("createOrUpdate", "a", "x"), None, None)
            .await
            .unwrap();
        engine
            .apply_one(&dataset, None, tx("createOrUpdate", "a", "x"), None, None)
            .await
            .unwrap();
        let page = list_revisions(&engine, &dataset, Some("a"), None, None, 10).unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn test_pagination_with_before() {
        let (_dir, engine, dataset) = setup(true);
        engine
            .apply_one(&dataset, None, tx("createOrUpdate", "a", "v0"), None, None)
            .await
            .unwrap();
        for n in 1..5 {
            engine
                .apply_one(&dataset, None, tx("update", "a", &format!("v{n}")), None, None)
                .await
                .unwrap();
        }
        let first = list_revisions(&engine, &dataset, Some("a"), None, None, 2).unwrap();
        assert_eq!(first.results.len(), 2);
        let before = first.next_before.unwrap();
        let second = list_revisions(&engine, &dataset, Some("a"), None, Some(before), 2).unwrap();
        assert_eq!(second.results.len(), 2);
        let newest = line::doc_indice(&first.results[1]).unwrap();
        let next = line::doc_indice(&second.results[0]).unwrap();
        assert!(next < newest);
    }

    #[tokio::test]
    async fn test_enable_backfills_disable_drops() {
        let (_dir, engine, mut dataset) = setup(false);
        engine
            .apply_one(&dataset, None, tx("create", "a", "x"), None, None)
            .await
            .unwrap();
        dataset.rest.history = true;
        configure_history(&engine, &dataset).await.unwrap();
        let page = list_revisions(&engine, &dataset, Some("a"), None, None, 10).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(
            line::doc_str(&page.results[0], line::ACTION),
            Some("create")
        );

        dataset.rest.history = false;
        configure_history(&engine, &dataset).await.unwrap();
        assert!(!engine
            .backend()
            .collection_exists(&dataset.revisions_collection_name())
            .unwrap());
    }

    #[tokio::test]
    async fn test_expire_revisions_honors_policy() {
        let (_dir, engine, dataset) = setup(true);
        engine
            .apply_one(&dataset, None, tx("create", "a", "x"), None, None)
            .await
            .unwrap();
        // No policy recorded: nothing removed.
        assert_eq!(expire_revisions(&engine, &dataset).unwrap(), 0);
        // A zero-delay policy expires everything already written.
        engine.catalog().set_history_ttl(&dataset.id, Some(0)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(expire_revisions(&engine, &dataset).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_keeps_primary_key_in_revision() {
        let (_dir, engine, mut dataset) = setup(true);
        dataset.primary_key = vec!["name".to_string()];
        dataset.rest.primary_key_mode = crate::dataset::PrimaryKeyMode::Sha256;
        let id = crate::identity::derive_id(
            &tx("create", "ignored", "x"),
            &dataset.primary_key,
            dataset.rest.primary_key_mode,
        )
        .unwrap();
        engine
            .apply_one(&dataset, None, tx("create", &id, "x"), None, None)
            .await
            .unwrap();
        let mut del = Doc::new();
        del.insert(line::ACTION.to_string(), Value::String("delete".to_string()));
        del.insert(line::ID.to_string(), Value::String(id.clone()));
        engine.apply_one(&dataset, None, del, None, None).await.unwrap();
        let page = list_revisions(&engine, &dataset, Some(&id), None, None, 10).unwrap();
        assert_eq!(page.total, 2);
        let delete_rev = &page.results[0];
        assert!(line::is_deleted(delete_rev));
        assert_eq!(delete_rev.get("name"), Some(&Value::from("x")));
    }
}
