//! Batching and the bulk-load driver.
//!
//! Raw decoded lines are normalized (default action, id derivation, marker
//! stripping) and buffered; the buffer is flushed through the engine when it
//! is full or when an incoming line reuses an id already in flight, so that
//! later occurrences observe the earlier write and last-wins holds within a
//! file.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dataset::{Actor, Dataset, LinesOwner};
use crate::identity;
use crate::ingest::{IngestError, IngestResult, LineSource};
use crate::line::{self, Doc};
use crate::store::Collection;
use crate::txn::{Action, TxnEngine};
use crate::validate::LineValidator;

/// Post-load indexing seam: given the ids touched by a load, bring the
/// search index up to date before the summary is returned.
#[async_trait]
pub trait Indexer: Send + Sync {
    async fn index_lines(&self, dataset: &Dataset, ids: &[String]) -> anyhow::Result<()>;
}

/// One sampled per-line issue.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LineIssue {
    pub line: usize,
    pub error: String,
    pub status: u16,
}

/// The outcome of a bulk load, serialized for API callers.
#[derive(Debug, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkSummary {
    pub nb_ok: u64,
    pub nb_created: u64,
    pub nb_modified: u64,
    pub nb_deleted: u64,
    pub nb_not_modified: u64,
    pub nb_errors: u64,
    pub nb_warnings: u64,
    /// First few errors and warnings, capped by configuration.
    pub errors: Vec<LineIssue>,
    pub warnings: Vec<LineIssue>,
    /// Set when the previous content was dropped and replaced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dropped: Option<bool>,
    /// Set when the load was abandoned and rolled back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled: Option<bool>,
    /// Set when synchronous indexing completed before the response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indexed_at: Option<String>,

    /// Ids of effectively written lines, for post-load indexing. Dropped
    /// past the configured cap, `ids_overflow` marks the truncation.
    #[serde(skip)]
    pub ids: Vec<String>,
    #[serde(skip)]
    pub ids_overflow: bool,
}

impl BulkSummary {
    fn record_error(&mut self, line: usize, status: u16, message: &str, cap: usize) {
        self.nb_errors += 1;
        if self.errors.len() < cap {
            self.errors.push(LineIssue {
                line,
                error: message.to_string(),
                status,
            });
        }
    }

    fn record_warning(&mut self, line: usize, message: &str, cap: usize) {
        self.nb_warnings += 1;
        if self.warnings.len() < cap {
            self.warnings.push(LineIssue {
                line,
                error: message.to_string(),
                status: 200,
            });
        }
    }
}

/// Accumulates normalized transactions and flushes them through the engine.
pub struct TransactionBatcher<'a> {
    engine: &'a TxnEngine,
    dataset: &'a Dataset,
    actor: Option<&'a Actor>,
    validator: Option<&'a dyn LineValidator>,
    lines_owner: Option<&'a LinesOwner>,
    target: Option<&'a Collection>,
    pending: Vec<(usize, Doc)>,
    in_flight: HashSet<String>,
    pub summary: BulkSummary,
}

impl<'a> TransactionBatcher<'a> {
    pub fn new(
        engine: &'a TxnEngine,
        dataset: &'a Dataset,
        actor: Option<&'a Actor>,
        validator: Option<&'a dyn LineValidator>,
        lines_owner: Option<&'a LinesOwner>,
        target: Option<&'a Collection>,
    ) -> Self {
        Self {
            engine,
            dataset,
            actor,
            validator,
            lines_owner,
            target,
            pending: Vec::new(),
            in_flight: HashSet::new(),
            summary: BulkSummary::default(),
        }
    }

    /// Normalizes one raw line and buffers it, flushing first if its id is
    /// already in flight or the buffer is full.
    pub async fn push(&mut self, line_number: usize, mut raw: Doc) -> IngestResult<()> {
        let cap = self.engine.config().error_sample_size;
        let action = match raw.remove(line::ACTION) {
            None => Action::CreateOrUpdate,
            Some(Value::String(s)) => match s.parse::<Action>() {
                Ok(a) => a,
                Err(()) => {
                    self.summary
                        .record_error(line_number, 400, &format!("unknown action \"{s}\""), cap);
                    return Ok(());
                }
            },
            Some(other) => {
                self.summary
                    .record_error(line_number, 400, &format!("unknown action \"{other}\""), cap);
                return Ok(());
            }
        };

        // Callers never control the ordering index or the internal markers.
        raw.remove(line::INDICE);
        line::strip_pending_flags(&mut raw);
        raw.remove(line::HASH);
        raw.remove(line::DELETED);

        // An explicit _id is kept as-is; the engine rejects it downstream if
        // it disagrees with the primary key. Derivation only fills the gap.
        let id = match line::doc_id(&raw) {
            Some(id) => id.to_string(),
            None => identity::derive_id(
                &raw,
                &self.dataset.primary_key,
                self.dataset.rest.primary_key_mode,
            )
            .unwrap_or_else(identity::random_line_id),
        };
        let mut doc = if action == Action::Delete {
            // A delete only needs its identity.
            Doc::new()
        } else {
            raw
        };
        doc.insert(line::ID.to_string(), Value::String(id.clone()));
        doc.insert(
            line::ACTION.to_string(),
            Value::String(action.as_str().to_string()),
        );

        if self.in_flight.contains(&id) {
            self.flush().await?;
        }
        self.in_flight.insert(id);
        self.pending.push((line_number, doc));
        if self.pending.len() >= self.engine.config().max_bulk_ops {
            self.flush().await?;
        }
        Ok(())
    }

    /// Applies the buffered transactions and folds the outcome into the
    /// summary.
    pub async fn flush(&mut self) -> IngestResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending);
        self.in_flight.clear();
        let (line_numbers, transactions): (Vec<usize>, Vec<Doc>) = batch.into_iter().unzip();
        let outcome = self
            .engine
            .apply(
                self.dataset,
                self.actor,
                transactions,
                self.validator,
                self.lines_owner,
                self.target,
            )
            .await?;

        let cap = self.engine.config().error_sample_size;
        let summary = &mut self.summary;
        let mut deleted = 0u64;
        for (op, line_number) in outcome.operations.iter().zip(line_numbers) {
            if let Some(warning) = &op.warning {
                summary.record_warning(line_number, warning, cap);
            }
            if op.failed() {
                summary.record_error(
                    line_number,
                    op.status.unwrap_or(500),
                    op.error.as_deref().unwrap_or("unexpected failure"),
                    cap,
                );
                continue;
            }
            if op.status == Some(304) {
                summary.nb_not_modified += 1;
                continue;
            }
            summary.nb_ok += 1;
            if op.action == Action::Delete {
                deleted += 1;
            }
            if summary.ids.len() < self.engine.config().tracked_ids_limit {
                summary.ids.push(op.id.clone());
            } else {
                summary.ids_overflow = true;
            }
        }
        summary.nb_deleted += deleted;
        summary.nb_created += outcome.inserted + outcome.upserted;
        summary.nb_modified += outcome.modified.saturating_sub(deleted);
        Ok(())
    }
}

/// Bulk-load options.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoadOptions {
    /// Replace the whole content: stage into a scratch collection, swap it
    /// in on success, roll it back on failure.
    pub drop: bool,
}

/// Drives a full bulk load from a decoded source to the summary.
pub async fn bulk_load<S: LineSource>(
    engine: &TxnEngine,
    dataset: &Dataset,
    actor: Option<&Actor>,
    source: &mut S,
    validator: Option<&dyn LineValidator>,
    lines_owner: Option<&LinesOwner>,
    options: LoadOptions,
    indexer: Option<&dyn Indexer>,
) -> IngestResult<BulkSummary> {
    let scratch = if options.drop {
        let name = format!(
            "{}-{}-tmp-bulk",
            dataset.data_collection_name(),
            Uuid::new_v4().simple()
        );
        Some((name.clone(), engine.backend().collection(&name)?))
    } else {
        None
    };
    let target = scratch.as_ref().map(|(_, c)| c);

    let mut batcher = TransactionBatcher::new(engine, dataset, actor, validator, lines_owner, target);
    let run = async {
        let mut line_number = 0usize;
        while let Some(decoded) = source.next_line() {
            match decoded {
                Ok(doc) => batcher.push(line_number, doc).await?,
                // Undecodable input invalidates the rest of the file.
                Err(IngestError::Decode { line, message }) => {
                    let cap = engine.config().error_sample_size;
                    batcher.summary.record_error(line, 400, &message, cap);
                    return Err(IngestError::Decode { line, message });
                }
                Err(other) => return Err(other),
            }
            line_number += 1;
        }
        batcher.flush().await
    };

    if let Err(err) = run.await {
        let mut summary = batcher.summary;
        summary.cancelled = Some(true);
        if let Some((name, _)) = &scratch {
            if let Err(drop_err) = engine.backend().drop_collection(name) {
                warn!(collection = %name, error = %drop_err, "failed to drop staging collection");
            }
        }
        warn!(dataset = %dataset.id, error = %err, "bulk load cancelled");
        return Err(IngestError::Cancelled {
            summary: Box::new(summary),
            reason: err.to_string(),
        });
    }

    let mut summary = batcher.summary;
    if let Some((name, staged)) = &scratch {
        let finish = async {
            crate::history::create_missing_revisions(engine, dataset, staged, actor).await?;
            engine
                .backend()
                .rename_collection(name, &dataset.data_collection_name())?;
            engine.catalog().set_status(&dataset.id, "analyzed")?;
            Ok::<(), IngestError>(())
        };
        if let Err(err) = finish.await {
            summary.cancelled = Some(true);
            if let Err(drop_err) = engine.backend().drop_collection(name) {
                warn!(collection = %name, error = %drop_err, "failed to drop staging collection");
            }
            warn!(dataset = %dataset.id, error = %err, "bulk load cancelled");
            return Err(IngestError::Cancelled {
                summary: Box::new(summary),
                reason: err.to_string(),
            });
        }
        summary.dropped = Some(true);
    } else if summary.nb_ok > 0 {
        engine.catalog().set_partial_status(&dataset.id, "updated")?;
    }

    if let Some(indexer) = indexer {
        if summary.ids_overflow {
            info!(dataset = %dataset.id, "too many lines for synchronous indexing");
        } else if !summary.ids.is_empty() || summary.dropped == Some(true) {
            match indexer.index_lines(dataset, &summary.ids).await {
                Ok(()) => summary.indexed_at = Some(line::format_ts(Utc::now())),
                Err(err) => {
                    warn!(dataset = %dataset.id, error = %err, "synchronous indexing failed")
                }
            }
        }
    }

    info!(
        dataset = %dataset.id,
        ok = summary.nb_ok,
        errors = summary.nb_errors,
        dropped = options.drop,
        "bulk load finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{FieldType, SchemaField};
    use crate::ingest::VecSource;
    use crate::store::{Backend, BackendConfig};
    use crate::txn::EngineConfig;
    use serde_json::json;
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
        dataset.primary_key = vec!["name".to_string()];
        dataset.schema = vec![
            SchemaField::new("name", FieldType::String),
            SchemaField::new("count", FieldType::Integer),
        ];
        crate::dataset::init_dataset(&backend, &dataset).unwrap();
        (dir, engine, dataset)
    }

    fn doc(v: serde_json::Value) -> Doc {
        v.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn test_load_defaults_to_create_or_update() {
        let (_dir, engine, dataset) = setup();
        let mut source = VecSource::new(vec![
            doc(json!({ "name": "a", "count": 1 })),
            doc(json!({ "name": "b", "count": 2 })),
        ]);
        let summary = bulk_load(
            &engine,
            &dataset,
            None,
            &mut source,
            None,
            None,
            LoadOptions::default(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(summary.nb_ok, 2);
        assert_eq!(summary.nb_created, 2);
        assert_eq!(summary.nb_errors, 0);
        assert_eq!(summary.ids.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_id_in_file_last_wins() {
        let (_dir, engine, dataset) = setup();
        let mut source = VecSource::new(vec![
            doc(json!({ "name": "a", "count": 1 })),
            doc(json!({ "name": "a", "count": 2 })),
            doc(json!({ "name": "a", "count": 3 })),
        ]);
        let summary = bulk_load(
            &engine,
            &dataset,
            None,
            &mut source,
            None,
            None,
            LoadOptions::default(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(summary.nb_ok, 3);
        let collection = engine
            .backend()
            .collection(&dataset.data_collection_name())
            .unwrap();
        assert_eq!(collection.count(), 1);
        let id = summary.ids[0].clone();
        let stored = collection.get(&id).unwrap().unwrap();
        assert_eq!(stored.get("count"), Some(&Value::from(3)));
    }

    #[tokio::test]
    async fn test_reload_identical_content_is_not_modified() {
        let (_dir, engine, dataset) = setup();
        let lines = vec![doc(json!({ "name": "a", "count": 1 }))];
        bulk_load(
            &engine,
            &dataset,
            None,
            &mut VecSource::new(lines.clone()),
            None,
            None,
            LoadOptions::default(),
            None,
        )
        .await
        .unwrap();
        let summary = bulk_load(
            &engine,
            &dataset,
            None,
            &mut VecSource::new(lines),
            None,
            None,
            LoadOptions::default(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(summary.nb_ok, 0);
        assert_eq!(summary.nb_not_modified, 1);
    }

    #[tokio::test]
    async fn test_drop_mode_replaces_content() {
        let (_dir, engine, dataset) = setup();
        bulk_load(
            &engine,
            &dataset,
            None,
            &mut VecSource::new(vec![
                doc(json!({ "name": "a" })),
                doc(json!({ "name": "b" })),
            ]),
            None,
            None,
            LoadOptions::default(),
            None,
        )
        .await
        .unwrap();
        let summary = bulk_load(
            &engine,
            &dataset,
            None,
            &mut VecSource::new(vec![doc(json!({ "name": "c" }))]),
            None,
            None,
            LoadOptions { drop: true },
            None,
        )
        .await
        .unwrap();
        assert_eq!(summary.dropped, Some(true));
        let collection = engine
            .backend()
            .collection(&dataset.data_collection_name())
            .unwrap();
        assert_eq!(collection.count(), 1);
        let only = collection.iter().next().unwrap().unwrap();
        assert_eq!(only.get("name"), Some(&Value::from("c")));
    }

    #[tokio::test]
    async fn test_drop_mode_records_missing_deletes_in_history() {
        let (_dir, engine, mut dataset) = setup();
        dataset.rest.history = true;
        crate::history::configure_history(&engine, &dataset)
            .await
            .unwrap();
        bulk_load(
            &engine,
            &dataset,
            None,
            &mut VecSource::new(vec![
                doc(json!({ "name": "a" })),
                doc(json!({ "name": "b" })),
            ]),
            None,
            None,
            LoadOptions::default(),
            None,
        )
        .await
        .unwrap();
        bulk_load(
            &engine,
            &dataset,
            None,
            &mut VecSource::new(vec![doc(json!({ "name": "a" }))]),
            None,
            None,
            LoadOptions { drop: true },
            None,
        )
        .await
        .unwrap();
        let page =
            crate::history::list_revisions(&engine, &dataset, None, None, None, 100).unwrap();
        let deletes: Vec<&Doc> = page
            .results
            .iter()
            .filter(|r| line::doc_str(r, line::ACTION) == Some("delete"))
            .collect();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].get("name"), Some(&Value::from("b")));
    }

    #[tokio::test]
    async fn test_decode_error_cancels_load() {
        let (_dir, engine, dataset) = setup();
        let mut source = crate::ingest::JsonSource::new(
            "[{ \"name\": \"a\" }, 42, { \"name\": \"b\" }]",
        )
        .unwrap();
        let err = bulk_load(
            &engine,
            &dataset,
            None,
            &mut source,
            None,
            None,
            LoadOptions::default(),
            None,
        )
        .await
        .unwrap_err();
        let IngestError::Cancelled { summary, .. } = err else {
            panic!("expected cancellation");
        };
        assert_eq!(summary.cancelled, Some(true));
        assert_eq!(summary.nb_errors, 1);
        assert_eq!(summary.errors[0].status, 400);
        assert_eq!(summary.errors[0].line, 1);
    }

    #[tokio::test]
    async fn test_drop_mode_failure_rolls_back() {
        let (_dir, engine, dataset) = setup();
        bulk_load(
            &engine,
            &dataset,
            None,
            &mut VecSource::new(vec![doc(json!({ "name": "keep" }))]),
            None,
            None,
            LoadOptions::default(),
            None,
        )
        .await
        .unwrap();
        let mut source = crate::ingest::JsonSource::new("[{ \"name\": \"c\" }, []]").unwrap();
        let err = bulk_load(
            &engine,
            &dataset,
            None,
            &mut source,
            None,
            None,
            LoadOptions { drop: true },
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, IngestError::Cancelled { .. }));
        // The previous content survived.
        let collection = engine
            .backend()
            .collection(&dataset.data_collection_name())
            .unwrap();
        assert_eq!(collection.count(), 1);
        let kept = collection.iter().next().unwrap().unwrap();
        assert_eq!(kept.get("name"), Some(&Value::from("keep")));
    }

    #[tokio::test]
    async fn test_explicit_id_must_match_primary_key() {
        let (_dir, engine, dataset) = setup();
        let summary = bulk_load(
            &engine,
            &dataset,
            None,
            &mut VecSource::new(vec![doc(json!({ "_id": "custom-id", "name": "a" }))]),
            None,
            None,
            LoadOptions::default(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(summary.nb_created, 0);
        assert_eq!(summary.nb_errors, 1);
        assert_eq!(summary.errors[0].status, 400);

        // the matching id is accepted and the line keeps it
        let derived = identity::derive_id(
            &doc(json!({ "name": "a" })),
            &dataset.primary_key,
            dataset.rest.primary_key_mode,
        )
        .unwrap();
        let summary = bulk_load(
            &engine,
            &dataset,
            None,
            &mut VecSource::new(vec![doc(json!({ "_id": derived.clone(), "name": "a" }))]),
            None,
            None,
            LoadOptions::default(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(summary.nb_created, 1);
        assert_eq!(summary.ids, vec![derived]);
    }

    #[tokio::test]
    async fn test_delete_by_primary_key() {
        let (_dir, engine, dataset) = setup();
        bulk_load(
            &engine,
            &dataset,
            None,
            &mut VecSource::new(vec![doc(json!({ "name": "a" }))]),
            None,
            None,
            LoadOptions::default(),
            None,
        )
        .await
        .unwrap();
        let summary = bulk_load(
            &engine,
            &dataset,
            None,
            &mut VecSource::new(vec![doc(json!({ "name": "a", "_action": "delete" }))]),
            None,
            None,
            LoadOptions::default(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(summary.nb_deleted, 1);
    }
}
