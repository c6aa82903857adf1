//! Periodic maintenance: the expire-by-date sweep and attachment
//! reconciliation. Both are ordinary transaction batches, so history,
//! ordering indices and pending flags behave exactly as for caller writes.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{debug, info};

use crate::attachments;
use crate::dataset::Dataset;
use crate::ingest::{BulkSummary, IngestError, TransactionBatcher};
use crate::line::{self, Doc};
use crate::store::StoreError;
use crate::txn::{Action, TxnEngine};

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("dataset has no ttl rule")]
    NoTtlRule,
    #[error("attachments require the attachment field as single primary key")]
    BadAttachmentKey,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SweepResult<T> = Result<T, SweepError>;

/// Upper bound on deletions per reconciliation pass.
const MAX_SYNC_DELETES: usize = 10_000;

/// Deletes the lines whose TTL date field precedes `now - delay`. Returns
/// the number of lines deleted. Soft-deleted lines and lines without a
/// parseable date are left alone.
pub async fn apply_ttl(engine: &TxnEngine, dataset: &Dataset) -> SweepResult<u64> {
    let rule = dataset.rest.ttl.as_ref().ok_or(SweepError::NoTtlRule)?;
    let now = Utc::now();
    let cutoff = now - Duration::seconds(rule.delay.as_seconds());
    let collection = engine.backend().collection(&dataset.data_collection_name())?;

    let mut expired: Vec<Doc> = Vec::new();
    for doc in collection.iter() {
        let doc = doc?;
        if line::is_deleted(&doc) {
            continue;
        }
        let Some(date) = doc
            .get(&rule.field)
            .and_then(Value::as_str)
            .and_then(parse_date)
        else {
            continue;
        };
        if date >= cutoff {
            continue;
        }
        let Some(id) = line::doc_id(&doc) else {
            continue;
        };
        let mut del = Doc::new();
        del.insert(
            line::ACTION.to_string(),
            Value::String(Action::Delete.as_str().to_string()),
        );
        del.insert(line::ID.to_string(), Value::String(id.to_string()));
        // Keep the primary key columns so the id rederives identically.
        for key in &dataset.primary_key {
            if let Some(v) = doc.get(key) {
                del.insert(key.clone(), v.clone());
            }
        }
        expired.push(del);
    }

    let mut batcher = TransactionBatcher::new(engine, dataset, None, None, None, None);
    for (n, del) in expired.into_iter().enumerate() {
        batcher.push(n, del).await?;
    }
    batcher.flush().await?;
    let deleted = batcher.summary.nb_deleted;

    engine.catalog().set_ttl_checked(&dataset.id, now)?;
    if deleted > 0 {
        engine.catalog().set_partial_status(&dataset.id, "updated")?;
        info!(dataset = %dataset.id, deleted, field = %rule.field, "ttl sweep");
    } else {
        debug!(dataset = %dataset.id, field = %rule.field, "ttl sweep found nothing");
    }
    Ok(deleted)
}

fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .ok()
}

/// Reconciles lines against the attachment directory for datasets whose
/// single primary key is the attachment path field: lines pointing at a
/// missing file are deleted, files without a line get one created.
pub async fn sync_attachments(engine: &TxnEngine, dataset: &Dataset) -> SweepResult<BulkSummary> {
    let field = dataset
        .attachment_field()
        .map(|f| f.key.clone())
        .ok_or(SweepError::BadAttachmentKey)?;
    if dataset.primary_key.len() != 1 || dataset.primary_key[0] != field {
        return Err(SweepError::BadAttachmentKey);
    }

    let paths = attachments::ls_attachments(&engine.config().attachments_dir, &dataset.id)?;
    let present: std::collections::HashSet<&str> = paths.iter().map(String::as_str).collect();

    let collection = engine.backend().collection(&dataset.data_collection_name())?;
    let mut transactions: Vec<Doc> = Vec::new();
    let mut referenced: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut deletes = 0usize;
    for doc in collection.iter() {
        let doc = doc?;
        if line::is_deleted(&doc) {
            continue;
        }
        let Some(path) = line::doc_str(&doc, &field).map(str::to_string) else {
            continue;
        };
        if present.contains(path.as_str()) {
            referenced.insert(path);
            continue;
        }
        if deletes == MAX_SYNC_DELETES {
            continue;
        }
        deletes += 1;
        let mut del = Doc::new();
        del.insert(
            line::ACTION.to_string(),
            Value::String(Action::Delete.as_str().to_string()),
        );
        del.insert(field.clone(), Value::String(path));
        transactions.push(del);
    }
    for path in paths {
        if referenced.contains(&path) {
            continue;
        }
        let mut create = Doc::new();
        create.insert(field.clone(), Value::String(path));
        transactions.push(create);
    }

    let mut batcher = TransactionBatcher::new(engine, dataset, None, None, None, None);
    for (n, doc) in transactions.into_iter().enumerate() {
        batcher.push(n, doc).await?;
    }
    batcher.flush().await?;
    let summary = batcher.summary;
    if summary.nb_ok > 0 {
        engine.catalog().set_partial_status(&dataset.id, "updated")?;
    }
    info!(
        dataset = %dataset.id,
        created = summary.nb_created,
        deleted = summary.nb_deleted,
        "attachments synchronized"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{FieldType, SchemaField, TtlDelay, TtlRule, TtlUnit};
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
        let dataset = Dataset::new("ds1");
        crate::dataset::init_dataset(&backend, &dataset).unwrap();
        (dir, engine, dataset)
    }

    fn tx(id: &str, date: &str) -> Doc {
        let mut doc = Doc::new();
        doc.insert(line::ACTION.to_string(), Value::from("create"));
        doc.insert(line::ID.to_string(), Value::from(id));
        doc.insert("expires".to_string(), Value::from(date));
        doc
    }

    #[tokio::test]
    async fn test_ttl_sweep_deletes_old_lines() {
        let (_dir, engine, mut dataset) = setup();
        dataset.schema = vec![SchemaField::new("expires", FieldType::String)];
        dataset.rest.ttl = Some(TtlRule {
            field: "expires".to_string(),
            delay: TtlDelay {
                value: 1,
                unit: TtlUnit::Days,
            },
        });
        let old = line::format_ts(Utc::now() - Duration::days(3));
        let fresh = line::format_ts(Utc::now());
        engine
            .apply_one(&dataset, None, tx("old", &old), None, None)
            .await
            .unwrap();
        engine
            .apply_one(&dataset, None, tx("fresh", &fresh), None, None)
            .await
            .unwrap();

        assert_eq!(apply_ttl(&engine, &dataset).await.unwrap(), 1);
        let collection = engine
            .backend()
            .collection(&dataset.data_collection_name())
            .unwrap();
        assert!(line::is_deleted(&collection.get("old").unwrap().unwrap()));
        assert!(!line::is_deleted(&collection.get("fresh").unwrap().unwrap()));
        // A second sweep finds nothing new.
        assert_eq!(apply_ttl(&engine, &dataset).await.unwrap(), 0);
        let record = engine.catalog().get(&dataset.id).unwrap();
        assert!(record.ttl_checked_at.is_some());
    }

    #[tokio::test]
    async fn test_ttl_sweep_requires_rule() {
        let (_dir, engine, dataset) = setup();
        assert!(matches!(
            apply_ttl(&engine, &dataset).await,
            Err(SweepError::NoTtlRule)
        ));
    }

    #[tokio::test]
    async fn test_sync_attachments_creates_and_deletes() {
        let (dir, engine, mut dataset) = setup();
        dataset.primary_key = vec!["file".to_string()];
        dataset.schema = vec![{
            let mut f = SchemaField::new("file", FieldType::String);
            f.attachment = true;
            f
        }];

        std::fs::write(dir.path().join("src.txt"), b"content").unwrap();
        let stored = attachments::store_attachment(
            &engine.config().attachments_dir,
            &dataset.id,
            "l1",
            "doc.txt",
            dir.path().join("src.txt").as_path(),
            true,
        )
        .unwrap();

        // A line pointing at a file that does not exist.
        let mut orphan = Doc::new();
        orphan.insert(line::ACTION.to_string(), Value::from("create"));
        orphan.insert(
            line::ID.to_string(),
            Value::String(
                crate::identity::derive_id(
                    &{
                        let mut d = Doc::new();
                        d.insert("file".to_string(), Value::from("gone/abc/missing.txt"));
                        d
                    },
                    &dataset.primary_key,
                    dataset.rest.primary_key_mode,
                )
                .unwrap(),
            ),
        );
        orphan.insert("file".to_string(), Value::from("gone/abc/missing.txt"));
        engine
            .apply_one(&dataset, None, orphan, None, None)
            .await
            .unwrap();

        let summary = sync_attachments(&engine, &dataset).await.unwrap();
        assert_eq!(summary.nb_created, 1);
        assert_eq!(summary.nb_deleted, 1);
        let collection = engine
            .backend()
            .collection(&dataset.data_collection_name())
            .unwrap();
        let live: Vec<Doc> = collection
            .iter()
            .map(Result::unwrap)
            .filter(|d| !line::is_deleted(d))
            .collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].get("file"), Some(&Value::from(stored)));
    }

    #[tokio::test]
    async fn test_sync_attachments_requires_attachment_primary_key() {
        let (_dir, engine, dataset) = setup();
        assert!(matches!(
            sync_attachments(&engine, &dataset).await,
            Err(SweepError::BadAttachmentKey)
        ));
    }
}
