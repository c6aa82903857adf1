//! # restline: a transactional engine for editable datasets
//!
//! restline manages mutable, schema-governed tabular datasets whose lines
//! are edited through explicit operations (create, update, patch, delete,
//! createOrUpdate). It provides:
//!
//! - **Stable identity**: line ids derived from primary-key values, so
//!   reloading the same data converges instead of duplicating
//! - **Change detection**: content hashes turn identical rewrites into
//!   cheap not-modified outcomes
//! - **Total ordering**: every effective write gets a monotonic ordering
//!   index, the backbone of incremental indexing and history pagination
//! - **Revision history**: an optional append-only log of every effective
//!   change, with TTL expiry
//! - **Bulk ingestion**: JSON, NDJSON and CSV loads, batched, with
//!   last-wins semantics inside a file and drop-and-replace reloads
//! - **Deferred indexing**: written lines carry pending flags drained by a
//!   two-phase acknowledgement cycle against the external search index
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use restline::{Backend, BackendConfig, Dataset, EngineConfig, TxnEngine};
//!
//! # fn run() -> anyhow::Result<()> {
//! let backend = Backend::new(BackendConfig::default())?;
//! let engine = TxnEngine::new(Arc::clone(&backend), EngineConfig::default());
//! let dataset = Dataset::new("my-dataset");
//! restline::init_dataset(&backend, &dataset)?;
//! # Ok(())
//! # }
//! ```

// Core modules
pub mod attachments;
pub mod dataset;
pub mod history;
pub mod identity;
pub mod index_sync;
pub mod indice;
pub mod ingest;
pub mod line;
pub mod store;
pub mod sweep;
pub mod txn;
pub mod validate;

// Re-export main types at crate root for convenience
pub use dataset::{
    delete_dataset, init_dataset, Actor, Catalog, Dataset, LinesOwner, RestConfig,
    StorageAccounting,
};
pub use history::{configure_history, expire_revisions, list_revisions, RevisionPage};
pub use indice::IndiceMode;
pub use ingest::{bulk_load, BulkSummary, Indexer, LoadOptions};
pub use line::Doc;
pub use store::{Backend, BackendConfig, Collection, RevisionLog};
pub use txn::{Action, EngineConfig, Operation, TxnEngine, TxnError};
pub use validate::{LineValidator, SchemaValidator, ValidatorCache};
