//! Transactional write engine.
//!
//! Every mutation of dataset lines, whether a single API call or a bulk
//! ingestion batch, goes through [`TxnEngine::apply`]: normalization,
//! predecessor resolution, validation, conflict detection, one bulk write,
//! then revision logging and attribution.

mod engine;
mod operation;

pub use engine::TxnOutcome;
pub use operation::{Action, Operation};

use std::path::PathBuf;
use std::sync::Arc;

use crate::dataset::{Catalog, StorageAccounting};
use crate::store::{Backend, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum TxnError {
    /// The whole batch is malformed and nothing was applied.
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type TxnResult<T> = Result<T, TxnError>;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Maximum operations per bulk write, also the per-batch sequence span
    /// reserved by the ordering index generator.
    pub max_bulk_ops: usize,
    /// Root directory for per-line attachment storage.
    pub attachments_dir: PathBuf,
    /// How many per-line errors and warnings a bulk summary retains.
    pub error_sample_size: usize,
    /// Cap on ids remembered for post-ingestion indexing.
    pub tracked_ids_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_bulk_ops: 1000,
            attachments_dir: PathBuf::from("./attachments"),
            error_sample_size: 10,
            tracked_ids_limit: 10_000,
        }
    }
}

/// The engine itself: storage backend, dataset catalog and configuration.
/// Cheap to clone, shared across request handlers.
#[derive(Clone)]
pub struct TxnEngine {
    backend: Arc<Backend>,
    catalog: Catalog,
    config: EngineConfig,
    accounting: Option<Arc<dyn StorageAccounting>>,
}

impl TxnEngine {
    pub fn new(backend: Arc<Backend>, config: EngineConfig) -> Self {
        let catalog = Catalog::new(&backend);
        Self {
            backend,
            catalog,
            config,
            accounting: None,
        }
    }

    /// Registers a hook notified after any batch that changed stored data.
    pub fn with_accounting(mut self, hook: Arc<dyn StorageAccounting>) -> Self {
        self.accounting = Some(hook);
        self
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn accounting(&self) -> Option<&Arc<dyn StorageAccounting>> {
        self.accounting.as_ref()
    }
}
