//! Sled-backed storage backend with dynamically named collections.
//!
//! Each logical collection maps to a pair of sled trees: the document tree
//! and an ordering-indice tree enforcing `_i` uniqueness. The mapping from
//! logical name to physical tree id lives in the `meta` tree, so renaming a
//! collection (the drop-and-replace swap) is a pointer update rather than a
//! data copy: the insert of the destination pointer is the commit point.
//!
//! A fixed `datasets` tree holds the per-dataset catalog records.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::collection::{Collection, RevisionLog};
use crate::store::{StoreError, StoreResult};

/// Configuration for the backend storage.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Path to the data directory where sled stores all files.
    pub data_dir: PathBuf,

    /// Maximum page cache size in megabytes.
    pub cache_size_mb: u64,

    /// Flush interval in milliseconds. How often sled flushes dirty pages to disk.
    pub flush_interval_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            cache_size_mb: 256,
            flush_interval_ms: 1000,
        }
    }
}

/// The persistent storage backend.
pub struct Backend {
    /// The sled database instance
    db: sled::Db,

    /// Logical collection name -> physical tree id
    meta_tree: sled::Tree,

    /// Catalog records for datasets (see [`crate::dataset::Catalog`])
    datasets_tree: sled::Tree,

    /// Per-collection write mutexes. Held for the duration of one bulk
    /// write so each item's read-check-write is atomic with respect to
    /// concurrent bulk writes on the same collection. Reads stay lock-free.
    write_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,

    #[allow(dead_code)]
    config: BackendConfig,
}

impl Backend {
    /// Opens (or creates) the backend at the configured data directory.
    pub fn new(config: BackendConfig) -> StoreResult<Arc<Self>> {
        debug!("Initializing storage backend at {:?}", config.data_dir);

        std::fs::create_dir_all(&config.data_dir)?;

        let db = sled::Config::new()
            .path(&config.data_dir)
            .cache_capacity(config.cache_size_mb * 1024 * 1024)
            .flush_every_ms(Some(config.flush_interval_ms))
            .open()?;

        let meta_tree = db.open_tree("meta")?;
        let datasets_tree = db.open_tree("datasets")?;

        info!(
            cache_size_mb = config.cache_size_mb,
            flush_interval_ms = config.flush_interval_ms,
            "storage backend initialized"
        );

        Ok(Arc::new(Self {
            db,
            meta_tree,
            datasets_tree,
            write_locks: RwLock::new(HashMap::new()),
            config,
        }))
    }

    /// The catalog tree (dataset records).
    pub(crate) fn datasets_tree(&self) -> sled::Tree {
        self.datasets_tree.clone()
    }

    /// Resolves a logical collection name to its physical tree id,
    /// allocating a fresh id on first use.
    fn resolve(&self, logical: &str) -> StoreResult<String> {
        if let Some(existing) = self.meta_tree.get(logical.as_bytes())? {
            return Ok(String::from_utf8_lossy(&existing).into_owned());
        }
        let physical = Uuid::new_v4().simple().to_string();
        // compare_and_swap so two concurrent first-uses agree on one id
        match self.meta_tree.compare_and_swap(
            logical.as_bytes(),
            None as Option<&[u8]>,
            Some(physical.as_bytes()),
        )? {
            Ok(()) => Ok(physical),
            Err(cas) => Ok(String::from_utf8_lossy(
                cas.current.as_deref().unwrap_or_default(),
            )
            .into_owned()),
        }
    }

    fn write_lock(&self, physical: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.write_locks.read().get(physical) {
            return lock.clone();
        }
        self.write_locks
            .write()
            .entry(physical.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Opens a line collection by logical name, creating it on first use.
    pub fn collection(&self, logical: &str) -> StoreResult<Collection> {
        let physical = self.resolve(logical)?;
        let docs = self.db.open_tree(format!("c:{physical}"))?;
        let indices = self.db.open_tree(format!("i:{physical}"))?;
        Ok(Collection::new(
            logical.to_string(),
            docs,
            indices,
            self.write_lock(&physical),
        ))
    }

    /// Opens a revision log by logical name, creating it on first use.
    pub fn revision_log(&self, logical: &str) -> StoreResult<RevisionLog> {
        let physical = self.resolve(logical)?;
        let tree = self.db.open_tree(format!("r:{physical}"))?;
        Ok(RevisionLog::new(logical.to_string(), tree))
    }

    /// Whether a logical collection has been created.
    pub fn collection_exists(&self, logical: &str) -> StoreResult<bool> {
        Ok(self.meta_tree.contains_key(logical.as_bytes())?)
    }

    /// Drops a logical collection and its physical trees.
    pub fn drop_collection(&self, logical: &str) -> StoreResult<()> {
        let Some(physical) = self.meta_tree.remove(logical.as_bytes())? else {
            return Ok(());
        };
        let physical = String::from_utf8_lossy(&physical).into_owned();
        self.drop_physical(&physical)?;
        debug!(collection = logical, "collection dropped");
        Ok(())
    }

    /// Atomically repoints `dst` at `src`'s data, replacing any existing
    /// `dst`. The destination pointer write is the commit point; the old
    /// destination trees are reclaimed afterwards.
    pub fn rename_collection(&self, src: &str, dst: &str) -> StoreResult<()> {
        let Some(physical) = self.meta_tree.get(src.as_bytes())? else {
            return Err(StoreError::CollectionNotFound(src.to_string()));
        };
        let old_dst = self.meta_tree.insert(dst.as_bytes(), physical)?;
        self.meta_tree.remove(src.as_bytes())?;
        if let Some(old) = old_dst {
            let old = String::from_utf8_lossy(&old).into_owned();
            self.drop_physical(&old)?;
        }
        info!(from = src, to = dst, "collection renamed");
        Ok(())
    }

    fn drop_physical(&self, physical: &str) -> StoreResult<()> {
        for prefix in ["c", "i", "r"] {
            let name = format!("{prefix}:{physical}");
            // sled creates trees lazily; dropping a never-opened tree is fine
            self.db.drop_tree(name.as_bytes())?;
        }
        self.write_locks.write().remove(physical);
        Ok(())
    }

    /// Returns the approximate total size of the database in bytes.
    pub fn size(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }

    /// Flushes all pending writes to disk.
    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }
}
