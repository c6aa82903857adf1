//! Document store built on sled.
//!
//! One logical collection per dataset holds the line documents, a second one
//! holds revision rows when history is enabled. Collections are resolved
//! through a logical-name -> physical-tree pointer kept in a meta tree, which
//! is what makes the drop-and-replace swap commit on a single meta write.
//!
//! The store deliberately mirrors the primitives of a generic document
//! database's unordered bulk write: each item succeeds or fails on its own
//! (duplicate-key conflicts are reported per item, never as a batch error),
//! and there is no atomicity across a batch.

pub mod backend;
pub mod collection;

pub use backend::{Backend, BackendConfig};
pub use collection::{
    BulkWriteResult, Collection, DocFilter, RevisionLog, WriteError, WriteErrorKind, WriteOp,
};

use thiserror::Error;

/// Store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("corrupt document in {collection}: {message}")]
    Corrupt { collection: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
