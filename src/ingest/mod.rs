//! Bulk ingestion: decoding uploaded content into lines, batching them
//! through the engine, and the drop-and-replace load path.

mod batch;
mod decode;

pub use batch::{bulk_load, BulkSummary, Indexer, LineIssue, LoadOptions, TransactionBatcher};
pub use decode::{
    parse_csv_record, CsvOptions, CsvSource, JsonSource, LineSource, NdJsonSource, VecSource,
};

use crate::history::HistoryError;
use crate::store::StoreError;
use crate::txn::TxnError;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// One input line could not be decoded. The driver samples it into the
    /// summary and then abandons the remaining input.
    #[error("line {line}: {message}")]
    Decode { line: usize, message: String },
    #[error(transparent)]
    Txn(#[from] TxnError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    History(#[from] HistoryError),
    /// The load was abandoned and any staged content rolled back; the
    /// partial summary is preserved for reporting.
    #[error("bulk load cancelled: {reason}")]
    Cancelled {
        summary: Box<BulkSummary>,
        reason: String,
    },
}

pub type IngestResult<T> = Result<T, IngestError>;
