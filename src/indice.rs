//! Ordering indice generation.
//!
//! Every write gets an `_i` value that is unique within the dataset and
//! reflects relative write order: within one dataset, a larger `_i` always
//! corresponds to a later or equal write, with ties broken by the submission
//! sequence inside a batch. This single integer backs cursor pagination of
//! revisions and "most recent N" queries without a secondary sort key.
//!
//! Two algorithms, selected per dataset and immutable after first use:
//!
//! - [`IndiceMode::Legacy`]: decimal concatenation of the millisecond delta
//!   since dataset creation and a zero-padded batch sequence. Values above
//!   2^53 lose the sequence to a random suffix (the precision horizon of the
//!   system this data model originated in); kept only so existing datasets
//!   keep a consistent ordering space.
//! - [`IndiceMode::Wide`] (default): millisecond delta times a fixed suffix
//!   span plus the batch sequence, raised above the last indice issued in
//!   this process. The raise is what makes ordering strict: two batches
//!   landing in the same millisecond still come out in claim order, which is
//!   submission order.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Indice algorithm version.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndiceMode {
    Legacy,
    #[default]
    Wide,
}

/// Largest integer exactly representable in an IEEE 754 double; legacy
/// indices beyond this point were historically garbled, so the generator
/// falls back instead of pretending the concatenation survived.
const LEGACY_PRECISION_HORIZON: i64 = 1 << 53;

/// Wide mode: `delta_ms * WIDE_SUFFIX_SPAN + seq`, then raised above the
/// last issued value. The sequence span bounds batch size and stays below
/// the suffix span so sequences never bleed into the time component.
const WIDE_SUFFIX_SPAN: i64 = 10_000;
const WIDE_SEQ_SPAN: i64 = 1_000;

/// Highest wide indice handed out by this process. Claiming
/// `max(candidate, last + 1)` keeps wide indices strictly increasing even
/// when batches share a millisecond, and unique across concurrent batches.
static LAST_WIDE_INDICE: AtomicI64 = AtomicI64::new(0);

fn claim_wide(candidate: i64) -> i64 {
    let mut last = LAST_WIDE_INDICE.load(Ordering::Relaxed);
    loop {
        let next = candidate.max(last + 1);
        match LAST_WIDE_INDICE.compare_exchange_weak(
            last,
            next,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return next,
            Err(observed) => last = observed,
        }
    }
}

/// Per-batch indice generator. One instance per engine invocation; the
/// sequence counter advances for every operation.
pub struct IndiceGenerator {
    mode: IndiceMode,
    created_at_ms: i64,
    /// zero-pad width of the legacy sequence field
    legacy_pad: u32,
    seq: i64,
}

impl IndiceGenerator {
    /// `max_batch_ops` bounds the per-batch sequence and fixes the legacy
    /// pad width (the number of digits of `max_batch_ops - 1`).
    pub fn new(mode: IndiceMode, dataset_created_at: DateTime<Utc>, max_batch_ops: usize) -> Self {
        debug_assert!(max_batch_ops as i64 <= WIDE_SEQ_SPAN);
        let legacy_pad = (max_batch_ops.saturating_sub(1).max(1)).ilog10() + 1;
        Self {
            mode,
            created_at_ms: dataset_created_at.timestamp_millis(),
            legacy_pad,
            seq: 0,
        }
    }

    /// Produces the indice for the next operation in the batch.
    pub fn next(&mut self, updated_at: DateTime<Utc>) -> i64 {
        let seq = self.seq;
        self.seq += 1;
        let delta_ms = (updated_at.timestamp_millis() - self.created_at_ms).max(0);
        match self.mode {
            IndiceMode::Legacy => self.legacy(delta_ms, seq),
            IndiceMode::Wide => claim_wide(delta_ms * WIDE_SUFFIX_SPAN + seq),
        }
    }

    fn legacy(&self, delta_ms: i64, seq: i64) -> i64 {
        let shift = 10i64.pow(self.legacy_pad);
        let value = delta_ms * shift + seq;
        if value < LEGACY_PRECISION_HORIZON {
            value
        } else {
            // beyond the double-precision horizon the original scheme lost
            // its sequence digits; a random suffix keeps uniqueness but not
            // intra-batch ordering
            let suffix = rand::thread_rng().gen_range(0..shift);
            warn!(
                delta_ms,
                "legacy ordering indice overflow, falling back to random suffix"
            );
            delta_ms * shift + suffix
        }
    }
}
