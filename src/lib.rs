//! Bounded-memory CSV ingestion into a bulk-upsert store.
//!
//! - Input: any `AsyncRead` (plain, gzip or zstd; any `encoding_rs` charset).
//! - Records are parsed one at a time, grouped into batches of `batch_size`,
//!   validated and written with one bulk upsert per batch.
//! - The parser is only polled again once the previous batch is stored, so peak
//!   memory is a function of the batch size, not of the input size.
//! - Progress is broadcast to any number of subscribers without slowing the
//!   pipeline down.
//!
//! Data shape:
//! - `RawRecord` (header-mapped row) -> `NormalizedRecord { key, label, amount }`
//!   or `RejectedRecord { key, reason }`
//! - `BatchResult { processed, failed, errors }` per batch
//! - `IngestSummary { processed, failed, .. }` per ingestion
#![cfg_attr(docsrs, feature(doc_cfg))]
//
mod accumulator;
mod codec;
mod config;
mod io;
pub mod logging;
mod pipeline;
mod progress;
mod record;
mod sink;
mod source;

pub use crate::accumulator::BatchAccumulator;
pub use crate::codec::RowLimitExceeded;
pub use crate::config::{ColumnMap, IngestConfig, SinkFailurePolicy};
pub use crate::io::{build_csv_reader, reader_from_path, UploadMeta};
pub use crate::pipeline::{IngestSummary, Ingestor};
pub use crate::progress::{
    MemoryGauge, ProgressEvent, ProgressReporter, ProgressStatus, Subscription,
};
pub use crate::record::{NormalizedRecord, RawRecord, RejectedRecord, Rejection, Validator};
pub use crate::sink::{
    Ack, BatchResult, BulkSink, BulkStore, MemoryStore, StoreError, StoredRecord, UpsertFields,
    UpsertFilter, UpsertOp,
};
pub use crate::source::CsvRecordSource;

use thiserror::Error;

/// Error type returned by this crate when not using `anyhow`.
///
/// Rejected records are not errors: they are counted in [`BatchResult`] and
/// never abort an ingestion. Everything here does.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("store is not connected")]
    StoreUnavailable,
    #[error("Missing required header: {0}")]
    MissingHeader(String),
    #[error("record at line {line} exceeds the {limit} byte row limit")]
    RecordTooLarge { limit: usize, line: u64 },
    #[error("upstream stream failed: {0}")]
    Upstream(#[from] csv_async::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("bulk upsert failed for batch {batch}")]
    Sink {
        batch: u64,
        #[source]
        source: StoreError,
    },
    /// A fatal error hit mid-stream. Batches committed before it stay committed.
    #[error("ingestion aborted after {processed} committed records ({failed} rejected)")]
    Aborted {
        processed: u64,
        failed: u64,
        #[source]
        source: Box<IngestError>,
    },
}

impl IngestError {
    /// The underlying cause, looking through [`IngestError::Aborted`].
    pub fn root(&self) -> &IngestError {
        match self {
            IngestError::Aborted { source, .. } => source.root(),
            other => other,
        }
    }

    /// True when some records may already have been written to the store.
    pub fn is_partial(&self) -> bool {
        matches!(self, IngestError::Aborted { processed, .. } if *processed > 0)
    }
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_looks_through_aborted() {
        let err = IngestError::Aborted {
            processed: 2000,
            failed: 3,
            source: Box::new(IngestError::RecordTooLarge {
                limit: 16,
                line: 2004,
            }),
        };
        assert!(err.is_partial());
        assert!(matches!(
            err.root(),
            IngestError::RecordTooLarge { line: 2004, .. }
        ));
        assert_eq!(
            err.to_string(),
            "ingestion aborted after 2000 committed records (3 rejected)"
        );
    }

    #[test]
    fn abort_before_any_commit_is_not_partial() {
        let err = IngestError::Aborted {
            processed: 0,
            failed: 0,
            source: Box::new(IngestError::StoreUnavailable),
        };
        assert!(!err.is_partial());
        assert!(!IngestError::StoreUnavailable.is_partial());
    }
}
