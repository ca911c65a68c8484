//! The feed loop: parsed records in, bulk upserts out, one batch at a time.

use crate::accumulator::BatchAccumulator;
use crate::config::{IngestConfig, SinkFailurePolicy};
use crate::io::{build_csv_reader, reader_from_path, UploadMeta};
use crate::progress::{MemoryGauge, ProgressEvent, ProgressReporter, ProgressStatus};
use crate::record::{RawRecord, RejectedRecord, Validator};
use crate::sink::{BatchResult, BulkSink, BulkStore};
use crate::source::CsvRecordSource;
use crate::{IngestError, IngestResult};
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

/// Aggregate outcome of one ingestion. Bounded in size whatever the input.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSummary {
    #[serde(rename = "processedCount")]
    pub processed: u64,
    #[serde(rename = "failedCount")]
    pub failed: u64,
    pub batches: u64,
    /// Batches dropped under [`SinkFailurePolicy::SkipBatch`].
    pub skipped_batches: u64,
    /// The first `max_error_samples` rejected records.
    pub error_samples: Vec<RejectedRecord>,
    #[serde(skip)]
    pub elapsed: Duration,
}

/// Drives record streams into a [`BulkStore`].
///
/// One `Ingestor` can serve any number of concurrent ingestions; each call
/// runs its own pipeline with at most one batch in flight.
pub struct Ingestor<S: ?Sized> {
    config: IngestConfig,
    sink: BulkSink<S>,
    reporter: ProgressReporter,
}

impl<S: BulkStore + ?Sized> Ingestor<S> {
    pub fn new(config: IngestConfig, store: Arc<S>, reporter: ProgressReporter) -> IngestResult<Self> {
        config.validate()?;
        let sink = BulkSink::new(store, Validator::new(config.columns.clone()));
        Ok(Self {
            config,
            sink,
            reporter,
        })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn reporter(&self) -> &ProgressReporter {
        &self.reporter
    }

    /// Ingest a local file; compression is picked from its extension.
    pub async fn ingest_path(&self, path: &Path) -> IngestResult<IngestSummary> {
        self.ensure_connected()?;
        let (reader, meta) = reader_from_path(path, self.config.max_record_bytes).await?;
        self.ingest_decoded(reader, &meta.name_hint).await
    }

    /// Ingest an upload body described by `meta`.
    pub async fn ingest_reader<R>(&self, raw: R, meta: UploadMeta) -> IngestResult<IngestSummary>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.ensure_connected()?;
        let (reader, meta) = build_csv_reader(raw, meta, self.config.max_record_bytes);
        self.ingest_decoded(reader, &meta.name_hint).await
    }

    async fn ingest_decoded<R>(&self, reader: R, label: &str) -> IngestResult<IngestSummary>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let source = CsvRecordSource::open(reader, &self.config).await?;
        self.run(label, source.into_stream()).await
    }

    fn ensure_connected(&self) -> IngestResult<()> {
        if self.sink.store().is_connected() {
            Ok(())
        } else {
            Err(IngestError::StoreUnavailable)
        }
    }

    /// Feed `records` through the accumulator and sink until the stream ends.
    ///
    /// The next record is only pulled once any flush triggered by the previous
    /// one has finished, so upstream reads are paced by the store. Any error
    /// after the first record is wrapped in [`IngestError::Aborted`] with the
    /// totals committed so far; the unflushed remainder is dropped.
    pub async fn run<St>(&self, label: &str, records: St) -> IngestResult<IngestSummary>
    where
        St: Stream<Item = IngestResult<RawRecord>>,
    {
        self.ensure_connected()?;
        info!(ingestion = label, batch_size = self.config.batch_size, "ingestion started");

        let mut records = std::pin::pin!(records);
        let mut acc = BatchAccumulator::new(self.config.batch_size);
        let mut run = RunState::new(label, &self.config);

        while let Some(next) = records.next().await {
            let record = match next {
                Ok(record) => record,
                Err(err) => return Err(self.abort(&mut run, err)),
            };
            if let Some(batch) = acc.push(record) {
                self.flush(batch, &mut run).await?;
            }
        }
        if let Some(batch) = acc.finalize() {
            self.flush(batch, &mut run).await?;
        }

        self.reporter.publish(run.event(ProgressStatus::Completed));
        let summary = run.finish();
        info!(
            ingestion = label,
            processed = summary.processed,
            failed = summary.failed,
            batches = summary.batches,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "ingestion finished"
        );
        Ok(summary)
    }

    async fn flush(&self, batch: Vec<RawRecord>, run: &mut RunState) -> IngestResult<()> {
        let rows = batch.len() as u64;
        let batch_no = run.batches + 1;

        match self.sink.flush(batch).await {
            Ok(result) => run.record(result),
            Err(source) => {
                let err = IngestError::Sink {
                    batch: batch_no,
                    source,
                };
                match self.config.on_sink_failure {
                    SinkFailurePolicy::Abort => return Err(self.abort(run, err)),
                    SinkFailurePolicy::SkipBatch => {
                        warn!(ingestion = %run.label, batch = batch_no, rows, error = %err, "skipping batch");
                        run.skip(rows);
                    }
                }
            }
        }

        debug!(
            ingestion = %run.label,
            batch = run.batches,
            processed = run.processed,
            failed = run.failed,
            "batch flushed"
        );
        run.heartbeat();
        self.reporter.publish(run.event(ProgressStatus::Progress));
        Ok(())
    }

    fn abort(&self, run: &mut RunState, err: IngestError) -> IngestError {
        warn!(
            ingestion = %run.label,
            processed = run.processed,
            failed = run.failed,
            error = %err,
            "ingestion aborted"
        );
        self.reporter.publish(run.event(ProgressStatus::Aborted));
        IngestError::Aborted {
            processed: run.processed,
            failed: run.failed,
            source: Box::new(err),
        }
    }
}

/// Running totals of one ingestion.
struct RunState {
    label: String,
    processed: u64,
    failed: u64,
    batches: u64,
    skipped_batches: u64,
    error_samples: Vec<RejectedRecord>,
    max_error_samples: usize,
    heartbeat_rows: u64,
    next_heartbeat: u64,
    gauge: MemoryGauge,
    started: Instant,
}

impl RunState {
    fn new(label: &str, config: &IngestConfig) -> Self {
        Self {
            label: label.to_string(),
            processed: 0,
            failed: 0,
            batches: 0,
            skipped_batches: 0,
            error_samples: Vec::new(),
            max_error_samples: config.max_error_samples,
            heartbeat_rows: config.heartbeat_rows,
            next_heartbeat: config.heartbeat_rows,
            gauge: MemoryGauge::new(),
            started: Instant::now(),
        }
    }

    fn record(&mut self, result: BatchResult) {
        self.batches += 1;
        self.processed += result.processed;
        self.failed += result.failed;
        let room = self.max_error_samples.saturating_sub(self.error_samples.len());
        self.error_samples
            .extend(result.errors.into_iter().take(room));
    }

    fn skip(&mut self, rows: u64) {
        self.batches += 1;
        self.skipped_batches += 1;
        self.failed += rows;
    }

    fn heartbeat(&mut self) {
        let seen = self.processed + self.failed;
        if self.heartbeat_rows == 0 || seen < self.next_heartbeat {
            return;
        }
        while self.next_heartbeat <= seen {
            self.next_heartbeat += self.heartbeat_rows;
        }
        info!(
            ingestion = %self.label,
            processed = self.processed,
            failed = self.failed,
            memory_mb = self.gauge.sample_mb(),
            "progress"
        );
    }

    fn event(&mut self, status: ProgressStatus) -> ProgressEvent {
        ProgressEvent {
            ingestion: self.label.clone(),
            total_processed: self.processed,
            total_failed: self.failed,
            batches: self.batches,
            memory_gauge_mb: self.gauge.sample_mb(),
            timestamp: Utc::now(),
            status,
        }
    }

    fn finish(self) -> IngestSummary {
        IngestSummary {
            processed: self.processed,
            failed: self.failed,
            batches: self.batches,
            skipped_batches: self.skipped_batches,
            error_samples: self.error_samples,
            elapsed: self.started.elapsed(),
        }
    }
}
