use crate::{IngestError, IngestResult};

/// Default number of records per bulk upsert.
pub const DEFAULT_BATCH_SIZE: usize = 1000;
/// Default ceiling for one serialized row (1 MiB).
pub const DEFAULT_MAX_RECORD_BYTES: usize = 1 << 20;

/// Names of the input columns that feed the key, label and amount fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    pub key: String,
    pub label: String,
    pub amount: String,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            key: "sku".into(),
            label: "name".into(),
            amount: "price".into(),
        }
    }
}

impl ColumnMap {
    pub fn required(&self) -> [&str; 3] {
        [&self.key, &self.label, &self.amount]
    }
}

/// What the feed loop does when the store rejects a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SinkFailurePolicy {
    /// Stop the ingestion and surface the store error.
    #[default]
    Abort,
    /// Count the whole batch as failed and keep going.
    SkipBatch,
}

/// Per-ingestion settings.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Records buffered before a flush; also the peak buffered record count.
    pub batch_size: usize,
    /// Any single row above this size fails the stream.
    pub max_record_bytes: usize,
    pub columns: ColumnMap,
    pub on_sink_failure: SinkFailurePolicy,
    /// Rejected records kept in the summary; the rest are only counted.
    pub max_error_samples: usize,
    /// Emit a heartbeat log line every N consumed rows.
    pub heartbeat_rows: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
            columns: ColumnMap::default(),
            on_sink_failure: SinkFailurePolicy::default(),
            max_error_samples: 100,
            heartbeat_rows: 10_000,
        }
    }
}

impl IngestConfig {
    pub fn validate(&self) -> IngestResult<()> {
        if self.batch_size == 0 {
            return Err(IngestError::InvalidConfig("batch_size must be > 0".into()));
        }
        if self.max_record_bytes == 0 {
            return Err(IngestError::InvalidConfig(
                "max_record_bytes must be > 0".into(),
            ));
        }
        let cols = self.columns.required();
        if cols.iter().any(|c| c.trim().is_empty()) {
            return Err(IngestError::InvalidConfig(
                "column names must not be empty".into(),
            ));
        }
        if cols[0] == cols[1] || cols[0] == cols[2] || cols[1] == cols[2] {
            return Err(IngestError::InvalidConfig(format!(
                "column names must be distinct: {cols:?}"
            )));
        }
        Ok(())
    }
}
