//! Bulk sink: one validated batch in, one bulk upsert out.

use crate::record::{NormalizedRecord, RawRecord, RejectedRecord, Validator};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, trace};

/// Match clause of an upsert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpsertFilter {
    pub key: String,
}

/// Fields written by an upsert.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertFields {
    pub label: String,
    pub amount: f64,
    pub updated_at: DateTime<Utc>,
}

/// One "update or insert by key" operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpsertOp {
    pub filter: UpsertFilter,
    pub set: UpsertFields,
    pub upsert: bool,
}

impl UpsertOp {
    pub fn new(record: NormalizedRecord, updated_at: DateTime<Utc>) -> Self {
        Self {
            filter: UpsertFilter { key: record.key },
            set: UpsertFields {
                label: record.label,
                amount: record.amount,
                updated_at,
            },
            upsert: true,
        }
    }
}

/// Store acknowledgement for one bulk call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ack {
    pub matched: u64,
    pub upserted: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is disconnected")]
    Disconnected,
    #[error("bulk write rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// The persistence capability. Pooling, timeouts and retries are the
/// implementor's business; one call is one round trip.
#[async_trait]
pub trait BulkStore: Send + Sync {
    /// Whether the store can take writes right now.
    fn is_connected(&self) -> bool;

    async fn bulk_upsert(&self, ops: Vec<UpsertOp>) -> Result<Ack, StoreError>;
}

/// Outcome of one flushed batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    pub processed: u64,
    pub failed: u64,
    pub errors: Vec<RejectedRecord>,
}

/// Validates a batch and writes its valid members with a single bulk call.
pub struct BulkSink<S: ?Sized> {
    store: Arc<S>,
    validator: Validator,
}

impl<S: BulkStore + ?Sized> BulkSink<S> {
    pub fn new(store: Arc<S>, validator: Validator) -> Self {
        Self { store, validator }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Consumes the batch. No store call is made when nothing is valid; a
    /// store failure is returned as-is for the caller to act on.
    pub async fn flush(&self, batch: Vec<RawRecord>) -> Result<BatchResult, StoreError> {
        let updated_at = Utc::now();
        let mut ops = Vec::with_capacity(batch.len());
        let mut errors = Vec::new();

        for raw in batch {
            match self.validator.check(&raw) {
                Ok(record) => ops.push(UpsertOp::new(record, updated_at)),
                Err(rejected) => {
                    trace!(key = ?rejected.key, reason = %rejected.reason, "record rejected");
                    errors.push(rejected);
                }
            }
        }

        let processed = ops.len() as u64;
        if !ops.is_empty() {
            let ack = self.store.bulk_upsert(ops).await?;
            debug!(
                processed,
                matched = ack.matched,
                upserted = ack.upserted,
                "bulk upsert done"
            );
        }

        Ok(BatchResult {
            processed,
            failed: errors.len() as u64,
            errors,
        })
    }
}

/// A stored row as kept by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub label: String,
    pub amount: f64,
    pub updated_at: DateTime<Utc>,
}

/// In-process [`BulkStore`] keyed by record key. Ops apply in order, so a
/// repeated key inside one call ends with its last value.
#[derive(Debug)]
pub struct MemoryStore {
    rows: Mutex<HashMap<String, StoredRecord>>,
    connected: AtomicBool,
    calls: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            calls: AtomicU64::new(0),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Number of `bulk_upsert` round trips served.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Option<StoredRecord> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

#[async_trait]
impl BulkStore for MemoryStore {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn bulk_upsert(&self, ops: Vec<UpsertOp>) -> Result<Ack, StoreError> {
        if !self.is_connected() {
            return Err(StoreError::Disconnected);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ack = Ack::default();
        for op in ops {
            let row = StoredRecord {
                label: op.set.label,
                amount: op.set.amount,
                updated_at: op.set.updated_at,
            };
            match rows.insert(op.filter.key, row) {
                Some(_) => ack.matched += 1,
                None => ack.upserted += 1,
            }
        }
        Ok(ack)
    }
}
