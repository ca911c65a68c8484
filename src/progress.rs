//! Progress fan-out.
//!
//! One [`ProgressReporter`] is created at process start and handed (cloned) to
//! every pipeline and every listener that needs it. Publishing never waits on
//! listeners: each subscription reads from a bounded ring, and a listener that
//! falls behind loses its oldest events instead of slowing the producer down.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use sysinfo::{Pid, System};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

/// Default number of events a subscription can fall behind by.
pub const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Progress,
    Completed,
    Aborted,
}

/// Snapshot published after each batch and once at the end of an ingestion.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// Label of the ingestion this event belongs to (usually the file name).
    pub ingestion: String,
    pub total_processed: u64,
    pub total_failed: u64,
    pub batches: u64,
    #[serde(rename = "memoryGaugeMB")]
    pub memory_gauge_mb: u64,
    pub timestamp: DateTime<Utc>,
    pub status: ProgressStatus,
}

/// Process-wide broadcast of [`ProgressEvent`]s. Cheap to clone.
#[derive(Clone)]
pub struct ProgressReporter {
    sender: Arc<Mutex<Option<broadcast::Sender<ProgressEvent>>>>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` bounds how far one subscription may lag before it starts
    /// losing its oldest events.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// Deliver to every current subscription. No-op without subscribers or
    /// after [`shutdown`](Self::shutdown).
    pub fn publish(&self, event: ProgressEvent) {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = guard.as_ref() {
            // Err only means nobody is listening
            let _ = tx.send(event);
        }
    }

    /// Receive events published from now on.
    pub fn subscribe(&self) -> Subscription {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        Subscription {
            rx: guard.as_ref().map(broadcast::Sender::subscribe),
            missed: 0,
        }
    }

    /// Stop delivering to `sub`. Safe to call any number of times.
    pub fn unsubscribe(&self, sub: &mut Subscription) {
        sub.unsubscribe();
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, broadcast::Sender::receiver_count)
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Tear down: subscriptions drain what they already hold, then end.
    pub fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// One listener's view of the event stream. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    rx: Option<broadcast::Receiver<ProgressEvent>>,
    missed: u64,
}

impl Subscription {
    /// Next event, or `None` once unsubscribed or the reporter shut down.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            let rx = self.rx.as_mut()?;
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => self.missed += n,
                Err(RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        loop {
            let rx = self.rx.as_mut()?;
            match rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(n)) => self.missed += n,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    pub fn unsubscribe(&mut self) {
        self.rx = None;
    }

    pub fn is_active(&self) -> bool {
        self.rx.is_some()
    }

    /// Events dropped because this subscription fell behind.
    pub fn missed(&self) -> u64 {
        self.missed
    }
}

/// Resident memory of the current process, in MiB.
pub struct MemoryGauge {
    system: System,
    pid: Option<Pid>,
}

impl Default for MemoryGauge {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGauge {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// Zero when the platform does not expose process memory.
    pub fn sample_mb(&mut self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        if !self.system.refresh_process(pid) {
            return 0;
        }
        self.system
            .process(pid)
            .map_or(0, |p| (p.memory() + (1 << 19)) >> 20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: u64) -> ProgressEvent {
        ProgressEvent {
            ingestion: "products.csv".into(),
            total_processed: n,
            total_failed: 0,
            batches: n,
            memory_gauge_mb: 12,
            timestamp: Utc::now(),
            status: ProgressStatus::Progress,
        }
    }

    #[tokio::test]
    async fn late_subscribers_only_see_later_events() {
        let reporter = ProgressReporter::new();
        let mut early = reporter.subscribe();
        reporter.publish(event(1));

        let mut late = reporter.subscribe();
        reporter.publish(event(2));

        assert_eq!(early.recv().await.unwrap().total_processed, 1);
        assert_eq!(early.recv().await.unwrap().total_processed, 2);
        assert_eq!(late.recv().await.unwrap().total_processed, 2);
        assert!(late.try_recv().is_none());
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_isolated() {
        let reporter = ProgressReporter::new();
        let mut a = reporter.subscribe();
        let mut b = reporter.subscribe();
        assert_eq!(reporter.subscriber_count(), 2);

        reporter.unsubscribe(&mut a);
        reporter.unsubscribe(&mut a);
        assert!(!a.is_active());
        assert_eq!(reporter.subscriber_count(), 1);

        reporter.publish(event(7));
        assert!(a.recv().await.is_none());
        assert_eq!(b.recv().await.unwrap().total_processed, 7);
    }

    #[test]
    fn slow_subscriber_loses_oldest_without_blocking() {
        let reporter = ProgressReporter::with_capacity(2);
        let mut slow = reporter.subscribe();
        for n in 1..=5 {
            reporter.publish(event(n));
        }

        assert_eq!(slow.try_recv().unwrap().total_processed, 4);
        assert_eq!(slow.try_recv().unwrap().total_processed, 5);
        assert!(slow.try_recv().is_none());
        assert_eq!(slow.missed(), 3);
    }

    #[tokio::test]
    async fn shutdown_drains_then_ends() {
        let reporter = ProgressReporter::new();
        let mut sub = reporter.subscribe();
        reporter.publish(event(1));
        reporter.shutdown();
        reporter.publish(event(2));

        assert!(reporter.is_shut_down());
        assert_eq!(sub.recv().await.unwrap().total_processed, 1);
        assert!(sub.recv().await.is_none());
        assert!(!reporter.subscribe().is_active());
    }

    #[test]
    fn event_json_shape() {
        let json = serde_json::to_value(event(3)).unwrap();
        assert_eq!(json["totalProcessed"], 3);
        assert_eq!(json["memoryGaugeMB"], 12);
        assert_eq!(json["status"], "progress");
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn gauge_reads_something_on_linux() {
        let mut gauge = MemoryGauge::new();
        if cfg!(target_os = "linux") {
            assert!(gauge.sample_mb() > 0);
        }
    }
}
