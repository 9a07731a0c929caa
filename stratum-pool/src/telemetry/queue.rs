//! Bounded, non-blocking hand-off from sessions to the writer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use super::rows::TelemetryRow;

/// Counters shared by the queue, writer and maintenance tasks.
#[derive(Debug, Default)]
pub struct QueueHealth {
    capacity: usize,
    pub(crate) enqueued: AtomicU64,
    pub(crate) dropped: AtomicU64,
    pub(crate) written_rows: AtomicU64,
    pub(crate) batches: AtomicU64,
    pub(crate) retries: AtomicU64,
    pub(crate) spooled_rows: AtomicU64,
    pub(crate) spool_failures: AtomicU64,
    pub(crate) lost_rows: AtomicU64,
    pub(crate) replayed_rows: AtomicU64,
    pub(crate) corrupt_spool_lines: AtomicU64,
    pub(crate) spool_backlog: AtomicU64,
    degraded: AtomicBool,
    last_error: Mutex<Option<String>>,
}

/// Point-in-time view of [`QueueHealth`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub depth: usize,
    pub capacity: usize,
    pub enqueued: u64,
    pub dropped: u64,
    pub written_rows: u64,
    pub batches: u64,
    pub retries: u64,
    pub spooled_rows: u64,
    pub spool_failures: u64,
    pub lost_rows: u64,
    pub replayed_rows: u64,
    pub corrupt_spool_lines: u64,
    pub spool_backlog: u64,
    pub last_error: Option<String>,
    /// The last write attempt failed, or rows are waiting in the spool
    pub degraded: bool,
}

impl QueueHealth {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    pub(crate) fn record_error(&self, error: impl ToString) {
        *self.last_error.lock() = Some(error.to_string());
        self.degraded.store(true, Ordering::Relaxed);
    }

    pub(crate) fn record_written(&self, rows: usize) {
        self.written_rows.fetch_add(rows as u64, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.degraded.store(false, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Subtract without wrapping below zero.
    pub(crate) fn sub(counter: &AtomicU64, n: usize) {
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(n as u64))
        });
    }

    pub fn snapshot(&self, depth: usize) -> HealthSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let spool_backlog = load(&self.spool_backlog);
        HealthSnapshot {
            depth,
            capacity: self.capacity,
            enqueued: load(&self.enqueued),
            dropped: load(&self.dropped),
            written_rows: load(&self.written_rows),
            batches: load(&self.batches),
            retries: load(&self.retries),
            spooled_rows: load(&self.spooled_rows),
            spool_failures: load(&self.spool_failures),
            lost_rows: load(&self.lost_rows),
            replayed_rows: load(&self.replayed_rows),
            corrupt_spool_lines: load(&self.corrupt_spool_lines),
            spool_backlog,
            last_error: self.last_error.lock().clone(),
            degraded: self.degraded.load(Ordering::Relaxed) || spool_backlog > 0,
        }
    }
}

/// Producer side of the telemetry pipeline. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TelemetryQueue {
    tx: mpsc::Sender<TelemetryRow>,
    health: Arc<QueueHealth>,
}

impl TelemetryQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TelemetryRow>) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let queue = Self {
            tx,
            health: Arc::new(QueueHealth::new(capacity)),
        };
        (queue, rx)
    }

    /// Offer a row without waiting. Returns false when it was dropped.
    pub fn enqueue(&self, row: TelemetryRow) -> bool {
        match self.tx.try_send(row) {
            Ok(()) => {
                self.health.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                let dropped = self.health.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    debug!(dropped, "Telemetry queue full, dropping rows");
                }
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.health.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot(self.depth())
    }

    pub(crate) fn health_counters(&self) -> Arc<QueueHealth> {
        self.health.clone()
    }
}
