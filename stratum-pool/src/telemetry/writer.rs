//! Background writer: batches rows from the queue into the store.
//!
//! A failed batch is retried with exponential backoff. Once the retries are
//! used up (or shutdown is requested during a backoff) the batch goes to the
//! disk spool. A batch the spool also refuses is lost and counted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::queue::QueueHealth;
use super::rows::TelemetryRow;
use super::spool::Spool;
use super::store::TelemetryStore;
use crate::config::TelemetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterSettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_retries: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl From<&TelemetryConfig> for WriterSettings {
    fn from(config: &TelemetryConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval(),
            max_retries: config.max_retries,
            backoff_initial: Duration::from_millis(config.backoff_initial_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }
}

impl WriterSettings {
    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.backoff_initial
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

/// Where one batch is in its write cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    Attempting { attempt: u32 },
    Backoff { attempt: u32, delay: Duration },
    Spooling,
}

pub struct TelemetryWriter {
    rx: mpsc::Receiver<TelemetryRow>,
    /// Batch being collected; survives cancellation of `collect_batch`
    pending: Vec<TelemetryRow>,
    store: Arc<dyn TelemetryStore>,
    spool: Arc<Spool>,
    health: Arc<QueueHealth>,
    settings: WriterSettings,
}

impl TelemetryWriter {
    pub fn new(
        rx: mpsc::Receiver<TelemetryRow>,
        store: Arc<dyn TelemetryStore>,
        spool: Arc<Spool>,
        health: Arc<QueueHealth>,
        settings: WriterSettings,
    ) -> Self {
        Self {
            rx,
            pending: Vec::new(),
            store,
            spool,
            health,
            settings,
        }
    }

    /// Run until the channel closes or `shutdown` fires; on shutdown the
    /// rows already queued are still written (or spooled).
    pub async fn run(mut self, shutdown: CancellationToken) {
        debug!("Telemetry writer started");
        loop {
            let open = tokio::select! {
                open = self.collect_batch() => open,
                _ = shutdown.cancelled() => break,
            };
            if !open {
                break;
            }
            let batch = std::mem::take(&mut self.pending);
            self.write_batch(batch, &shutdown).await;
        }

        self.rx.close();
        let mut drained = 0;
        loop {
            let mut batch = std::mem::take(&mut self.pending);
            let room = self.settings.batch_size.saturating_sub(batch.len());
            if room > 0 {
                self.rx.recv_many(&mut batch, room).await;
            }
            if batch.is_empty() {
                break;
            }
            drained += batch.len();
            self.write_batch(batch, &shutdown).await;
        }
        info!(drained, "Telemetry writer stopped");
    }

    /// Wait for at least one row, then keep collecting into `pending` until
    /// the batch is full or the flush interval passes. False once the
    /// channel is closed and empty.
    async fn collect_batch(&mut self) -> bool {
        let size = self.settings.batch_size;
        if self.rx.recv_many(&mut self.pending, size).await == 0 {
            return false;
        }
        let deadline = Instant::now() + self.settings.flush_interval;
        while self.pending.len() < size {
            let room = size - self.pending.len();
            match timeout_at(deadline, self.rx.recv_many(&mut self.pending, room)).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        true
    }

    async fn write_batch(&self, batch: Vec<TelemetryRow>, shutdown: &CancellationToken) {
        let mut state = WriteState::Attempting { attempt: 0 };
        loop {
            state = match state {
                WriteState::Attempting { attempt } => {
                    match self.store.insert_batch(&batch).await {
                        Ok(()) => {
                            self.health.record_written(batch.len());
                            return;
                        }
                        Err(e) => {
                            warn!(rows = batch.len(), attempt, error = %e, "Telemetry write failed");
                            self.health.record_error(&e);
                            if attempt >= self.settings.max_retries || shutdown.is_cancelled() {
                                WriteState::Spooling
                            } else {
                                WriteState::Backoff {
                                    attempt,
                                    delay: self.settings.backoff(attempt),
                                }
                            }
                        }
                    }
                }
                WriteState::Backoff { attempt, delay } => {
                    QueueHealth::add(&self.health.retries, 1);
                    tokio::select! {
                        _ = sleep(delay) => WriteState::Attempting { attempt: attempt + 1 },
                        _ = shutdown.cancelled() => WriteState::Spooling,
                    }
                }
                WriteState::Spooling => {
                    match self.spool.append(&batch).await {
                        Ok(()) => {
                            QueueHealth::add(&self.health.spooled_rows, batch.len());
                            QueueHealth::add(&self.health.spool_backlog, batch.len());
                            warn!(rows = batch.len(), path = %self.spool.path().display(), "Spooled telemetry batch");
                        }
                        Err(e) => {
                            QueueHealth::add(&self.health.spool_failures, 1);
                            QueueHealth::add(&self.health.lost_rows, batch.len());
                            self.health.record_error(&e);
                            error!(rows = batch.len(), error = %e, "Telemetry spool failed, rows lost");
                        }
                    }
                    return;
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::telemetry::queue::TelemetryQueue;
    use crate::telemetry::rows::tests::share;
    use crate::telemetry::store::mock::FlakyStore;

    fn settings() -> WriterSettings {
        WriterSettings {
            batch_size: 4,
            flush_interval: Duration::from_millis(50),
            max_retries: 2,
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_millis(150),
        }
    }

    fn row(ts: i64) -> TelemetryRow {
        TelemetryRow::Share(share(ts, "alice", true, None))
    }

    struct Harness {
        queue: TelemetryQueue,
        store: Arc<FlakyStore>,
        spool: Arc<Spool>,
        shutdown: CancellationToken,
        task: tokio::task::JoinHandle<()>,
        _dir: tempfile::TempDir,
    }

    fn start(store: FlakyStore) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let (queue, rx) = TelemetryQueue::new(64);
        let store = Arc::new(store);
        let spool = Arc::new(Spool::new(dir.path().join("telemetry.spool")));
        let shutdown = CancellationToken::new();
        let writer = TelemetryWriter::new(
            rx,
            store.clone(),
            spool.clone(),
            queue.health_counters(),
            settings(),
        );
        let task = tokio::spawn(writer.run(shutdown.clone()));
        Harness {
            queue,
            store,
            spool,
            shutdown,
            task,
            _dir: dir,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let s = settings();
        assert_eq!(s.backoff(0), Duration::from_millis(100));
        assert_eq!(s.backoff(1), Duration::from_millis(150));
        assert_eq!(s.backoff(40), Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rows_are_batched() {
        let h = start(FlakyStore::default());
        for ts in 0..6 {
            h.queue.enqueue(row(ts));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let health = h.queue.health();
        assert_eq!(health.written_rows, 6);
        assert_eq!(health.batches, 2);
        assert_eq!(health.depth, 0);
        assert!(!health.degraded);

        h.shutdown.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let h = start(FlakyStore::failing());
        h.queue.enqueue(row(1));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(h.store.attempts(), 1);

        h.store.set_failing(false);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.store.all_shares().await.len(), 1);

        let health = h.queue.health();
        assert_eq!(health.retries, 1);
        assert_eq!(health.spooled_rows, 0);
        assert!(!health.degraded);
        assert!(health.last_error.is_some());

        h.shutdown.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_spool_every_row_once() {
        let h = start(FlakyStore::failing());
        for ts in 0..10 {
            h.queue.enqueue(row(ts));
        }
        tokio::time::sleep(Duration::from_secs(5)).await;

        // 3 batches, each tried 1 + max_retries times
        assert_eq!(h.store.attempts(), 9);
        let health = h.queue.health();
        assert_eq!(health.spooled_rows, 10);
        assert_eq!(health.spool_backlog, 10);
        assert!(health.degraded);
        assert_eq!(h.spool.pending().await.unwrap(), 10);

        // Replay removes exactly what it stored
        h.store.set_failing(false);
        let outcome = h.spool.replay(h.store.as_ref(), 100).await.unwrap();
        assert_eq!(outcome.replayed, 10);
        let ts: Vec<i64> = h.store.all_shares().await.iter().map(|s| s.ts).collect();
        assert_eq!(ts, (0..10).collect::<Vec<_>>());
        assert_eq!(h.spool.pending().await.unwrap(), 0);

        h.shutdown.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_queue() {
        let h = start(FlakyStore::default());
        h.shutdown.cancel();
        // Rows offered just before the writer observes shutdown
        for ts in 0..3 {
            h.queue.enqueue(row(ts));
        }
        h.task.await.unwrap();
        let written = h.queue.health_counters().written_rows.load(Ordering::Relaxed);
        let spooled = h.queue.health().spooled_rows;
        assert_eq!(written + spooled, 3);
    }
}
