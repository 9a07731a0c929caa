//! Durable telemetry pipeline.
//!
//! ```text
//! sessions --enqueue--> TelemetryQueue --batches--> TelemetryWriter --> TelemetryStore
//!                                                        |                   ^
//!                                                        +--> Spool --replay-+
//! ```
//!
//! Producers never wait: a full queue drops the row and counts it. The
//! writer retries failed batches with backoff and spools what it cannot
//! store. [`maintenance::Maintenance`] replays the spool, rebuilds rollups
//! and applies retention.

pub mod maintenance;
pub mod queue;
pub mod rows;
pub mod spool;
pub mod sqlite;
pub mod store;
pub mod writer;

use std::sync::Arc;

use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

pub use queue::{HealthSnapshot, TelemetryQueue};
pub use rows::{
    BlockRow, ShareQuery, ShareRollup, ShareRow, TelemetryRow, WorkerEvent, WorkerEventKind,
};
pub use store::{MemoryStore, StoreError, TelemetryStore};

use crate::config::TelemetryConfig;
use maintenance::Maintenance;
use queue::QueueHealth;
use spool::Spool;
use sqlite::SqliteStore;
use writer::{TelemetryWriter, WriterSettings};

pub fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

pub fn unix_now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Handles to a running pipeline.
#[derive(Clone)]
pub struct Telemetry {
    pub queue: TelemetryQueue,
    pub store: Arc<dyn TelemetryStore>,
}

impl Telemetry {
    /// Open the configured store and start the writer and maintenance tasks
    /// on `tracker`. Both stop when `shutdown` fires, the writer after
    /// draining what is already queued.
    pub async fn start(
        config: &TelemetryConfig,
        tracker: &TaskTracker,
        shutdown: CancellationToken,
    ) -> Result<Self, StoreError> {
        let store: Arc<dyn TelemetryStore> = match &config.database {
            Some(path) => {
                info!(path = %path.display(), "Opening telemetry database");
                Arc::new(SqliteStore::open(path).await?)
            }
            None => {
                info!("No telemetry database configured, keeping rows in memory");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::start_with_store(config, store, tracker, shutdown).await)
    }

    pub async fn start_with_store(
        config: &TelemetryConfig,
        store: Arc<dyn TelemetryStore>,
        tracker: &TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        let (queue, rx) = TelemetryQueue::new(config.queue_capacity);
        let health = queue.health_counters();
        let spool = Arc::new(Spool::new(&config.spool_path));

        match spool.pending().await {
            Ok(0) => {}
            Ok(n) => {
                info!(rows = n, "Spooled telemetry awaiting replay");
                QueueHealth::add(&health.spool_backlog, n);
            }
            Err(e) => health.record_error(&e),
        }

        let writer = TelemetryWriter::new(
            rx,
            store.clone(),
            spool.clone(),
            health.clone(),
            WriterSettings::from(config),
        );
        tracker.spawn(writer.run(shutdown.clone()));

        let maintenance = Maintenance::new(store.clone(), spool, health, config.clone());
        tracker.spawn(maintenance.run(shutdown));

        Self { queue, store }
    }

    pub fn health(&self) -> HealthSnapshot {
        self.queue.health()
    }
}
