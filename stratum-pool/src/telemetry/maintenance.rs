//! Periodic upkeep: spool replay, rollups and retention.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::QueueHealth;
use super::rows::minute_of;
use super::spool::Spool;
use super::store::{PurgeCounts, RetentionCutoffs, TelemetryStore};
use super::unix_now;
use crate::config::TelemetryConfig;

const DAY: i64 = 24 * 60 * 60;

/// What one maintenance cycle did. Each step runs even if an earlier one
/// failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub replayed: usize,
    pub corrupt: usize,
    pub rollups: usize,
    pub purged: PurgeCounts,
    pub errors: Vec<String>,
}

pub struct Maintenance {
    store: Arc<dyn TelemetryStore>,
    spool: Arc<Spool>,
    health: Arc<QueueHealth>,
    config: TelemetryConfig,
}

impl Maintenance {
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        spool: Arc<Spool>,
        health: Arc<QueueHealth>,
        config: TelemetryConfig,
    ) -> Self {
        Self {
            store,
            spool,
            health,
            config,
        }
    }

    pub fn cutoffs(&self, now: i64) -> RetentionCutoffs {
        let days = |d: u64| now - i64::try_from(d).unwrap_or(i64::MAX / DAY) * DAY;
        let retention = &self.config.retention;
        RetentionCutoffs {
            shares: days(retention.shares),
            blocks: days(retention.blocks),
            events: days(retention.events),
            rollups: days(retention.rollups),
        }
    }

    pub async fn run_cycle(&self, now: i64) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        match self
            .spool
            .replay(self.store.as_ref(), self.config.replay_batch.max(1))
            .await
        {
            Ok(outcome) => {
                report.replayed = outcome.replayed;
                report.corrupt = outcome.corrupt;
                QueueHealth::add(&self.health.replayed_rows, outcome.replayed);
                QueueHealth::add(&self.health.corrupt_spool_lines, outcome.corrupt);
                // Rows spooled by the writer meanwhile stay counted
                QueueHealth::sub(
                    &self.health.spool_backlog,
                    outcome.replayed + outcome.corrupt,
                );
                if outcome.replayed > 0 {
                    info!(
                        replayed = outcome.replayed,
                        remaining = outcome.remaining,
                        "Replayed spooled telemetry"
                    );
                }
            }
            Err(e) => {
                warn!(error = %e, "Spool replay failed");
                self.health.record_error(&e);
                report.errors.push(format!("replay: {}", e));
            }
        }

        let since = minute_of(now - self.config.rollup_lookback().as_secs() as i64);
        match self.store.rebuild_rollups(since).await {
            Ok(n) => report.rollups = n,
            Err(e) => {
                warn!(error = %e, "Rollup rebuild failed");
                report.errors.push(format!("rollups: {}", e));
            }
        }

        match self.store.purge(self.cutoffs(now)).await {
            Ok(purged) => {
                if purged != PurgeCounts::default() {
                    debug!(?purged, "Retention purge");
                }
                report.purged = purged;
            }
            Err(e) => {
                warn!(error = %e, "Retention purge failed");
                report.errors.push(format!("retention: {}", e));
            }
        }

        report
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.maintenance_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle(unix_now()).await;
                }
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("Telemetry maintenance stopped");
    }
}
