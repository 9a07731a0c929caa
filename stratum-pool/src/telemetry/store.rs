//! Storage backends for telemetry rows.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::rows::{compute_rollups, BlockRow, ShareQuery, ShareRollup, ShareRow, TelemetryRow, WorkerEvent};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("spool I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("row encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Oldest timestamp kept per table, unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionCutoffs {
    pub shares: i64,
    pub blocks: i64,
    pub events: i64,
    pub rollups: i64,
}

/// Rows deleted by one retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeCounts {
    pub shares: u64,
    pub blocks: u64,
    pub events: u64,
    pub rollups: u64,
}

/// Durable destination of the telemetry writer.
///
/// `insert_batch` is all-or-nothing: on error none of the rows are stored.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    async fn insert_batch(&self, rows: &[TelemetryRow]) -> Result<(), StoreError>;

    async fn purge(&self, cutoffs: RetentionCutoffs) -> Result<PurgeCounts, StoreError>;

    /// Replace every rollup with `minute >= since` by a fresh aggregate of
    /// the shares table. Returns the number of rollup rows written.
    async fn rebuild_rollups(&self, since: i64) -> Result<usize, StoreError>;

    /// Newest first.
    async fn recent_shares(&self, query: &ShareQuery) -> Result<Vec<ShareRow>, StoreError>;

    /// Newest first.
    async fn recent_blocks(&self, limit: usize) -> Result<Vec<BlockRow>, StoreError>;

    /// Newest first.
    async fn recent_events(&self, limit: usize) -> Result<Vec<WorkerEvent>, StoreError>;

    /// Oldest first.
    async fn rollups_since(&self, since: i64) -> Result<Vec<ShareRollup>, StoreError>;
}

#[derive(Default)]
struct Tables {
    shares: Vec<ShareRow>,
    blocks: Vec<BlockRow>,
    events: Vec<WorkerEvent>,
    rollups: Vec<ShareRollup>,
}

/// Volatile store used when no database is configured.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest<T: Clone>(rows: &[T], limit: usize, keep: impl Fn(&T) -> bool) -> Vec<T> {
    rows.iter().rev().filter(|r| keep(r)).take(limit).cloned().collect()
}

fn retain_counted<T>(rows: &mut Vec<T>, keep: impl Fn(&T) -> bool) -> u64 {
    let before = rows.len();
    rows.retain(keep);
    (before - rows.len()) as u64
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn insert_batch(&self, rows: &[TelemetryRow]) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        for row in rows {
            match row {
                TelemetryRow::Share(s) => tables.shares.push(s.clone()),
                TelemetryRow::Block(b) => tables.blocks.push(b.clone()),
                TelemetryRow::Event(e) => tables.events.push(e.clone()),
            }
        }
        Ok(())
    }

    async fn purge(&self, cutoffs: RetentionCutoffs) -> Result<PurgeCounts, StoreError> {
        let mut tables = self.tables.lock();
        Ok(PurgeCounts {
            shares: retain_counted(&mut tables.shares, |r| r.ts >= cutoffs.shares),
            blocks: retain_counted(&mut tables.blocks, |r| r.ts >= cutoffs.blocks),
            events: retain_counted(&mut tables.events, |r| r.ts >= cutoffs.events),
            rollups: retain_counted(&mut tables.rollups, |r| r.minute >= cutoffs.rollups),
        })
    }

    async fn rebuild_rollups(&self, since: i64) -> Result<usize, StoreError> {
        let mut tables = self.tables.lock();
        let fresh = compute_rollups(&tables.shares, since);
        let written = fresh.len();
        tables.rollups.retain(|r| r.minute < since);
        tables.rollups.extend(fresh);
        Ok(written)
    }

    async fn recent_shares(&self, query: &ShareQuery) -> Result<Vec<ShareRow>, StoreError> {
        let tables = self.tables.lock();
        Ok(newest(&tables.shares, query.limit, |r| query.matches(r)))
    }

    async fn recent_blocks(&self, limit: usize) -> Result<Vec<BlockRow>, StoreError> {
        Ok(newest(&self.tables.lock().blocks, limit, |_| true))
    }

    async fn recent_events(&self, limit: usize) -> Result<Vec<WorkerEvent>, StoreError> {
        Ok(newest(&self.tables.lock().events, limit, |_| true))
    }

    async fn rollups_since(&self, since: i64) -> Result<Vec<ShareRollup>, StoreError> {
        let tables = self.tables.lock();
        let mut rollups: Vec<_> = tables
            .rollups
            .iter()
            .filter(|r| r.minute >= since)
            .cloned()
            .collect();
        rollups.sort_by(|a, b| {
            (a.minute, &a.coin, &a.worker).cmp(&(b.minute, &b.coin, &b.worker))
        });
        Ok(rollups)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    /// Memory store that can be switched into failing every write.
    #[derive(Default)]
    pub(crate) struct FlakyStore {
        pub(crate) inner: MemoryStore,
        pub(crate) failing: AtomicBool,
        pub(crate) attempts: AtomicUsize,
    }

    impl FlakyStore {
        pub(crate) fn failing() -> Self {
            let store = Self::default();
            store.failing.store(true, Ordering::SeqCst);
            store
        }

        pub(crate) fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub(crate) fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        pub(crate) async fn all_shares(&self) -> Vec<ShareRow> {
            let mut shares = self
                .inner
                .recent_shares(&ShareQuery {
                    limit: usize::MAX,
                    ..Default::default()
                })
                .await
                .unwrap();
            shares.reverse();
            shares
        }
    }

    #[async_trait]
    impl TelemetryStore for FlakyStore {
        async fn insert_batch(&self, rows: &[TelemetryRow]) -> Result<(), StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("database is locked".into()));
            }
            self.inner.insert_batch(rows).await
        }

        async fn purge(&self, cutoffs: RetentionCutoffs) -> Result<PurgeCounts, StoreError> {
            self.inner.purge(cutoffs).await
        }

        async fn rebuild_rollups(&self, since: i64) -> Result<usize, StoreError> {
            self.inner.rebuild_rollups(since).await
        }

        async fn recent_shares(&self, query: &ShareQuery) -> Result<Vec<ShareRow>, StoreError> {
            self.inner.recent_shares(query).await
        }

        async fn recent_blocks(&self, limit: usize) -> Result<Vec<BlockRow>, StoreError> {
            self.inner.recent_blocks(limit).await
        }

        async fn recent_events(&self, limit: usize) -> Result<Vec<WorkerEvent>, StoreError> {
            self.inner.recent_events(limit).await
        }

        async fn rollups_since(&self, since: i64) -> Result<Vec<ShareRollup>, StoreError> {
            self.inner.rollups_since(since).await
        }
    }
}
