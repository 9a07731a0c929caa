//! SQLite telemetry store.

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow};
use sqlx::{Row, SqlitePool};

use super::rows::{BlockRow, ShareQuery, ShareRollup, ShareRow, TelemetryRow, WorkerEvent};
use super::store::{PurgeCounts, RetentionCutoffs, StoreError, TelemetryStore};
use crate::share::RejectReason;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS shares (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts INTEGER NOT NULL,
        coin TEXT NOT NULL,
        worker TEXT NOT NULL,
        session_id INTEGER NOT NULL,
        job_id TEXT NOT NULL,
        correlation_id TEXT NOT NULL,
        accepted BOOLEAN NOT NULL,
        reason TEXT,
        assigned_difficulty REAL NOT NULL,
        share_difficulty REAL,
        block_candidate BOOLEAN NOT NULL,
        variant TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS blocks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts INTEGER NOT NULL,
        coin TEXT NOT NULL,
        worker TEXT NOT NULL,
        job_id TEXT NOT NULL,
        height INTEGER NOT NULL,
        block_hash TEXT NOT NULL,
        correlation_id TEXT NOT NULL,
        accepted BOOLEAN NOT NULL,
        error TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS worker_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts INTEGER NOT NULL,
        coin TEXT NOT NULL,
        session_id INTEGER NOT NULL,
        worker TEXT,
        event TEXT NOT NULL,
        detail TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS share_rollups (
        minute INTEGER NOT NULL,
        coin TEXT NOT NULL,
        worker TEXT NOT NULL,
        accepted INTEGER NOT NULL,
        rejected INTEGER NOT NULL,
        low_difficulty INTEGER NOT NULL,
        duplicate INTEGER NOT NULL,
        mean_assigned_difficulty REAL NOT NULL,
        mean_share_difficulty REAL,
        PRIMARY KEY (minute, coin, worker)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_shares_ts ON shares(ts)",
    "CREATE INDEX IF NOT EXISTS idx_shares_worker_ts ON shares(worker, ts)",
    "CREATE INDEX IF NOT EXISTS idx_blocks_ts ON blocks(ts)",
    "CREATE INDEX IF NOT EXISTS idx_worker_events_ts ON worker_events(ts)",
];

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(options).await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn share_from_row(row: &SqliteRow) -> Result<ShareRow, sqlx::Error> {
    Ok(ShareRow {
        ts: row.try_get("ts")?,
        coin: row.try_get("coin")?,
        worker: row.try_get("worker")?,
        session_id: row.try_get::<i64, _>("session_id")? as u64,
        job_id: row.try_get("job_id")?,
        correlation_id: row.try_get("correlation_id")?,
        accepted: row.try_get("accepted")?,
        reason: row.try_get("reason")?,
        assigned_difficulty: row.try_get("assigned_difficulty")?,
        share_difficulty: row.try_get("share_difficulty")?,
        block_candidate: row.try_get("block_candidate")?,
        variant: row.try_get("variant")?,
    })
}

fn block_from_row(row: &SqliteRow) -> Result<BlockRow, sqlx::Error> {
    Ok(BlockRow {
        ts: row.try_get("ts")?,
        coin: row.try_get("coin")?,
        worker: row.try_get("worker")?,
        job_id: row.try_get("job_id")?,
        height: row.try_get::<i64, _>("height")? as u64,
        block_hash: row.try_get("block_hash")?,
        correlation_id: row.try_get("correlation_id")?,
        accepted: row.try_get("accepted")?,
        error: row.try_get("error")?,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<WorkerEvent, StoreError> {
    let event: String = row.try_get("event")?;
    Ok(WorkerEvent {
        ts: row.try_get("ts")?,
        coin: row.try_get("coin")?,
        session_id: row.try_get::<i64, _>("session_id")? as u64,
        worker: row.try_get("worker")?,
        event: event
            .parse()
            .map_err(|_| StoreError::Database(format!("unknown worker event '{}'", event)))?,
        detail: row.try_get("detail")?,
    })
}

fn rollup_from_row(row: &SqliteRow) -> Result<ShareRollup, sqlx::Error> {
    Ok(ShareRollup {
        minute: row.try_get("minute")?,
        coin: row.try_get("coin")?,
        worker: row.try_get("worker")?,
        accepted: row.try_get::<i64, _>("accepted")? as u64,
        rejected: row.try_get::<i64, _>("rejected")? as u64,
        low_difficulty: row.try_get::<i64, _>("low_difficulty")? as u64,
        duplicate: row.try_get::<i64, _>("duplicate")? as u64,
        mean_assigned_difficulty: row.try_get("mean_assigned_difficulty")?,
        mean_share_difficulty: row.try_get("mean_share_difficulty")?,
    })
}

#[async_trait]
impl TelemetryStore for SqliteStore {
    async fn insert_batch(&self, rows: &[TelemetryRow]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            match row {
                TelemetryRow::Share(s) => {
                    sqlx::query(
                        "INSERT INTO shares (ts, coin, worker, session_id, job_id, correlation_id, \
                         accepted, reason, assigned_difficulty, share_difficulty, block_candidate, variant) \
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(s.ts)
                    .bind(&s.coin)
                    .bind(&s.worker)
                    .bind(s.session_id as i64)
                    .bind(&s.job_id)
                    .bind(&s.correlation_id)
                    .bind(s.accepted)
                    .bind(&s.reason)
                    .bind(s.assigned_difficulty)
                    .bind(s.share_difficulty)
                    .bind(s.block_candidate)
                    .bind(&s.variant)
                    .execute(&mut *tx)
                    .await?;
                }
                TelemetryRow::Block(b) => {
                    sqlx::query(
                        "INSERT INTO blocks (ts, coin, worker, job_id, height, block_hash, \
                         correlation_id, accepted, error) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(b.ts)
                    .bind(&b.coin)
                    .bind(&b.worker)
                    .bind(&b.job_id)
                    .bind(b.height as i64)
                    .bind(&b.block_hash)
                    .bind(&b.correlation_id)
                    .bind(b.accepted)
                    .bind(&b.error)
                    .execute(&mut *tx)
                    .await?;
                }
                TelemetryRow::Event(e) => {
                    sqlx::query(
                        "INSERT INTO worker_events (ts, coin, session_id, worker, event, detail) \
                         VALUES (?, ?, ?, ?, ?, ?)",
                    )
                    .bind(e.ts)
                    .bind(&e.coin)
                    .bind(e.session_id as i64)
                    .bind(&e.worker)
                    .bind(e.event.as_ref())
                    .bind(&e.detail)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn purge(&self, cutoffs: RetentionCutoffs) -> Result<PurgeCounts, StoreError> {
        let mut tx = self.pool.begin().await?;
        let shares = sqlx::query("DELETE FROM shares WHERE ts < ?")
            .bind(cutoffs.shares)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let blocks = sqlx::query("DELETE FROM blocks WHERE ts < ?")
            .bind(cutoffs.blocks)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let events = sqlx::query("DELETE FROM worker_events WHERE ts < ?")
            .bind(cutoffs.events)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let rollups = sqlx::query("DELETE FROM share_rollups WHERE minute < ?")
            .bind(cutoffs.rollups)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(PurgeCounts {
            shares,
            blocks,
            events,
            rollups,
        })
    }

    async fn rebuild_rollups(&self, since: i64) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM share_rollups WHERE minute >= ?")
            .bind(since)
            .execute(&mut *tx)
            .await?;
        let written = sqlx::query(
            r#"
            INSERT INTO share_rollups (minute, coin, worker, accepted, rejected,
                low_difficulty, duplicate, mean_assigned_difficulty, mean_share_difficulty)
            SELECT (ts / 60) * 60, coin, worker,
                SUM(CASE WHEN accepted THEN 1 ELSE 0 END),
                SUM(CASE WHEN accepted THEN 0 ELSE 1 END),
                SUM(CASE WHEN reason = ?2 THEN 1 ELSE 0 END),
                SUM(CASE WHEN reason = ?3 THEN 1 ELSE 0 END),
                AVG(assigned_difficulty),
                AVG(CASE WHEN accepted THEN share_difficulty END)
            FROM shares
            WHERE ts >= ?1
            GROUP BY (ts / 60) * 60, coin, worker
            "#,
        )
        .bind(since)
        .bind(RejectReason::LowDifficultyShare.as_ref())
        .bind(RejectReason::DuplicateShare.as_ref())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(written as usize)
    }

    async fn recent_shares(&self, query: &ShareQuery) -> Result<Vec<ShareRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM shares \
             WHERE (?1 IS NULL OR coin = ?1) AND (?2 IS NULL OR worker = ?2) \
             ORDER BY id DESC LIMIT ?3",
        )
        .bind(&query.coin)
        .bind(&query.worker)
        .bind(sql_limit(query.limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(share_from_row).collect::<Result<_, _>>()?)
    }

    async fn recent_blocks(&self, limit: usize) -> Result<Vec<BlockRow>, StoreError> {
        let rows = sqlx::query("SELECT * FROM blocks ORDER BY id DESC LIMIT ?")
            .bind(sql_limit(limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(block_from_row).collect::<Result<_, _>>()?)
    }

    async fn recent_events(&self, limit: usize) -> Result<Vec<WorkerEvent>, StoreError> {
        let rows = sqlx::query("SELECT * FROM worker_events ORDER BY id DESC LIMIT ?")
            .bind(sql_limit(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn rollups_since(&self, since: i64) -> Result<Vec<ShareRollup>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM share_rollups WHERE minute >= ? ORDER BY minute, coin, worker",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(rollup_from_row).collect::<Result<_, _>>()?)
    }
}
