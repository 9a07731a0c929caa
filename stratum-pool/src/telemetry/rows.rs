//! Row types recorded by the telemetry pipeline.
//!
//! Rows are serialized with a `kind` tag so a spool line can be decoded
//! without knowing what was written.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::share::RejectReason;

/// Outcome of one share verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareRow {
    /// Unix seconds
    pub ts: i64,
    pub coin: String,
    pub worker: String,
    pub session_id: u64,
    pub job_id: String,
    pub correlation_id: String,
    pub accepted: bool,
    /// Reject reason name
    pub reason: Option<String>,
    pub assigned_difficulty: f64,
    pub share_difficulty: Option<f64>,
    pub block_candidate: bool,
    /// Header variant that matched
    pub variant: Option<String>,
}

/// One `submitblock` attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRow {
    pub ts: i64,
    pub coin: String,
    pub worker: String,
    pub job_id: String,
    pub height: u64,
    /// Display byte order
    pub block_hash: String,
    pub correlation_id: String,
    pub accepted: bool,
    /// Node rejection string or RPC failure
    pub error: Option<String>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WorkerEventKind {
    Connected,
    Authorized,
    DifficultyChanged,
    Disconnected,
}

/// Worker lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerEvent {
    pub ts: i64,
    pub coin: String,
    pub session_id: u64,
    pub worker: Option<String>,
    pub event: WorkerEventKind,
    pub detail: Option<String>,
}

/// Anything the queue carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryRow {
    Share(ShareRow),
    Block(BlockRow),
    Event(WorkerEvent),
}

/// Per coin, worker and minute share aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareRollup {
    /// Unix seconds at the start of the minute
    pub minute: i64,
    pub coin: String,
    pub worker: String,
    pub accepted: u64,
    pub rejected: u64,
    pub low_difficulty: u64,
    pub duplicate: u64,
    pub mean_assigned_difficulty: f64,
    /// Mean over accepted shares only
    pub mean_share_difficulty: Option<f64>,
}

/// Filter for recent-share queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareQuery {
    pub limit: usize,
    pub coin: Option<String>,
    pub worker: Option<String>,
}

impl ShareQuery {
    pub fn matches(&self, row: &ShareRow) -> bool {
        self.coin.as_ref().map_or(true, |c| *c == row.coin)
            && self.worker.as_ref().map_or(true, |w| *w == row.worker)
    }
}

pub fn minute_of(ts: i64) -> i64 {
    ts.div_euclid(60) * 60
}

/// Aggregate shares with `ts >= since` into one-minute rollups.
pub fn compute_rollups<'a>(shares: impl IntoIterator<Item = &'a ShareRow>, since: i64) -> Vec<ShareRollup> {
    #[derive(Default)]
    struct Acc {
        accepted: u64,
        rejected: u64,
        low_difficulty: u64,
        duplicate: u64,
        assigned_sum: f64,
        share_sum: f64,
        share_count: u64,
    }

    let low = RejectReason::LowDifficultyShare.as_ref();
    let dup = RejectReason::DuplicateShare.as_ref();

    let mut groups: BTreeMap<(i64, String, String), Acc> = BTreeMap::new();
    for share in shares.into_iter().filter(|s| s.ts >= since) {
        let acc = groups
            .entry((minute_of(share.ts), share.coin.clone(), share.worker.clone()))
            .or_default();
        acc.assigned_sum += share.assigned_difficulty;
        if share.accepted {
            acc.accepted += 1;
            if let Some(d) = share.share_difficulty {
                acc.share_sum += d;
                acc.share_count += 1;
            }
        } else {
            acc.rejected += 1;
            match share.reason.as_deref() {
                Some(r) if r == low => acc.low_difficulty += 1,
                Some(r) if r == dup => acc.duplicate += 1,
                _ => {}
            }
        }
    }

    groups
        .into_iter()
        .map(|((minute, coin, worker), acc)| {
            let total = acc.accepted + acc.rejected;
            ShareRollup {
                minute,
                coin,
                worker,
                accepted: acc.accepted,
                rejected: acc.rejected,
                low_difficulty: acc.low_difficulty,
                duplicate: acc.duplicate,
                mean_assigned_difficulty: acc.assigned_sum / total as f64,
                mean_share_difficulty: (acc.share_count > 0)
                    .then(|| acc.share_sum / acc.share_count as f64),
            }
        })
        .collect()
}
