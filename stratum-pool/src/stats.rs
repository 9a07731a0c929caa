//! Per-coin runtime counters.
//!
//! Owned by the coin's tasks behind a mutex and handed to readers only as a
//! cloned snapshot, so reports never see a half-applied update.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::rpc::SubmitOutcome;
use crate::share::RejectReason;

/// Counters and last-known state for one coin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoinRuntimeStats {
    pub coin: String,
    pub stratum_port: u16,

    pub connections_current: u64,
    pub connections_total: u64,

    pub shares_submitted: u64,
    pub shares_accepted: u64,
    pub shares_rejected: u64,

    /// Rejections keyed by reason name
    pub reject_reasons: BTreeMap<String, u64>,

    /// Accepted only by a non-canonical header assembly
    pub shares_ambiguous: u64,

    pub current_job_id: Option<String>,
    pub chain_height: Option<u64>,
    pub template_height: Option<u64>,

    /// Unix seconds of the last successful node call
    pub last_rpc_success: Option<i64>,
    pub last_rpc_error: Option<String>,
    pub last_rpc_error_at: Option<i64>,

    pub block_candidates: u64,
    pub blocks_submitted: u64,
    pub blocks_accepted: u64,
    pub blocks_rejected: u64,

    pub best_share_difficulty: f64,
}

impl CoinRuntimeStats {
    pub fn new(coin: &str, stratum_port: u16) -> Self {
        Self {
            coin: coin.to_string(),
            stratum_port,
            ..Default::default()
        }
    }

    pub fn connection_opened(&mut self) {
        self.connections_current += 1;
        self.connections_total += 1;
    }

    pub fn connection_closed(&mut self) {
        self.connections_current = self.connections_current.saturating_sub(1);
    }

    pub fn share_accepted(&mut self, share_difficulty: f64, ambiguous: bool) {
        self.shares_submitted += 1;
        self.shares_accepted += 1;
        if ambiguous {
            self.shares_ambiguous += 1;
        }
        if share_difficulty.is_finite() && share_difficulty > self.best_share_difficulty {
            self.best_share_difficulty = share_difficulty;
        }
    }

    pub fn share_rejected(&mut self, reason: RejectReason) {
        self.shares_submitted += 1;
        self.shares_rejected += 1;
        *self
            .reject_reasons
            .entry(reason.as_ref().to_string())
            .or_default() += 1;
    }

    pub fn rpc_succeeded(&mut self, now: i64) {
        self.last_rpc_success = Some(now);
    }

    pub fn rpc_failed(&mut self, error: String, now: i64) {
        self.last_rpc_error = Some(error);
        self.last_rpc_error_at = Some(now);
    }

    /// Record a `submitblock` attempt; `None` means the call itself failed.
    pub fn block_submitted(&mut self, outcome: Option<&SubmitOutcome>) {
        self.blocks_submitted += 1;
        match outcome {
            Some(SubmitOutcome::Accepted) => self.blocks_accepted += 1,
            Some(SubmitOutcome::Rejected(_)) | None => self.blocks_rejected += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_histogram_uses_reason_names() {
        let mut stats = CoinRuntimeStats::new("BTC", 3333);
        stats.share_rejected(RejectReason::StaleJob);
        stats.share_rejected(RejectReason::StaleJob);
        stats.share_rejected(RejectReason::DuplicateShare);
        assert_eq!(stats.reject_reasons["stale_job"], 2);
        assert_eq!(stats.reject_reasons["duplicate_share"], 1);
        assert_eq!(stats.shares_submitted, 3);
        assert_eq!(stats.shares_rejected, 3);
    }

    #[test]
    fn test_best_share_difficulty_is_max() {
        let mut stats = CoinRuntimeStats::new("BTC", 3333);
        stats.share_accepted(12.0, false);
        stats.share_accepted(3.0, true);
        stats.share_accepted(f64::INFINITY, false);
        assert_eq!(stats.best_share_difficulty, 12.0);
        assert_eq!(stats.shares_ambiguous, 1);
    }

    #[test]
    fn test_connection_count_never_underflows() {
        let mut stats = CoinRuntimeStats::new("BTC", 3333);
        stats.connection_closed();
        assert_eq!(stats.connections_current, 0);
        stats.connection_opened();
        assert_eq!(stats.connections_total, 1);
    }
}
