//! Share verification.
//!
//! Submissions go through structural checks ([`submission`]), header
//! assembly ([`header`]) and target comparison ([`engine`]). Every outcome is
//! captured as a [`trace::ShareTrace`]. Rejections are ordinary values here,
//! never errors.

pub mod engine;
pub mod header;
pub mod submission;
pub mod trace;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

pub use engine::{evaluate, Evaluation};
pub use header::HeaderVariant;
pub use submission::{ParsedShare, Submission};
pub use trace::{ShareTrace, TraceLog};

/// Why a share was not accepted.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    AsRefStr,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RejectReason {
    NotSubscribed,
    Unauthorized,
    NoActiveJob,
    StaleJob,
    DuplicateShare,
    LowDifficultyShare,
    InvalidNtime,
    InvalidNonce,
    InvalidVersion,
    BadExtranonce2Size,
    ShareEvalFailed,
}

impl RejectReason {
    /// Stratum error code sent back to the miner.
    pub fn error_code(&self) -> i64 {
        match self {
            RejectReason::StaleJob | RejectReason::NoActiveJob => 21,
            RejectReason::DuplicateShare => 22,
            RejectReason::LowDifficultyShare => 23,
            RejectReason::Unauthorized => 24,
            RejectReason::NotSubscribed => 25,
            _ => 20,
        }
    }
}

/// Final decision on a share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum Verdict {
    Accept {
        /// Also met the network target
        block_candidate: bool,
    },
    Reject(RejectReason),
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept { .. })
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Verdict::Reject(reason) => Some(*reason),
            Verdict::Accept { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(RejectReason::StaleJob, "stale_job", 21)]
    #[test_case(RejectReason::NoActiveJob, "no_active_job", 21)]
    #[test_case(RejectReason::DuplicateShare, "duplicate_share", 22)]
    #[test_case(RejectReason::LowDifficultyShare, "low_difficulty_share", 23)]
    #[test_case(RejectReason::Unauthorized, "unauthorized", 24)]
    #[test_case(RejectReason::NotSubscribed, "not_subscribed", 25)]
    #[test_case(RejectReason::BadExtranonce2Size, "bad_extranonce2_size", 20)]
    #[test_case(RejectReason::ShareEvalFailed, "share_eval_failed", 20)]
    fn test_reason_names_and_codes(reason: RejectReason, name: &str, code: i64) {
        assert_eq!(reason.to_string(), name);
        assert_eq!(reason.error_code(), code);
        assert_eq!(serde_json::to_value(reason).unwrap(), name);
    }
}
