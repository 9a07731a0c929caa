//! Supported coin families and hashing algorithms.
//!
//! Every coin served by the pool belongs to a closed set of families. The
//! family decides the diff1 reference target and how `getblocktemplate` is
//! called. Profiles are resolved once when a coin service starts.

use ruint::aliases::U256;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use strum::{AsRefStr, Display, EnumString};

/// Proof-of-work hashing algorithm.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, AsRefStr,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Algorithm {
    /// Double SHA-256 over the 80-byte header
    #[default]
    Sha256d,
}

/// Chain family a coin belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, AsRefStr,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CoinFamily {
    /// Bitcoin and its direct forks
    #[default]
    Bitcoin,

    /// DigiByte, whose multi-algorithm node wants the algorithm named in
    /// `getblocktemplate`
    DigiByte,
}

/// Difficulty-1 target for SHA-256d chains: `0xffff << 208`.
pub const SHA256D_DIFF1: U256 = U256::from_limbs([0, 0, 0, 0x0000_0000_ffff_0000]);

/// Family-specific constants resolved at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoinProfile {
    pub family: CoinFamily,
    pub algorithm: Algorithm,
    pub diff1: U256,
}

impl CoinProfile {
    /// Build the dispatch entry for a family/algorithm pair.
    pub fn resolve(family: CoinFamily, algorithm: Algorithm) -> Self {
        let diff1 = match algorithm {
            Algorithm::Sha256d => SHA256D_DIFF1,
        };
        Self {
            family,
            algorithm,
            diff1,
        }
    }

    /// Positional parameters for `getblocktemplate`.
    pub fn template_params(&self) -> Value {
        let request = json!({ "rules": ["segwit"] });
        match self.family {
            CoinFamily::Bitcoin => json!([request]),
            CoinFamily::DigiByte => json!([request, self.algorithm.as_ref()]),
        }
    }
}
