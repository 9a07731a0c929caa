//! Stratum jobs: construction from node templates and per-coin history.
//!
//! A job is immutable once built. Replacing the active job means installing a
//! new `Arc<ActiveJob>` in the coin's [`JobBook`]; sessions holding the old
//! one keep a consistent view until they drop it.

pub mod builder;
pub mod merkle;
pub mod poller;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use ruint::aliases::U256;
use serde_json::{json, Value};
use thiserror::Error;

pub use builder::{assemble_block, build_job, template_signature, JobParams};

/// Template could not be turned into a job.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("field {0} is not valid hex")]
    InvalidHex(&'static str),

    #[error("field {0} has the wrong length")]
    InvalidLength(&'static str),

    #[error("template transaction {0} has neither txid nor hash")]
    MissingTxid(usize),

    #[error("coinbase tag is {0} bytes, too long")]
    TagTooLong(usize),

    #[error("coinbase scriptSig would be {0} bytes, over the 100 byte limit")]
    ScriptSigTooLong(usize),

    #[error("height {0} does not fit a script number")]
    InvalidHeight(u64),
}

/// The unit of work broadcast to miners.
#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub job_id: String,

    /// Previous block hash, internal byte order
    pub prev_hash: [u8; 32],

    /// Previous block hash as the node displays it
    pub prev_hash_display: String,

    /// Previous block hash as `mining.notify` carries it
    pub prev_hash_notify: String,

    pub coinb1: Vec<u8>,
    pub coinb2: Vec<u8>,
    pub merkle_branch: Vec<[u8; 32]>,
    pub version: u32,
    pub nbits: u32,
    pub ntime: u32,
    pub clean_jobs: bool,
    pub height: u64,

    /// Reference target for difficulty 1
    pub diff1: U256,

    /// Decoded from `nbits`
    pub network_target: U256,

    /// Raw non-coinbase transactions for block assembly
    pub transactions: Arc<Vec<Vec<u8>>>,

    /// Coinbase carries a witness commitment
    pub segwit: bool,

    /// Merkle root with zeroed extranonces, for logs
    pub placeholder_merkle_root: [u8; 32],

    pub signature: String,
    pub extranonce2_size: usize,
}

impl ActiveJob {
    /// Parameters of `mining.notify`.
    pub fn notify_params(&self, clean_jobs: bool) -> Value {
        let branch: Vec<String> = self.merkle_branch.iter().map(hex::encode).collect();
        json!([
            self.job_id,
            self.prev_hash_notify,
            hex::encode(&self.coinb1),
            hex::encode(&self.coinb2),
            branch,
            format!("{:08x}", self.version),
            format!("{:08x}", self.nbits),
            format!("{:08x}", self.ntime),
            clean_jobs,
        ])
    }
}

/// Identity of a submission for duplicate detection within one job.
///
/// Extranonce1 is part of the key so that two sessions landing on the same
/// extranonce2/ntime/nonce are not mistaken for each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShareKey {
    pub extranonce1: Vec<u8>,
    pub extranonce2: Vec<u8>,
    pub ntime: u32,
    pub nonce: u32,
    pub version_bits: Option<u32>,
}

struct JobEntry {
    job: Arc<ActiveJob>,
    seen: HashSet<ShareKey>,
}

/// Result of recording a share key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    New,
    Duplicate,
    UnknownJob,
}

/// The current job plus the few it replaced, each with its own duplicate
/// set.
pub struct JobBook {
    capacity: usize,
    entries: VecDeque<JobEntry>,
}

impl JobBook {
    /// `stale_job_count` superseded jobs are kept next to the current one.
    pub fn new(stale_job_count: usize) -> Self {
        Self {
            capacity: stale_job_count + 1,
            entries: VecDeque::new(),
        }
    }

    /// Make `job` current with an empty duplicate set, evicting the oldest
    /// job beyond capacity.
    pub fn install(&mut self, job: Arc<ActiveJob>) {
        self.entries.push_back(JobEntry {
            job,
            seen: HashSet::new(),
        });
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn current(&self) -> Option<Arc<ActiveJob>> {
        self.entries.back().map(|e| e.job.clone())
    }

    pub fn get(&self, job_id: &str) -> Option<Arc<ActiveJob>> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.job.job_id == job_id)
            .map(|e| e.job.clone())
    }

    /// Check-and-insert in one step so concurrent sessions cannot both see
    /// a key as new.
    pub fn record(&mut self, job_id: &str, key: ShareKey) -> Recorded {
        match self.entries.iter_mut().find(|e| e.job.job_id == job_id) {
            None => Recorded::UnknownJob,
            Some(entry) => {
                if entry.seen.insert(key) {
                    Recorded::New
                } else {
                    Recorded::Duplicate
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
