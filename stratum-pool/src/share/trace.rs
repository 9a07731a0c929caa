//! Forensic records of share submissions.
//!
//! Kept in memory only: one ring for the whole coin and one per worker.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{HeaderVariant, RejectReason, Submission, Verdict};

/// Everything known about one submission and how it was judged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareTrace {
    pub correlation_id: String,
    pub coin: String,
    pub session_id: u64,
    /// Unix milliseconds
    pub received_at: i64,

    pub submission: Submission,
    pub extranonce1: String,

    pub assigned_difficulty: f64,
    pub share_target: Option<String>,
    pub network_target: Option<String>,

    /// Version after mask resolution
    pub version: Option<u32>,
    pub header: Option<String>,
    /// Display byte order
    pub hash: Option<String>,
    pub matched_variant: Option<HeaderVariant>,
    pub ambiguous: bool,
    pub share_difficulty: Option<f64>,

    pub verdict: Verdict,
}

impl ShareTrace {
    pub fn reject_reason(&self) -> Option<RejectReason> {
        self.verdict.reject_reason()
    }
}

/// Most workers tracked at once; the least recently active is dropped.
const MAX_WORKER_RINGS: usize = 4096;

/// Bounded global and per-worker rings of traces.
pub struct TraceLog {
    capacity: usize,
    worker_capacity: usize,
    inner: Mutex<TraceRings>,
}

#[derive(Default)]
struct TraceRings {
    global: VecDeque<ShareTrace>,
    workers: HashMap<String, VecDeque<ShareTrace>>,
}

impl TraceLog {
    pub fn new(capacity: usize, worker_capacity: usize) -> Self {
        Self {
            capacity,
            worker_capacity,
            inner: Mutex::new(TraceRings::default()),
        }
    }

    pub fn record(&self, trace: ShareTrace) {
        let mut rings = self.inner.lock();
        if self.worker_capacity > 0 {
            if rings.workers.len() >= MAX_WORKER_RINGS
                && !rings.workers.contains_key(&trace.submission.worker)
            {
                rings.evict_idlest_worker();
            }
            let ring = rings
                .workers
                .entry(trace.submission.worker.clone())
                .or_default();
            if ring.len() == self.worker_capacity {
                ring.pop_front();
            }
            ring.push_back(trace.clone());
        }
        if self.capacity > 0 {
            if rings.global.len() == self.capacity {
                rings.global.pop_front();
            }
            rings.global.push_back(trace);
        }
    }

    /// Most recent first.
    pub fn recent(&self, limit: usize) -> Vec<ShareTrace> {
        let rings = self.inner.lock();
        rings.global.iter().rev().take(limit).cloned().collect()
    }

    /// Most recent first.
    pub fn for_worker(&self, worker: &str, limit: usize) -> Vec<ShareTrace> {
        let rings = self.inner.lock();
        rings
            .workers
            .get(worker)
            .map(|ring| ring.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }
}

impl TraceRings {
    fn evict_idlest_worker(&mut self) {
        let idlest = self
            .workers
            .iter()
            .min_by_key(|(_, ring)| ring.back().map_or(i64::MIN, |t| t.received_at))
            .map(|(worker, _)| worker.clone());
        if let Some(worker) = idlest {
            self.workers.remove(&worker);
        }
    }
}
