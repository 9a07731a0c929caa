//! API data transfer objects.
//!
//! These types define the API contract shared between the server and
//! clients. Rows, stats and traces are served in their own shapes; only the
//! views assembled by the API live here.

use serde::{Deserialize, Serialize};

use crate::stats::CoinRuntimeStats;

/// `GET /health`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" while telemetry is failing or backlogged
    pub status: String,
    pub coins: usize,
    pub telemetry_degraded: bool,
}

/// The job a coin is currently serving.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub height: u64,
    /// Display byte order
    pub prev_hash: String,
    pub version: String,
    pub nbits: String,
    pub ntime: u32,
    pub transactions: usize,
    pub clean_jobs: bool,
}

/// `GET /coins/:code`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct CoinDetail {
    pub stats: CoinRuntimeStats,
    pub stratum_addr: Option<String>,
    pub baseline_difficulty: f64,
    pub current_job: Option<JobSummary>,
}

/// Error body of any non-2xx response.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
