//! API version 1 endpoints.
//!
//! Everything except `POST /coins/reload` is a read-only projection of
//! coin stats, telemetry health, the telemetry store and the in-memory
//! share traces.

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;

use crate::api_client::types::{CoinDetail, ErrorResponse, HealthResponse, JobSummary};
use crate::config::CoinConfig;
use crate::error::Error;
use crate::registry::{CoinRegistry, ReloadReport};
use crate::share::ShareTrace;
use crate::stats::CoinRuntimeStats;
use crate::telemetry::{
    BlockRow, HealthSnapshot, ShareQuery, ShareRollup, ShareRow, Telemetry, WorkerEvent,
};
use crate::tracing::prelude::*;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

/// Shared application state for API endpoints.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<CoinRegistry>,
    pub telemetry: Telemetry,
}

/// Handler error rendered as `{"error": ...}`.
#[derive(Debug)]
pub struct ApiError(StatusCode, String);

impl ApiError {
    fn not_found(what: impl Into<String>) -> Self {
        Self(StatusCode::NOT_FOUND, what.into())
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = match e {
            Error::Config(_) | Error::UnknownCoin(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self(status, e.to_string())
    }
}

impl From<crate::telemetry::StoreError> for ApiError {
    fn from(e: crate::telemetry::StoreError) -> Self {
        Self(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorResponse { error: self.1 })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ShareParams {
    pub limit: Option<usize>,
    pub coin: Option<String>,
    pub worker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RollupParams {
    /// Unix seconds; defaults to the last hour
    pub since: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TraceParams {
    pub worker: Option<String>,
    pub coin: Option<String>,
    pub limit: Option<usize>,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let telemetry = state.telemetry.health();
    Json(HealthResponse {
        status: if telemetry.degraded { "degraded" } else { "ok" }.to_string(),
        coins: state.registry.coins().len(),
        telemetry_degraded: telemetry.degraded,
    })
}

async fn list_coins(State(state): State<AppState>) -> Json<Vec<CoinRuntimeStats>> {
    Json(state.registry.stats())
}

async fn get_coin(State(state): State<AppState>, Path(code): Path<String>) -> ApiResult<CoinDetail> {
    let ctx = state
        .registry
        .coin(&code)
        .ok_or_else(|| ApiError::not_found(format!("unknown coin {}", code)))?;
    let current_job = ctx.current_job().map(|job| JobSummary {
        job_id: job.job_id.clone(),
        height: job.height,
        prev_hash: job.prev_hash_display.clone(),
        version: format!("{:08x}", job.version),
        nbits: format!("{:08x}", job.nbits),
        ntime: job.ntime,
        transactions: job.transactions.len(),
        clean_jobs: job.clean_jobs,
    });
    Ok(Json(CoinDetail {
        stats: ctx.stats_snapshot(),
        stratum_addr: state.registry.local_addr(&code).map(|a| a.to_string()),
        baseline_difficulty: ctx.baseline_difficulty(),
        current_job,
    }))
}

/// Replace the coin set. Body: JSON array of coin configurations.
///
/// ```bash
/// curl -X POST http://127.0.0.1:7786/api/v1/coins/reload \
///    -H "Content-Type: application/json" -d @coins.json
/// ```
async fn reload_coins(
    State(state): State<AppState>,
    Json(coins): Json<Vec<CoinConfig>>,
) -> ApiResult<ReloadReport> {
    info!(coins = coins.len(), "Coin reload requested over API");
    let report = state.registry.reload(coins).await.map_err(|e| {
        warn!(error = %e, "Coin reload rejected");
        ApiError::from(e)
    })?;
    Ok(Json(report))
}

async fn telemetry_health(State(state): State<AppState>) -> Json<HealthSnapshot> {
    Json(state.telemetry.health())
}

async fn recent_shares(
    State(state): State<AppState>,
    Query(params): Query<ShareParams>,
) -> ApiResult<Vec<ShareRow>> {
    let query = ShareQuery {
        limit: clamp_limit(params.limit),
        coin: params.coin,
        worker: params.worker,
    };
    Ok(Json(state.telemetry.store.recent_shares(&query).await?))
}

async fn recent_blocks(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Vec<BlockRow>> {
    let limit = clamp_limit(params.limit);
    Ok(Json(state.telemetry.store.recent_blocks(limit).await?))
}

async fn recent_events(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Vec<WorkerEvent>> {
    let limit = clamp_limit(params.limit);
    Ok(Json(state.telemetry.store.recent_events(limit).await?))
}

async fn rollups(
    State(state): State<AppState>,
    Query(params): Query<RollupParams>,
) -> ApiResult<Vec<ShareRollup>> {
    let since = params
        .since
        .unwrap_or_else(|| crate::telemetry::unix_now() - 3600);
    Ok(Json(state.telemetry.store.rollups_since(since).await?))
}

/// Most recent first, across coins unless `coin` is given.
async fn traces(
    State(state): State<AppState>,
    Query(params): Query<TraceParams>,
) -> Json<Vec<ShareTrace>> {
    let limit = clamp_limit(params.limit);
    let mut traces: Vec<ShareTrace> = state
        .registry
        .coins()
        .iter()
        .filter(|ctx| params.coin.as_ref().map_or(true, |c| *c == ctx.code))
        .flat_map(|ctx| match &params.worker {
            Some(worker) => ctx.traces.for_worker(worker, limit),
            None => ctx.traces.recent(limit),
        })
        .collect();
    traces.sort_by(|a, b| b.received_at.cmp(&a.received_at));
    traces.truncate(limit);
    Json(traces)
}

/// Build the v1 API routes.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/coins", get(list_coins))
        .route("/coins/reload", post(reload_coins))
        .route("/coins/:code", get(get_coin))
        .route("/telemetry", get(telemetry_health))
        .route("/shares", get(recent_shares))
        .route("/blocks", get(recent_blocks))
        .route("/events", get(recent_events))
        .route("/rollups", get(rollups))
        .route("/traces", get(traces))
        .with_state(state)
}
