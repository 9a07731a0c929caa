//! API client library.
//!
//! Provides a Rust client for the pool's HTTP API, used by the CLI.

pub mod types;

use anyhow::{Context, Result};
use reqwest::{Client as HttpClient, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::CoinConfig;
use crate::registry::ReloadReport;
use crate::share::ShareTrace;
use crate::stats::CoinRuntimeStats;
use crate::telemetry::{BlockRow, HealthSnapshot, ShareRollup, ShareRow, WorkerEvent};
use types::{CoinDetail, ErrorResponse, HealthResponse};

/// Default API base URL.
const DEFAULT_BASE_URL: &str = "http://127.0.0.1:7786";

/// Optional filters for [`Client::shares`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct SharesFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

/// HTTP client for the pool API.
pub struct Client {
    http: HttpClient,
    base_url: String,
}

impl Client {
    /// Create a client connecting to the default local address.
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL.to_string())
    }

    /// Create a client connecting to a specific base URL.
    pub fn with_base_url(base_url: String) -> Self {
        Self {
            http: HttpClient::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    async fn send<T: DeserializeOwned>(request: RequestBuilder) -> Result<T> {
        let response = request
            .send()
            .await
            .context("failed to connect to pool API")?;
        let status = response.status();
        if !status.is_success() {
            let detail = response
                .json::<ErrorResponse>()
                .await
                .map(|body| body.error)
                .unwrap_or_default();
            anyhow::bail!("API request failed: {} {}", status, detail);
        }
        response
            .json()
            .await
            .context("failed to parse API response")
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        Self::send(self.http.get(self.url(endpoint))).await
    }

    /// Raw GET returning the body text.
    pub async fn get_raw(&self, endpoint: &str) -> Result<String> {
        let response = self
            .http
            .get(self.url(endpoint))
            .send()
            .await
            .context("failed to connect to pool API")?;
        let status = response.status();
        let body = response.text().await.context("failed to read response body")?;
        if !status.is_success() {
            anyhow::bail!("API request failed: {} {}", status, body);
        }
        Ok(body)
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        self.get("health").await
    }

    pub async fn coins(&self) -> Result<Vec<CoinRuntimeStats>> {
        self.get("coins").await
    }

    pub async fn coin(&self, code: &str) -> Result<CoinDetail> {
        self.get(&format!("coins/{}", code)).await
    }

    pub async fn telemetry(&self) -> Result<HealthSnapshot> {
        self.get("telemetry").await
    }

    pub async fn shares(&self, filter: &SharesFilter) -> Result<Vec<ShareRow>> {
        Self::send(self.http.get(self.url("shares")).query(filter)).await
    }

    pub async fn blocks(&self, limit: Option<usize>) -> Result<Vec<BlockRow>> {
        Self::send(self.http.get(self.url("blocks")).query(&[("limit", limit)])).await
    }

    pub async fn events(&self, limit: Option<usize>) -> Result<Vec<WorkerEvent>> {
        Self::send(self.http.get(self.url("events")).query(&[("limit", limit)])).await
    }

    pub async fn rollups(&self, since: Option<i64>) -> Result<Vec<ShareRollup>> {
        Self::send(self.http.get(self.url("rollups")).query(&[("since", since)])).await
    }

    pub async fn traces(&self, worker: Option<&str>, limit: Option<usize>) -> Result<Vec<ShareTrace>> {
        let request = self
            .http
            .get(self.url("traces"))
            .query(&[("worker", worker)])
            .query(&[("limit", limit)]);
        Self::send(request).await
    }

    /// Replace the served coin set.
    pub async fn reload(&self, coins: &[CoinConfig]) -> Result<ReloadReport> {
        Self::send(self.http.post(self.url("coins/reload")).json(coins)).await
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}
