//! Node JSON-RPC client.
//!
//! The pool needs three calls from a full node: `getblockchaininfo`,
//! `getblocktemplate` and `submitblock`. [`NodeRpc`] abstracts them so the
//! template poller and block submission can run against a mock in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::coin::CoinProfile;
use crate::config::RpcConfig;
use crate::tracing::prelude::*;

/// Node RPC errors.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Connection refused, reset, DNS failure...
    #[error("transport error: {0}")]
    Transport(String),

    /// No response within the configured timeout
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Non-success HTTP status without a JSON-RPC error body
    #[error("HTTP status {0}")]
    Status(u16),

    /// The node answered with a JSON-RPC error object
    #[error("node error {code}: {message}")]
    Node { code: i64, message: String },

    /// Response body did not have the expected shape
    #[error("malformed response: {0}")]
    Malformed(String),
}

pub type RpcResult<T> = Result<T, RpcError>;

/// Subset of `getblockchaininfo`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChainInfo {
    pub chain: String,
    pub blocks: u64,
    #[serde(default, rename = "bestblockhash")]
    pub best_block_hash: String,
}

/// One non-coinbase transaction from a block template.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TemplateTransaction {
    /// Raw transaction hex as it goes into the block
    pub data: String,
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
}

impl TemplateTransaction {
    /// Display-order transaction id, preferring `txid` over `hash`.
    pub fn id(&self) -> Option<&str> {
        self.txid.as_deref().or(self.hash.as_deref())
    }
}

/// Fields of `getblocktemplate` the pool consumes.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BlockTemplate {
    pub version: u32,
    #[serde(rename = "previousblockhash")]
    pub previous_block_hash: String,
    pub curtime: u32,
    /// Compact target as 8 hex digits
    pub bits: String,
    pub height: u64,
    #[serde(rename = "coinbasevalue")]
    pub coinbase_value: u64,
    #[serde(default)]
    pub transactions: Vec<TemplateTransaction>,
    #[serde(default)]
    pub default_witness_commitment: Option<String>,
}

/// Result of `submitblock`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// Node returned null
    Accepted,
    /// Node returned a rejection string such as "high-hash"
    Rejected(String),
}

/// Calls the pool makes against a full node.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    async fn get_blockchain_info(&self) -> RpcResult<ChainInfo>;

    async fn get_block_template(&self) -> RpcResult<BlockTemplate>;

    async fn submit_block(&self, block_hex: &str) -> RpcResult<SubmitOutcome>;
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

/// JSON-RPC 1.0 over HTTP with basic auth.
pub struct HttpNodeClient {
    http: HttpClient,
    url: String,
    user: String,
    password: String,
    timeout: Duration,
    template_params: Value,
    next_id: AtomicU64,
}

impl HttpNodeClient {
    pub fn new(rpc: &RpcConfig, profile: &CoinProfile, timeout: Duration) -> RpcResult<Self> {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            url: rpc.url.clone(),
            user: rpc.user.clone(),
            password: rpc.password.clone(),
            timeout,
            template_params: profile.template_params(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> RpcResult<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });
        trace!(method, id, "Node RPC request");

        let response = self
            .http
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| self.map_transport(e))?;

        // Bitcoin Core reports RPC errors with HTTP 500 and a JSON body, so
        // the body is inspected before the status.
        let parsed: RpcResponse = match serde_json::from_slice(&bytes) {
            Ok(parsed) => parsed,
            Err(e) if status.is_success() => return Err(RpcError::Malformed(e.to_string())),
            Err(_) => return Err(RpcError::Status(status.as_u16())),
        };
        if let Some(err) = parsed.error {
            return Err(RpcError::Node {
                code: err.code,
                message: err.message,
            });
        }
        if !status.is_success() {
            return Err(RpcError::Status(status.as_u16()));
        }
        serde_json::from_value(parsed.result).map_err(|e| RpcError::Malformed(e.to_string()))
    }

    fn map_transport(&self, err: reqwest::Error) -> RpcError {
        if err.is_timeout() {
            RpcError::Timeout(self.timeout)
        } else {
            RpcError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl NodeRpc for HttpNodeClient {
    async fn get_blockchain_info(&self) -> RpcResult<ChainInfo> {
        self.call("getblockchaininfo", json!([])).await
    }

    async fn get_block_template(&self) -> RpcResult<BlockTemplate> {
        self.call("getblocktemplate", self.template_params.clone()).await
    }

    async fn submit_block(&self, block_hex: &str) -> RpcResult<SubmitOutcome> {
        let result: Option<String> = self.call("submitblock", json!([block_hex])).await?;
        Ok(match result {
            None => SubmitOutcome::Accepted,
            Some(reason) => SubmitOutcome::Rejected(reason),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::coin::{Algorithm, CoinFamily};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_template_deserializes_node_fields() {
        let raw = json!({
            "version": 536870912,
            "previousblockhash": "000000000000000000026b6ffbd7d5ba8b8da4f3b0f4a2e5f3a1a5a2c1f0e0d0",
            "curtime": 1700000000,
            "bits": "17034219",
            "height": 820000,
            "coinbasevalue": 625000000,
            "transactions": [
                { "data": "00", "txid": "aa", "hash": "bb" },
                { "data": "01", "hash": "cc" }
            ],
            "default_witness_commitment": "6a24aa21a9ed00",
            "target": "ignored"
        });
        let template: BlockTemplate = serde_json::from_value(raw).unwrap();
        assert_eq!(template.height, 820000);
        assert_eq!(template.transactions[0].id(), Some("aa"));
        assert_eq!(template.transactions[1].id(), Some("cc"));
        assert!(template.default_witness_commitment.is_some());
    }

    // Minimal one-shot HTTP server returning a canned response body.
    async fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await.unwrap();
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client(url: String) -> HttpNodeClient {
        let rpc = RpcConfig {
            url,
            user: "user".into(),
            password: "pass".into(),
        };
        let profile = CoinProfile::resolve(CoinFamily::Bitcoin, Algorithm::Sha256d);
        HttpNodeClient::new(&rpc, &profile, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_submit_block_null_is_accepted() {
        let url = serve_once("200 OK", r#"{"result":null,"error":null,"id":1}"#).await;
        let outcome = client(url).submit_block("00").await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Accepted);
    }

    #[tokio::test]
    async fn test_submit_block_string_is_rejection() {
        let url = serve_once("200 OK", r#"{"result":"high-hash","error":null,"id":1}"#).await;
        let outcome = client(url).submit_block("00").await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Rejected("high-hash".into()));
    }

    #[tokio::test]
    async fn test_node_error_object_on_http_500() {
        let url = serve_once(
            "500 Internal Server Error",
            r#"{"result":null,"error":{"code":-10,"message":"Bitcoin Core is in initial sync"},"id":1}"#,
        )
        .await;
        let err = client(url).get_block_template().await.unwrap_err();
        assert!(matches!(err, RpcError::Node { code: -10, .. }));
    }

    #[tokio::test]
    async fn test_unauthorized_status() {
        let url = serve_once("401 Unauthorized", "").await;
        let err = client(url).get_blockchain_info().await.unwrap_err();
        assert!(matches!(err, RpcError::Status(401)));
    }
}
