//! End-to-end Stratum exchange over real TCP against a stub node.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use stratum_pool::coin::CoinProfile;
use stratum_pool::config::{CoinConfig, Config};
use stratum_pool::registry::{CoinRegistry, NodeConnector};
use stratum_pool::rpc::{BlockTemplate, ChainInfo, NodeRpc, RpcResult, SubmitOutcome};
use stratum_pool::telemetry::{TelemetryQueue, TelemetryRow};

const CONFIG: &str = r#"
[pool]
payout_script = "76a914000000000000000000000000000000000000000088ac"
stratum_host = "127.0.0.1"

[vardiff]
baseline_difficulty = 1e-12
min_difficulty = 1e-15

[[coins]]
code = "BTC"
stratum_port = 0

[coins.rpc]
url = "http://127.0.0.1:1"
user = "user"
password = "pass"
"#;

#[derive(Default)]
struct StubNode {
    submitted: Mutex<Vec<String>>,
}

#[async_trait]
impl NodeRpc for StubNode {
    async fn get_blockchain_info(&self) -> RpcResult<ChainInfo> {
        Ok(ChainInfo {
            chain: "regtest".into(),
            blocks: 819_999,
            best_block_hash: String::new(),
        })
    }

    async fn get_block_template(&self) -> RpcResult<BlockTemplate> {
        Ok(BlockTemplate {
            version: 0x2000_0000,
            previous_block_hash:
                "00000000000000000001a2b3c4d5e6f708090a0b0c0d0e0f1011121314151617".into(),
            curtime: 1_700_000_000,
            bits: "1d00ffff".into(),
            height: 820_000,
            coinbase_value: 625_000_000,
            transactions: vec![],
            default_witness_commitment: None,
        })
    }

    async fn submit_block(&self, block_hex: &str) -> RpcResult<SubmitOutcome> {
        self.submitted.lock().push(block_hex.to_string());
        Ok(SubmitOutcome::Accepted)
    }
}

struct StubConnector(Arc<StubNode>);

impl NodeConnector for StubConnector {
    fn connect(&self, _coin: &CoinConfig, _profile: &CoinProfile) -> RpcResult<Arc<dyn NodeRpc>> {
        Ok(self.0.clone())
    }
}

struct Miner {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Miner {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    async fn send(&mut self, msg: Value) {
        let line = format!("{}\n", msg);
        self.send_raw(line.as_bytes()).await;
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let line = timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("timed out waiting for the pool")
            .unwrap()
            .expect("pool closed the connection");
        serde_json::from_str(&line).unwrap()
    }

    /// Skip notifications until the response with `id` arrives.
    async fn response(&mut self, id: u64) -> Value {
        loop {
            let msg = self.recv().await;
            if msg["id"] == id {
                return msg;
            }
        }
    }

    async fn notify(&mut self) -> Value {
        loop {
            let msg = self.recv().await;
            if msg["method"] == "mining.notify" {
                return msg;
            }
        }
    }
}

async fn start_pool() -> (CoinRegistry, mpsc::Receiver<TelemetryRow>, CancellationToken) {
    let config = Config::from_toml_str(CONFIG).unwrap();
    let (queue, rows) = TelemetryQueue::new(1024);
    let shutdown = CancellationToken::new();
    let registry = CoinRegistry::start(
        &config,
        queue,
        Arc::new(StubConnector(Arc::new(StubNode::default()))),
        shutdown.clone(),
    )
    .await
    .unwrap();
    (registry, rows, shutdown)
}

#[tokio::test]
async fn test_subscribe_authorize_submit_over_tcp() {
    let (registry, mut rows, shutdown) = start_pool().await;
    let addr = registry.local_addr("BTC").unwrap();
    let mut miner = Miner::connect(addr).await;

    miner
        .send(json!({"id": 1, "method": "mining.subscribe", "params": ["flow-test/1.0"]}))
        .await;
    let subscribed = miner.response(1).await;
    assert_eq!(subscribed["error"], Value::Null);
    assert_eq!(subscribed["result"][1].as_str().unwrap().len(), 8);
    assert_eq!(subscribed["result"][2], 4);

    miner
        .send(json!({"id": 2, "method": "mining.authorize", "params": ["alice.rig1", "x"]}))
        .await;
    assert_eq!(miner.response(2).await["result"], true);

    let notify = miner.notify().await;
    let job_id = notify["params"][0].as_str().unwrap().to_string();
    let ntime = notify["params"][7].as_str().unwrap().to_string();

    let submit = |id: u64| {
        json!({
            "id": id,
            "method": "mining.submit",
            "params": ["alice.rig1", job_id, "00000001", ntime, "00000042"]
        })
    };
    miner.send(submit(3)).await;
    let accepted = miner.response(3).await;
    assert_eq!(accepted["result"], true);
    assert_eq!(accepted["error"], Value::Null);

    miner.send(submit(4)).await;
    let duplicate = miner.response(4).await;
    assert_eq!(duplicate["result"], Value::Null);
    assert_eq!(duplicate["error"][0], 22);

    let stats = registry.coin("BTC").unwrap().stats_snapshot();
    assert_eq!(stats.shares_accepted, 1);
    assert_eq!(stats.shares_rejected, 1);
    assert_eq!(stats.connections_current, 1);

    drop(miner);
    shutdown.cancel();
    registry.stop_all().await;

    let mut shares = Vec::new();
    while let Ok(row) = rows.try_recv() {
        if let TelemetryRow::Share(share) = row {
            shares.push(share);
        }
    }
    assert_eq!(shares.len(), 2);
    assert!(shares[0].accepted);
    assert_eq!(shares[1].reason.as_deref(), Some("duplicate_share"));
    assert_ne!(shares[0].correlation_id, shares[1].correlation_id);
}

#[tokio::test]
async fn test_malformed_line_gets_null_id_error() {
    let (registry, _rows, shutdown) = start_pool().await;
    let mut miner = Miner::connect(registry.local_addr("BTC").unwrap()).await;

    miner.send(json!("not a request")).await;
    let reply = miner.recv().await;
    assert_eq!(reply["id"], Value::Null);
    assert_eq!(reply["result"], Value::Null);
    assert!(reply["error"].is_array());

    // The session survives protocol errors
    miner
        .send(json!({"id": 7, "method": "mining.subscribe", "params": []}))
        .await;
    assert!(miner.response(7).await["result"].is_array());

    shutdown.cancel();
    registry.stop_all().await;
}

#[tokio::test]
async fn test_non_utf8_line_is_answered_and_session_survives() {
    let (registry, _rows, shutdown) = start_pool().await;
    let mut miner = Miner::connect(registry.local_addr("BTC").unwrap()).await;

    miner.send_raw(b"\xff\xfe garbage\n").await;
    let reply = miner.recv().await;
    assert_eq!(
        reply,
        json!({"id": null, "result": null, "error": [20, "Malformed request", null]})
    );

    miner
        .send(json!({"id": 8, "method": "mining.subscribe", "params": []}))
        .await;
    let subscribed = miner.response(8).await;
    assert_eq!(subscribed["error"], Value::Null);
    assert!(subscribed["result"].is_array());

    shutdown.cancel();
    registry.stop_all().await;
}
