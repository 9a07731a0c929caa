//! Configuration management for stratum-pool.
//!
//! Configuration is a single TOML file. Every section except `[pool]` and
//! `[[coins]]` has usable defaults. The per-coin section is also what the
//! admin reload endpoint accepts (as JSON), so coin validation is exposed on
//! its own.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coin::{Algorithm, CoinFamily};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/stratum-pool/pool.toml";

/// Longest coinbase tag that still leaves room in the 100-byte scriptSig.
pub const MAX_COINBASE_TAG_LEN: usize = 40;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure for the pool.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Settings shared by every coin
    pub pool: PoolConfig,

    /// Variable difficulty controller
    pub vardiff: VardiffConfig,

    /// Durable telemetry queue and store
    pub telemetry: TelemetryConfig,

    /// Reporting API
    pub api: ApiConfig,

    /// Logging
    pub log: LogConfig,

    /// Served coins
    pub coins: Vec<CoinConfig>,
}

/// Settings shared by every coin.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pushed into every coinbase scriptSig after the extranonces
    pub coinbase_tag: String,

    /// Hex scriptPubKey receiving the coinbase value
    pub payout_script: String,

    /// Bytes of miner-chosen extranonce
    pub extranonce2_size: usize,

    pub template_poll_interval_secs: u64,
    pub rpc_timeout_secs: u64,

    /// How many superseded jobs a worker may still submit against
    pub stale_job_count: usize,

    /// How long after being superseded a job still accepts submissions
    pub stale_job_grace_secs: u64,

    pub share_trace_capacity: usize,
    pub worker_trace_capacity: usize,

    /// Longest accepted request line
    pub max_line_bytes: usize,

    /// Address the Stratum ports bind on
    pub stratum_host: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            coinbase_tag: "/stratum-pool/".to_string(),
            payout_script: String::new(),
            extranonce2_size: 4,
            template_poll_interval_secs: 5,
            rpc_timeout_secs: 10,
            stale_job_count: 3,
            stale_job_grace_secs: 60,
            share_trace_capacity: 512,
            worker_trace_capacity: 64,
            max_line_bytes: 16 * 1024,
            stratum_host: "0.0.0.0".to_string(),
        }
    }
}

impl PoolConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.template_poll_interval_secs)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn stale_job_grace(&self) -> Duration {
        Duration::from_secs(self.stale_job_grace_secs)
    }

    /// Decoded payout script.
    pub fn payout_script_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        hex::decode(&self.payout_script)
            .map_err(|e| ConfigError::Invalid(format!("payout_script is not hex: {}", e)))
    }
}

/// Variable difficulty controller settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VardiffConfig {
    /// Starting difficulty for coins without their own
    pub baseline_difficulty: f64,
    pub min_difficulty: f64,
    pub max_difficulty: f64,

    /// Accepted shares per minute considered on target
    pub target_min_per_minute: f64,
    pub target_max_per_minute: f64,

    /// Sliding window for the observed rate
    pub window_secs: u64,
    pub retarget_interval_secs: u64,

    /// Accepted shares required before the first retarget
    pub min_shares: usize,

    /// Time since the first accepted share before any retarget
    pub warmup_secs: u64,

    /// Largest multiplicative change per retarget, upward
    pub max_step_up: f64,

    /// Smallest multiplicative change per retarget, downward
    pub min_step_down: f64,

    /// Relative changes below this are suppressed
    pub min_relative_change: f64,
}

impl Default for VardiffConfig {
    fn default() -> Self {
        Self {
            baseline_difficulty: 1024.0,
            min_difficulty: 0.001,
            max_difficulty: 1e12,
            target_min_per_minute: 10.0,
            target_max_per_minute: 20.0,
            window_secs: 300,
            retarget_interval_secs: 30,
            min_shares: 4,
            warmup_secs: 60,
            max_step_up: 4.0,
            min_step_down: 0.25,
            min_relative_change: 0.1,
        }
    }
}

impl VardiffConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn retarget_interval(&self) -> Duration {
        Duration::from_secs(self.retarget_interval_secs)
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_secs(self.warmup_secs)
    }

    /// Clamp a difficulty into the configured bounds.
    pub fn clamp(&self, difficulty: f64) -> f64 {
        difficulty.clamp(self.min_difficulty, self.max_difficulty)
    }
}

/// Durable telemetry settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// SQLite database path; absent keeps telemetry in memory
    pub database: Option<PathBuf>,

    /// Append-only JSON-lines file for batches the store refused
    pub spool_path: PathBuf,

    pub queue_capacity: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub maintenance_interval_secs: u64,
    pub retention: RetentionConfig,
    pub rollup_lookback_mins: u64,
    pub replay_batch: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            database: None,
            spool_path: PathBuf::from("/var/lib/stratum-pool/telemetry.spool"),
            queue_capacity: 10_000,
            batch_size: 200,
            flush_interval_ms: 1000,
            max_retries: 4,
            backoff_initial_ms: 200,
            backoff_max_ms: 5000,
            maintenance_interval_secs: 60,
            retention: RetentionConfig::default(),
            rollup_lookback_mins: 15,
            replay_batch: 500,
        }
    }
}

impl TelemetryConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn rollup_lookback(&self) -> Duration {
        Duration::from_secs(self.rollup_lookback_mins * 60)
    }
}

/// Per-table retention, in days.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub shares: u64,
    pub blocks: u64,
    pub events: u64,
    pub rollups: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            shares: 7,
            blocks: 90,
            events: 14,
            rollups: 30,
        }
    }
}

/// Reporting API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Listen address
    pub listen: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7786".to_string(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default level when RUST_LOG is unset
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Static configuration of one served coin.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CoinConfig {
    /// Currency code, e.g. "BTC"
    pub code: String,

    #[serde(default)]
    pub family: CoinFamily,

    #[serde(default)]
    pub algorithm: Algorithm,

    /// TCP port miners connect to
    pub stratum_port: u16,

    /// Overrides `[vardiff] baseline_difficulty`
    #[serde(default)]
    pub baseline_difficulty: Option<f64>,

    pub rpc: RpcConfig,
}

/// Node RPC endpoint and credentials.
#[derive(Clone, PartialEq, Deserialize, Serialize)]
pub struct RpcConfig {
    pub url: String,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for RpcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcConfig")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Config {
    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate configuration text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pool = &self.pool;
        if pool.payout_script.is_empty() {
            return Err(ConfigError::Invalid("pool.payout_script is required".into()));
        }
        pool.payout_script_bytes()?;
        if pool.coinbase_tag.len() > MAX_COINBASE_TAG_LEN {
            return Err(ConfigError::Invalid(format!(
                "pool.coinbase_tag longer than {} bytes",
                MAX_COINBASE_TAG_LEN
            )));
        }
        if !(1..=8).contains(&pool.extranonce2_size) {
            return Err(ConfigError::Invalid(
                "pool.extranonce2_size must be 1-8".into(),
            ));
        }
        if pool.stale_job_count == 0 {
            return Err(ConfigError::Invalid(
                "pool.stale_job_count must be at least 1".into(),
            ));
        }

        let vardiff = &self.vardiff;
        for (name, value) in [
            ("baseline_difficulty", vardiff.baseline_difficulty),
            ("min_difficulty", vardiff.min_difficulty),
            ("max_difficulty", vardiff.max_difficulty),
            ("target_min_per_minute", vardiff.target_min_per_minute),
            ("target_max_per_minute", vardiff.target_max_per_minute),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "vardiff.{} must be positive",
                    name
                )));
            }
        }
        if vardiff.min_difficulty > vardiff.max_difficulty {
            return Err(ConfigError::Invalid(
                "vardiff.min_difficulty exceeds max_difficulty".into(),
            ));
        }
        if vardiff.target_min_per_minute >= vardiff.target_max_per_minute {
            return Err(ConfigError::Invalid(
                "vardiff target band is empty".into(),
            ));
        }
        if vardiff.max_step_up < 1.0 || !(0.0..=1.0).contains(&vardiff.min_step_down) {
            return Err(ConfigError::Invalid(
                "vardiff step limits must satisfy min_step_down <= 1 <= max_step_up".into(),
            ));
        }
        if vardiff.window_secs == 0 || vardiff.retarget_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "vardiff window and retarget interval must be non-zero".into(),
            ));
        }

        let telemetry = &self.telemetry;
        if telemetry.queue_capacity == 0 || telemetry.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "telemetry queue_capacity and batch_size must be non-zero".into(),
            ));
        }

        validate_coins(&self.coins)
    }
}

/// Validate a coin list on its own (used on load and on admin reload).
pub fn validate_coins(coins: &[CoinConfig]) -> Result<(), ConfigError> {
    let mut codes = HashSet::new();
    let mut ports = HashSet::new();
    for coin in coins {
        if coin.code.is_empty() {
            return Err(ConfigError::Invalid("coin code must not be empty".into()));
        }
        if !codes.insert(coin.code.clone()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate coin code {}",
                coin.code
            )));
        }
        // Port 0 asks the OS for an ephemeral port and never collides.
        if coin.stratum_port != 0 && !ports.insert(coin.stratum_port) {
            return Err(ConfigError::Invalid(format!(
                "duplicate stratum port {}",
                coin.stratum_port
            )));
        }
        if let Some(diff) = coin.baseline_difficulty {
            if !diff.is_finite() || diff <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "coin {} baseline_difficulty must be positive",
                    coin.code
                )));
            }
        }
        if coin.rpc.url.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "coin {} has no rpc url",
                coin.code
            )));
        }
    }
    Ok(())
}
