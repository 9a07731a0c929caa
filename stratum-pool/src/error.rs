//! Common error types for stratum-pool.
//!
//! Each subsystem owns its own error enum; this module aggregates them into a
//! single Error for the daemon and API layers.

use thiserror::Error;

use crate::config::ConfigError;
use crate::job::JobError;
use crate::pow::DifficultyError;
use crate::rpc::RpcError;
use crate::stratum::StratumError;
use crate::telemetry::StoreError;

/// Main error type for stratum-pool operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Stratum wire protocol errors
    #[error("Protocol error: {0}")]
    Stratum(#[from] StratumError),

    /// Node RPC errors
    #[error("Node RPC error: {0}")]
    Rpc(#[from] RpcError),

    /// Block template could not be turned into a job
    #[error("Job construction error: {0}")]
    Job(#[from] JobError),

    /// Difficulty out of domain
    #[error("Difficulty error: {0}")]
    Difficulty(#[from] DifficultyError),

    /// Telemetry store or spool errors
    #[error("Telemetry store error: {0}")]
    Store(#[from] StoreError),

    /// Unknown coin code
    #[error("Unknown coin: {0}")]
    UnknownCoin(String),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
