//! Error types for the Stratum v1 server.

use thiserror::Error;

/// Transport and framing errors. Anything here ends the session; bad request
/// content is answered on the wire instead.
#[derive(Error, Debug)]
pub enum StratumError {
    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Request line exceeded the configured limit
    #[error("Request line longer than {0} bytes")]
    LineTooLong(usize),

    /// Connection lost
    #[error("Connection lost")]
    Disconnected,
}

/// Convenient Result type for Stratum operations.
pub type StratumResult<T> = Result<T, StratumError>;
