//! Line-delimited transport for miner connections.
//!
//! Stratum v1 is newline-delimited JSON over TCP. [`Connection`] frames the
//! socket on `\n` with a length-limited [`AnyDelimiterCodec`]. Frames are
//! bytes, not text, so a line that is not UTF-8 reaches the session as a
//! malformed request instead of failing the transport. The [`Transport`]
//! trait lets the session run over channels in tests.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Framed};
use tracing::trace;

use super::error::{StratumError, StratumResult};
use super::messages::JsonRpcMessage;

/// Line-level I/O for one miner.
///
/// Reads return raw lines so that malformed JSON can be answered rather
/// than treated as a transport failure.
#[async_trait]
pub trait Transport: Send {
    /// Next non-empty line, or `None` on clean close. Must be cancel safe.
    async fn read_line(&mut self) -> StratumResult<Option<String>>;

    async fn write_message(&mut self, msg: &JsonRpcMessage) -> StratumResult<()>;
}

pub struct Connection {
    framed: Framed<TcpStream, AnyDelimiterCodec>,
    max_line_bytes: usize,
}

impl Connection {
    pub fn new(stream: TcpStream, max_line_bytes: usize) -> Self {
        Self {
            framed: Framed::new(
                stream,
                AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), max_line_bytes),
            ),
            max_line_bytes,
        }
    }
}

#[async_trait]
impl Transport for Connection {
    async fn read_line(&mut self) -> StratumResult<Option<String>> {
        loop {
            match self.framed.next().await {
                None => return Ok(None),
                Some(Ok(frame)) => {
                    // Invalid UTF-8 becomes U+FFFD and fails JSON parsing
                    let line = String::from_utf8_lossy(&frame);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    trace!(rx = %line, "Received line");
                    return Ok(Some(line.to_string()));
                }
                Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                    return Err(StratumError::LineTooLong(self.max_line_bytes))
                }
                Some(Err(AnyDelimiterCodecError::Io(e))) => return Err(e.into()),
            }
        }
    }

    async fn write_message(&mut self, msg: &JsonRpcMessage) -> StratumResult<()> {
        let json = serde_json::to_string(msg)?;
        trace!(tx = %json, "Sending message");
        self.framed.send(json).await.map_err(|e| match e {
            AnyDelimiterCodecError::Io(e) => StratumError::Io(e),
            AnyDelimiterCodecError::MaxChunkLengthExceeded => {
                StratumError::LineTooLong(self.max_line_bytes)
            }
        })
    }
}

/// Channel-backed transport for deterministic session tests.
///
/// Works with `tokio::time::pause()` since no real I/O is involved. The
/// transport is the session's side, the handle is the test's side.
#[cfg(test)]
pub(crate) struct MockTransport {
    rx: tokio::sync::mpsc::UnboundedReceiver<String>,
    tx: tokio::sync::mpsc::UnboundedSender<JsonRpcMessage>,
}

#[cfg(test)]
pub(crate) struct MockTransportHandle {
    tx: tokio::sync::mpsc::UnboundedSender<String>,
    rx: tokio::sync::mpsc::UnboundedReceiver<JsonRpcMessage>,
}

#[cfg(test)]
impl MockTransport {
    pub fn pair() -> (Self, MockTransportHandle) {
        let (line_tx, line_rx) = tokio::sync::mpsc::unbounded_channel();
        let (msg_tx, msg_rx) = tokio::sync::mpsc::unbounded_channel();
        (
            MockTransport {
                rx: line_rx,
                tx: msg_tx,
            },
            MockTransportHandle {
                tx: line_tx,
                rx: msg_rx,
            },
        )
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for MockTransport {
    async fn read_line(&mut self) -> StratumResult<Option<String>> {
        Ok(self.rx.recv().await)
    }

    async fn write_message(&mut self, msg: &JsonRpcMessage) -> StratumResult<()> {
        self.tx
            .send(msg.clone())
            .map_err(|_| StratumError::Disconnected)
    }
}

#[cfg(test)]
impl MockTransportHandle {
    /// Send a raw line to the session.
    pub fn send_line(&self, line: &str) {
        self.tx.send(line.to_string()).expect("transport dropped");
    }

    /// Send a request to the session.
    pub fn send(&self, request: serde_json::Value) {
        self.send_line(&request.to_string());
    }

    /// Next message the session wrote, as JSON.
    pub async fn recv(&mut self) -> serde_json::Value {
        let msg = self.rx.recv().await.expect("transport dropped");
        serde_json::to_value(msg).unwrap()
    }

    /// Next message, if one is already waiting.
    pub fn try_recv(&mut self) -> Option<serde_json::Value> {
        self.rx
            .try_recv()
            .ok()
            .map(|msg| serde_json::to_value(msg).unwrap())
    }

    /// Close the miner side.
    pub fn close(self) -> tokio::sync::mpsc::UnboundedReceiver<JsonRpcMessage> {
        self.rx
    }
}
