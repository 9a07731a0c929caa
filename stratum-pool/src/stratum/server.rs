//! TCP accept loop for one coin's Stratum port.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::connection::Connection;
use super::session::Session;
use crate::service::CoinContext;
use crate::tracing::prelude::*;

pub struct StratumServer {
    ctx: Arc<CoinContext>,
    listener: TcpListener,
}

impl StratumServer {
    /// Bind the coin's Stratum port on `host`. Port 0 picks a free
    /// one; see [`local_addr`](Self::local_addr).
    pub async fn bind(ctx: Arc<CoinContext>, host: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind((host, ctx.config.stratum_port)).await?;
        Ok(Self { ctx, listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept miners until `shutdown` fires. Each session runs on `sessions`
    /// and ends with the same token.
    pub async fn run(self, sessions: TaskTracker, shutdown: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(coin = %self.ctx.code, addr = %addr, "Stratum listening");
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            trace!(error = %e, "set_nodelay failed");
                        }
                        let transport = Connection::new(stream, self.ctx.pool.max_line_bytes);
                        let session = Session::new(self.ctx.clone(), transport, peer.to_string());
                        sessions.spawn(session.run(shutdown.clone()));
                    }
                    Err(e) => {
                        // Typically fd exhaustion; back off instead of spinning
                        warn!(coin = %self.ctx.code, error = %e, "Accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown.cancelled() => break,
            }
        }
        debug!(coin = %self.ctx.code, "Stratum listener stopped");
    }
}
