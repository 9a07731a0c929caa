//! Daemon lifecycle.
//!
//! Starts telemetry, the coins and the API, then waits for signals: SIGINT
//! and SIGTERM shut down, SIGHUP re-reads the configuration file and
//! reloads the coin set. Shutdown stops the coins first so their last
//! telemetry rows still reach the writer, then lets the writer drain.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal::unix::{self, SignalKind};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::api::{self, AppState};
use crate::config::Config;
use crate::registry::{CoinRegistry, HttpConnector};
use crate::telemetry::Telemetry;
use crate::tracing::prelude::*;

pub struct Daemon {
    config_path: PathBuf,
    config: Config,
}

impl Daemon {
    pub fn new(config_path: PathBuf, config: Config) -> Self {
        Self {
            config_path,
            config,
        }
    }

    pub async fn run(self) -> Result<()> {
        let running = CancellationToken::new();
        let telemetry_running = CancellationToken::new();
        let tracker = TaskTracker::new();

        let telemetry = Telemetry::start(&self.config.telemetry, &tracker, telemetry_running.clone())
            .await
            .context("failed to start telemetry")?;

        let connector = Arc::new(HttpConnector::new(self.config.pool.rpc_timeout()));
        let registry = match CoinRegistry::start(
            &self.config,
            telemetry.queue.clone(),
            connector,
            running.clone(),
        )
        .await
        {
            Ok(registry) => Arc::new(registry),
            Err(e) => {
                telemetry_running.cancel();
                tracker.close();
                tracker.wait().await;
                return Err(e).context("failed to start coins");
            }
        };

        let listener = match TcpListener::bind(&self.config.api.listen).await {
            Ok(listener) => listener,
            Err(e) => {
                running.cancel();
                registry.stop_all().await;
                telemetry_running.cancel();
                tracker.close();
                tracker.wait().await;
                return Err(e)
                    .with_context(|| format!("failed to bind API on {}", self.config.api.listen));
            }
        };
        let state = AppState {
            registry: registry.clone(),
            telemetry: telemetry.clone(),
        };
        tracker.spawn({
            let running = running.clone();
            async move {
                if let Err(e) = api::serve_on(listener, state, running).await {
                    error!(error = %e, "API server failed");
                }
            }
        });
        tracker.close();
        info!(coins = registry.coins().len(), "Started.");

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;
        let mut sighup = unix::signal(SignalKind::hangup())?;
        loop {
            tokio::select! {
                _ = sigint.recv() => break,
                _ = sigterm.recv() => break,
                _ = sighup.recv() => self.reload(&registry).await,
            }
        }

        trace!("Shutting down.");
        running.cancel();
        registry.stop_all().await;
        telemetry_running.cancel();
        tracker.wait().await;

        let health = telemetry.health();
        if health.lost_rows > 0 {
            warn!(lost = health.lost_rows, "Telemetry rows were lost this run");
        }
        info!("Exiting.");
        Ok(())
    }

    /// Re-read the configuration file and apply its coin list. Other
    /// sections take effect on restart only.
    async fn reload(&self, registry: &CoinRegistry) {
        info!(path = %self.config_path.display(), "SIGHUP, reloading coins");
        let config = match Config::load_from(&self.config_path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "Configuration reload failed, keeping current coins");
                return;
            }
        };
        if let Err(e) = registry.reload(config.coins).await {
            error!(error = %e, "Coin reload failed, keeping current coins");
        }
    }
}
