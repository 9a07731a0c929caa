//! Served coins and their lifecycle.
//!
//! The daemon owns one [`CoinRegistry`]. Each coin runs as a
//! [`CoinService`]: a template poller, a Stratum listener and the sessions
//! it accepts, all on the coin's own task tracker under a child of the
//! daemon's cancellation token. Readers (the API) get `Arc<CoinContext>`
//! handles and never touch the services themselves.
//!
//! A reload is applied as a whole or not at all. Coins whose configuration
//! did not change keep running with their sessions and counters.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::coin::CoinProfile;
use crate::config::{validate_coins, CoinConfig, Config, PoolConfig, VardiffConfig};
use crate::error::{Error, Result};
use crate::job::poller::run_template_poller;
use crate::rpc::{HttpNodeClient, NodeRpc, RpcResult};
use crate::service::CoinContext;
use crate::stats::CoinRuntimeStats;
use crate::stratum::StratumServer;
use crate::telemetry::TelemetryQueue;
use crate::tracing::prelude::*;

/// Opens a node client for a coin.
pub trait NodeConnector: Send + Sync {
    fn connect(&self, coin: &CoinConfig, profile: &CoinProfile) -> RpcResult<Arc<dyn NodeRpc>>;
}

/// Production connector: JSON-RPC over HTTP.
pub struct HttpConnector {
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl NodeConnector for HttpConnector {
    fn connect(&self, coin: &CoinConfig, profile: &CoinProfile) -> RpcResult<Arc<dyn NodeRpc>> {
        Ok(Arc::new(HttpNodeClient::new(&coin.rpc, profile, self.timeout)?))
    }
}

/// One running coin.
pub struct CoinService {
    pub ctx: Arc<CoinContext>,
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl CoinService {
    async fn stop(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!(coin = %self.ctx.code, "Coin stopped");
    }
}

/// What a reload did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub unchanged: Vec<String>,
}

pub struct CoinRegistry {
    pool: PoolConfig,
    vardiff: VardiffConfig,
    telemetry: TelemetryQueue,
    connector: Arc<dyn NodeConnector>,
    shutdown: CancellationToken,
    services: RwLock<BTreeMap<String, Arc<CoinService>>>,
    /// Serializes reloads and shutdown
    changes: tokio::sync::Mutex<()>,
}

impl CoinRegistry {
    /// Start every configured coin. Fails if any coin cannot start; coins
    /// started before the failure are stopped again.
    pub async fn start(
        config: &Config,
        telemetry: TelemetryQueue,
        connector: Arc<dyn NodeConnector>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let registry = Self {
            pool: config.pool.clone(),
            vardiff: config.vardiff.clone(),
            telemetry,
            connector,
            shutdown,
            services: RwLock::new(BTreeMap::new()),
            changes: tokio::sync::Mutex::new(()),
        };
        registry.reload(config.coins.clone()).await?;
        Ok(registry)
    }

    /// Running coins, ordered by code.
    pub fn coins(&self) -> Vec<Arc<CoinContext>> {
        self.services
            .read()
            .values()
            .map(|service| service.ctx.clone())
            .collect()
    }

    pub fn coin(&self, code: &str) -> Option<Arc<CoinContext>> {
        self.services.read().get(code).map(|service| service.ctx.clone())
    }

    /// Stats snapshot of every running coin.
    pub fn stats(&self) -> Vec<CoinRuntimeStats> {
        self.coins().iter().map(|ctx| ctx.stats_snapshot()).collect()
    }

    /// Bound Stratum address of a coin.
    pub fn local_addr(&self, code: &str) -> Option<SocketAddr> {
        self.services.read().get(code).map(|service| service.addr)
    }

    /// Replace the served coin set.
    ///
    /// The new list is validated first. Coins that are gone or changed are
    /// stopped, then new and changed coins are started. If any start fails,
    /// the coins started by this call are stopped and the previous set is
    /// restored.
    pub async fn reload(&self, coins: Vec<CoinConfig>) -> Result<ReloadReport> {
        let _guard = self.changes.lock().await;
        validate_coins(&coins)?;

        let current: Vec<Arc<CoinService>> = self.services.read().values().cloned().collect();
        let mut report = ReloadReport::default();
        let mut replaced = Vec::new();
        for service in current {
            if coins.contains(&service.ctx.config) {
                report.unchanged.push(service.ctx.code.clone());
            } else {
                replaced.push(service);
            }
        }

        for service in &replaced {
            self.services.write().remove(&service.ctx.code);
            service.stop().await;
            report.stopped.push(service.ctx.code.clone());
        }

        let mut started = Vec::new();
        for coin in coins {
            if report.unchanged.contains(&coin.code) {
                continue;
            }
            match self.start_coin(coin.clone()).await {
                Ok(service) => started.push(Arc::new(service)),
                Err(e) => {
                    error!(coin = %coin.code, error = %e, "Coin failed to start, rolling back reload");
                    for service in &started {
                        service.stop().await;
                    }
                    self.restore(replaced).await;
                    return Err(e);
                }
            }
        }

        let mut services = self.services.write();
        for service in started {
            report.started.push(service.ctx.code.clone());
            services.insert(service.ctx.code.clone(), service);
        }
        drop(services);

        info!(
            started = ?report.started,
            stopped = ?report.stopped,
            unchanged = ?report.unchanged,
            "Coin set applied"
        );
        Ok(report)
    }

    /// Stop every coin and wait for its sessions to finish.
    pub async fn stop_all(&self) {
        let _guard = self.changes.lock().await;
        let services: Vec<Arc<CoinService>> =
            std::mem::take(&mut *self.services.write()).into_values().collect();
        for service in services {
            service.stop().await;
        }
    }

    async fn restore(&self, previous: Vec<Arc<CoinService>>) {
        for old in previous {
            match self.start_coin(old.ctx.config.clone()).await {
                Ok(service) => {
                    self.services
                        .write()
                        .insert(service.ctx.code.clone(), Arc::new(service));
                }
                Err(e) => {
                    error!(coin = %old.ctx.code, error = %e, "Could not restore coin after failed reload");
                }
            }
        }
    }

    async fn start_coin(&self, config: CoinConfig) -> Result<CoinService> {
        let profile = CoinProfile::resolve(config.family, config.algorithm);
        let node = self.connector.connect(&config, &profile)?;
        let ctx = Arc::new(CoinContext::new(
            config,
            &self.pool,
            &self.vardiff,
            node,
            self.telemetry.clone(),
        )?);

        let server = StratumServer::bind(ctx.clone(), &self.pool.stratum_host)
            .await
            .map_err(Error::Io)?;
        let addr = server.local_addr()?;

        let shutdown = self.shutdown.child_token();
        let tracker = TaskTracker::new();
        tracker.spawn(run_template_poller(ctx.clone(), shutdown.clone()));
        tracker.spawn(server.run(tracker.clone(), shutdown.clone()));

        info!(
            coin = %ctx.code,
            family = ?ctx.config.family,
            algorithm = ?ctx.config.algorithm,
            addr = %addr,
            "Coin started"
        );
        Ok(CoinService {
            ctx,
            addr,
            shutdown,
            tracker,
        })
    }
}
