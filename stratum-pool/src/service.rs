//! Shared state of one served coin.
//!
//! A [`CoinContext`] is created per coin when its service starts and handed
//! as `Arc` to the template poller and every session on that coin. It owns
//! the job history, the runtime stats and the id counters; nothing in it is
//! shared between coins.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::coin::CoinProfile;
use crate::config::{CoinConfig, ConfigError, PoolConfig, VardiffConfig};
use crate::job::{ActiveJob, JobBook, JobParams, Recorded, ShareKey};
use crate::rpc::NodeRpc;
use crate::share::TraceLog;
use crate::stats::CoinRuntimeStats;
use crate::telemetry::{TelemetryQueue, TelemetryRow};

/// Bytes of extranonce1 assigned per session.
pub const EXTRANONCE1_SIZE: usize = 4;

pub struct CoinContext {
    pub code: String,
    pub config: CoinConfig,
    pub profile: CoinProfile,
    pub pool: PoolConfig,
    /// Vardiff settings with the coin's baseline applied
    pub vardiff: VardiffConfig,
    pub job_params: JobParams,
    pub node: Arc<dyn NodeRpc>,
    pub telemetry: TelemetryQueue,
    pub traces: TraceLog,

    jobs: Mutex<JobBook>,
    job_tx: watch::Sender<Option<Arc<ActiveJob>>>,
    stats: Mutex<CoinRuntimeStats>,
    extranonce_counter: AtomicU32,
    session_counter: AtomicU64,
    job_counter: AtomicU64,
}

impl CoinContext {
    pub fn new(
        config: CoinConfig,
        pool: &PoolConfig,
        vardiff: &VardiffConfig,
        node: Arc<dyn NodeRpc>,
        telemetry: TelemetryQueue,
    ) -> Result<Self, ConfigError> {
        let profile = CoinProfile::resolve(config.family, config.algorithm);
        let job_params = JobParams {
            profile,
            payout_script: pool.payout_script_bytes()?,
            coinbase_tag: pool.coinbase_tag.as_bytes().to_vec(),
            extranonce1_size: EXTRANONCE1_SIZE,
            extranonce2_size: pool.extranonce2_size,
        };

        let mut vardiff = vardiff.clone();
        if let Some(baseline) = config.baseline_difficulty {
            vardiff.baseline_difficulty = baseline;
        }

        let (job_tx, _) = watch::channel(None);
        Ok(Self {
            code: config.code.clone(),
            stats: Mutex::new(CoinRuntimeStats::new(&config.code, config.stratum_port)),
            traces: TraceLog::new(pool.share_trace_capacity, pool.worker_trace_capacity),
            config,
            profile,
            pool: pool.clone(),
            vardiff,
            job_params,
            node,
            telemetry,
            jobs: Mutex::new(JobBook::new(pool.stale_job_count)),
            job_tx,
            extranonce_counter: AtomicU32::new(0),
            session_counter: AtomicU64::new(0),
            job_counter: AtomicU64::new(0),
        })
    }

    /// Starting difficulty for a new session.
    pub fn baseline_difficulty(&self) -> f64 {
        self.vardiff.clamp(self.vardiff.baseline_difficulty)
    }

    pub fn next_job_id(&self) -> String {
        format!("{:x}", self.job_counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn next_session_id(&self) -> u64 {
        self.session_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Fixed-width, session-unique extranonce1.
    pub fn allocate_extranonce1(&self) -> [u8; EXTRANONCE1_SIZE] {
        let n = self.extranonce_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        n.to_be_bytes()
    }

    /// Make `job` current and broadcast it.
    ///
    /// The job book (and with it the duplicate set) is replaced before any
    /// session is woken, so a `notify` never names an unregistered job.
    pub fn install_job(&self, job: ActiveJob) -> Arc<ActiveJob> {
        let job = Arc::new(job);
        self.jobs.lock().install(job.clone());
        {
            let mut stats = self.stats.lock();
            stats.current_job_id = Some(job.job_id.clone());
            stats.template_height = Some(job.height);
        }
        self.job_tx.send_replace(Some(job.clone()));
        job
    }

    pub fn current_job(&self) -> Option<Arc<ActiveJob>> {
        self.jobs.lock().current()
    }

    /// A job still in the book, current or superseded.
    pub fn job(&self, job_id: &str) -> Option<Arc<ActiveJob>> {
        self.jobs.lock().get(job_id)
    }

    pub fn record_share(&self, job_id: &str, key: ShareKey) -> Recorded {
        self.jobs.lock().record(job_id, key)
    }

    pub fn subscribe_jobs(&self) -> watch::Receiver<Option<Arc<ActiveJob>>> {
        self.job_tx.subscribe()
    }

    pub fn update_stats<R>(&self, f: impl FnOnce(&mut CoinRuntimeStats) -> R) -> R {
        f(&mut self.stats.lock())
    }

    /// Consistent copy for reporting.
    pub fn stats_snapshot(&self) -> CoinRuntimeStats {
        self.stats.lock().clone()
    }

    pub fn record(&self, row: TelemetryRow) {
        self.telemetry.enqueue(row);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::RpcConfig;
    use crate::job::build_job;
    use crate::job::builder::tests::template;
    use crate::rpc::mock::MockNode;

    pub(crate) fn coin_config() -> CoinConfig {
        CoinConfig {
            code: "BTC".into(),
            family: Default::default(),
            algorithm: Default::default(),
            stratum_port: 0,
            baseline_difficulty: None,
            rpc: RpcConfig {
                url: "http://127.0.0.1:8332".into(),
                user: "user".into(),
                password: "pass".into(),
            },
        }
    }

    pub(crate) fn pool_config() -> PoolConfig {
        PoolConfig {
            payout_script: "76a914000000000000000000000000000000000000000088ac".into(),
            ..Default::default()
        }
    }

    /// Context over a mock node, plus the receiving end of its telemetry.
    pub(crate) fn context(
        node: Arc<MockNode>,
    ) -> (
        Arc<CoinContext>,
        tokio::sync::mpsc::Receiver<TelemetryRow>,
    ) {
        let (queue, rx) = TelemetryQueue::new(1024);
        let ctx = CoinContext::new(
            coin_config(),
            &pool_config(),
            &VardiffConfig::default(),
            node,
            queue,
        )
        .unwrap();
        (Arc::new(ctx), rx)
    }

    #[test]
    fn test_extranonce1_is_unique_and_fixed_width() {
        let (ctx, _rx) = context(Arc::new(MockNode::default()));
        let a = ctx.allocate_extranonce1();
        let b = ctx.allocate_extranonce1();
        assert_ne!(a, b);
        assert_eq!(hex::encode(a), "00000001");
        assert_eq!(hex::encode(b), "00000002");
    }

    #[test]
    fn test_install_registers_before_broadcast() {
        let (ctx, _rx) = context(Arc::new(MockNode::default()));
        let mut jobs = ctx.subscribe_jobs();
        let job = build_job(ctx.next_job_id(), &template("1d00ffff"), &ctx.job_params, None)
            .unwrap();
        ctx.install_job(job);

        assert!(jobs.has_changed().unwrap());
        let notified = jobs.borrow_and_update().clone().unwrap();
        assert!(ctx.job(&notified.job_id).is_some());
        assert_eq!(ctx.stats_snapshot().current_job_id.as_deref(), Some("1"));
    }

    #[test]
    fn test_coin_baseline_overrides_vardiff_default() {
        let mut config = coin_config();
        config.baseline_difficulty = Some(64.0);
        let (queue, _rx) = TelemetryQueue::new(4);
        let ctx = CoinContext::new(
            config,
            &pool_config(),
            &VardiffConfig::default(),
            Arc::new(MockNode::default()),
            queue,
        )
        .unwrap();
        assert_eq!(ctx.baseline_difficulty(), 64.0);
    }
}
