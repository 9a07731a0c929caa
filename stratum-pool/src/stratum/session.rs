//! Per-connection protocol state machine.
//!
//! A session starts `Connected`. `mining.subscribe` assigns the extranonce1
//! and `mining.authorize` registers a worker; once both have happened (in
//! either order) the session is primed: it pushes `set_difficulty` and the
//! current job, and from then on forwards every new job of its coin.
//! Version rolling, negotiated with `mining.configure`, is independent of
//! that progression.
//!
//! Everything here runs on the connection's own task. Requests are handled
//! strictly in arrival order, and a slow `submitblock` holds up only this
//! miner.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use ruint::aliases::U256;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::connection::Transport;
use super::error::StratumResult;
use super::messages::{set_difficulty, ClientRequest, JsonRpcMessage, ERROR_OTHER};
use crate::job::{assemble_block, ActiveJob, Recorded, ShareKey};
use crate::pow::target_from_difficulty;
use crate::rpc::SubmitOutcome;
use crate::service::{CoinContext, EXTRANONCE1_SIZE};
use crate::share::engine::ShareInput;
use crate::share::submission::{check_ntime, resolve_version};
use crate::share::{evaluate, Evaluation, RejectReason, ShareTrace, Submission, Verdict};
use crate::telemetry::{
    unix_now, unix_now_millis, BlockRow, ShareRow, TelemetryRow, WorkerEvent, WorkerEventKind,
};
use crate::tracing::prelude::*;
use crate::vardiff::VardiffController;

/// Version bits the pool lets miners roll (BIP 320).
pub const VERSION_ROLLING_MASK: u32 = 0x1fff_e000;

/// A job this session was told about.
struct SentJob {
    job_id: String,
    /// When a newer job replaced it; `None` while current
    superseded_at: Option<Instant>,
}

/// How a submission was judged, with whatever was derived on the way.
struct Judgement {
    verdict: Verdict,
    job: Option<Arc<ActiveJob>>,
    version: Option<u32>,
    share_target: Option<U256>,
    evaluation: Option<Evaluation>,
}

impl Judgement {
    fn reject(reason: RejectReason, job: Option<Arc<ActiveJob>>) -> Self {
        Self {
            verdict: Verdict::Reject(reason),
            job,
            version: None,
            share_target: None,
            evaluation: None,
        }
    }
}

pub struct Session<T: Transport> {
    ctx: Arc<CoinContext>,
    transport: T,
    id: u64,
    peer: String,

    extranonce1: Option<[u8; EXTRANONCE1_SIZE]>,
    /// Authorized worker names; the first one names the session in logs
    workers: BTreeSet<String>,
    primary_worker: Option<String>,
    version_mask: Option<u32>,
    suggested_difficulty: Option<f64>,
    vardiff: VardiffController,
    primed: bool,

    sent_jobs: VecDeque<SentJob>,
    share_seq: u64,
    jobs: watch::Receiver<Option<Arc<ActiveJob>>>,
}

impl<T: Transport> Session<T> {
    pub fn new(ctx: Arc<CoinContext>, transport: T, peer: String) -> Self {
        let id = ctx.next_session_id();
        let jobs = ctx.subscribe_jobs();
        let vardiff = VardiffController::new(&ctx.vardiff, ctx.baseline_difficulty(), Instant::now());
        Self {
            ctx,
            transport,
            id,
            peer,
            extranonce1: None,
            workers: BTreeSet::new(),
            primary_worker: None,
            version_mask: None,
            suggested_difficulty: None,
            vardiff,
            primed: false,
            sent_jobs: VecDeque::new(),
            share_seq: 0,
            jobs,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Serve until the miner leaves, the transport fails or `shutdown`
    /// fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        self.ctx.update_stats(|s| s.connection_opened());
        self.event(WorkerEventKind::Connected, Some(self.peer.clone()));
        debug!(coin = %self.ctx.code, session = self.id, peer = %self.peer, "Miner connected");

        let reason = match self.serve(&shutdown).await {
            Ok(reason) => reason.to_string(),
            Err(e) => {
                debug!(coin = %self.ctx.code, session = self.id, error = %e, "Session ended");
                e.to_string()
            }
        };

        self.ctx.update_stats(|s| s.connection_closed());
        self.event(WorkerEventKind::Disconnected, Some(reason.clone()));
        info!(
            coin = %self.ctx.code,
            session = self.id,
            worker = self.primary_worker.as_deref().unwrap_or("-"),
            reason = %reason,
            "Miner disconnected"
        );
    }

    async fn serve(&mut self, shutdown: &CancellationToken) -> StratumResult<&'static str> {
        let period = self.ctx.vardiff.retarget_interval();
        let mut retarget = interval_at(Instant::now() + period, period);
        retarget.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.jobs.borrow_and_update();

        loop {
            tokio::select! {
                line = self.transport.read_line() => {
                    match line? {
                        Some(line) => self.handle_line(&line).await?,
                        None => return Ok("closed by miner"),
                    }
                }
                changed = self.jobs.changed() => {
                    if changed.is_err() {
                        return Ok("coin stopped");
                    }
                    let job = self.jobs.borrow_and_update().clone();
                    if let Some(job) = job {
                        self.on_new_job(job).await?;
                    }
                }
                _ = retarget.tick() => self.on_retarget_tick().await?,
                _ = shutdown.cancelled() => return Ok("shutdown"),
            }
        }
    }

    async fn handle_line(&mut self, line: &str) -> StratumResult<()> {
        let Some(request) = ClientRequest::parse(line) else {
            debug!(coin = %self.ctx.code, session = self.id, line = %line, "Malformed request");
            return self
                .send(JsonRpcMessage::error(Value::Null, ERROR_OTHER, "Malformed request"))
                .await;
        };
        trace!(session = self.id, method = %request.method, "Request");

        match request.method.as_str() {
            "mining.subscribe" => self.handle_subscribe(request).await,
            "mining.authorize" => self.handle_authorize(request).await,
            "mining.configure" => self.handle_configure(request).await,
            "mining.extranonce.subscribe" => {
                self.send(JsonRpcMessage::ok(request.id, json!(true))).await
            }
            "mining.suggest_difficulty" => self.handle_suggest_difficulty(request).await,
            "mining.submit" => self.handle_submit(request).await,
            other => {
                debug!(session = self.id, method = %other, "Unknown method");
                self.send(JsonRpcMessage::error(request.id, ERROR_OTHER, "Method not found"))
                    .await
            }
        }
    }

    async fn handle_subscribe(&mut self, request: ClientRequest) -> StratumResult<()> {
        let extranonce1 = *self
            .extranonce1
            .get_or_insert_with(|| self.ctx.allocate_extranonce1());
        let subscription = format!("{:x}", self.id);
        let result = json!([
            [
                ["mining.set_difficulty", subscription],
                ["mining.notify", subscription]
            ],
            hex::encode(extranonce1),
            self.ctx.pool.extranonce2_size,
        ]);
        debug!(
            coin = %self.ctx.code,
            session = self.id,
            agent = request.str_param(0).unwrap_or("-"),
            extranonce1 = %hex::encode(extranonce1),
            "Subscribed"
        );
        self.send(JsonRpcMessage::ok(request.id, result)).await?;
        self.prime().await
    }

    async fn handle_authorize(&mut self, request: ClientRequest) -> StratumResult<()> {
        let worker = match request.str_param(0) {
            Some(worker) if !worker.trim().is_empty() => worker.trim().to_string(),
            _ => {
                return self
                    .send(JsonRpcMessage::rejected(request.id, RejectReason::Unauthorized))
                    .await
            }
        };

        if self.workers.insert(worker.clone()) {
            self.primary_worker.get_or_insert_with(|| worker.clone());
            self.event_for(&worker, WorkerEventKind::Authorized, None);
            info!(coin = %self.ctx.code, session = self.id, worker = %worker, "Worker authorized");
        }
        self.send(JsonRpcMessage::ok(request.id, json!(true))).await?;
        self.prime().await
    }

    async fn handle_configure(&mut self, request: ClientRequest) -> StratumResult<()> {
        let extensions: Vec<&str> = request
            .params
            .first()
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let options = request.params.get(1).cloned().unwrap_or(Value::Null);

        let mut result = serde_json::Map::new();
        for extension in extensions {
            if extension == "version-rolling" {
                let miner_mask = options
                    .get("version-rolling.mask")
                    .and_then(Value::as_str)
                    .and_then(|mask| u32::from_str_radix(mask, 16).ok())
                    .unwrap_or(VERSION_ROLLING_MASK);
                let mask = miner_mask & VERSION_ROLLING_MASK;
                self.version_mask = Some(mask);
                result.insert("version-rolling".into(), json!(true));
                result.insert("version-rolling.mask".into(), json!(format!("{:08x}", mask)));
                debug!(session = self.id, mask = format!("{:08x}", mask), "Version rolling");
            } else {
                result.insert(extension.to_string(), json!(false));
            }
        }
        self.send(JsonRpcMessage::ok(request.id, Value::Object(result)))
            .await
    }

    async fn handle_suggest_difficulty(&mut self, request: ClientRequest) -> StratumResult<()> {
        let suggested = request.params.first().and_then(Value::as_f64);
        match suggested {
            Some(difficulty) if difficulty.is_finite() && difficulty > 0.0 && !self.primed => {
                self.suggested_difficulty = Some(self.ctx.vardiff.clamp(difficulty));
            }
            Some(_) => {
                debug!(session = self.id, "Ignoring difficulty suggestion");
            }
            None => {
                return self
                    .send(JsonRpcMessage::error(request.id, ERROR_OTHER, "Invalid params"))
                    .await
            }
        }
        self.send(JsonRpcMessage::ok(request.id, json!(true))).await
    }

    /// Push difficulty and work once both subscribe and authorize happened.
    async fn prime(&mut self) -> StratumResult<()> {
        if self.primed || self.extranonce1.is_none() || self.workers.is_empty() {
            return Ok(());
        }
        self.primed = true;

        let start = self
            .suggested_difficulty
            .unwrap_or_else(|| self.ctx.baseline_difficulty());
        let difficulty = self.vardiff.set_difficulty(start, Instant::now());
        self.send(set_difficulty(difficulty)).await?;

        self.jobs.borrow_and_update();
        if let Some(job) = self.ctx.current_job() {
            self.sent_jobs.push_back(SentJob {
                job_id: job.job_id.clone(),
                superseded_at: None,
            });
            self.send(notify(&job, true)).await?;
        }
        Ok(())
    }

    async fn on_new_job(&mut self, job: Arc<ActiveJob>) -> StratumResult<()> {
        if !self.primed {
            return Ok(());
        }
        if self.sent_jobs.back().is_some_and(|sent| sent.job_id == job.job_id) {
            return Ok(());
        }

        let now = Instant::now();
        if let Some(last) = self.sent_jobs.back_mut() {
            last.superseded_at = Some(now);
        }
        self.sent_jobs.push_back(SentJob {
            job_id: job.job_id.clone(),
            superseded_at: None,
        });
        while self.sent_jobs.len() > self.ctx.pool.stale_job_count + 1 {
            self.sent_jobs.pop_front();
        }
        self.send(notify(&job, job.clean_jobs)).await
    }

    async fn on_retarget_tick(&mut self) -> StratumResult<()> {
        if !self.primed {
            return Ok(());
        }
        let previous = self.vardiff.difficulty();
        let Some(difficulty) = self.vardiff.retarget(Instant::now()) else {
            return Ok(());
        };

        info!(
            coin = %self.ctx.code,
            session = self.id,
            worker = self.primary_worker.as_deref().unwrap_or("-"),
            from = previous,
            to = difficulty,
            "Difficulty retarget"
        );
        self.event(
            WorkerEventKind::DifficultyChanged,
            Some(format!("{} -> {}", previous, difficulty)),
        );
        self.send(set_difficulty(difficulty)).await?;
        // Resend work so the new difficulty applies without waiting for a
        // template change.
        if let Some(job) = self.ctx.current_job() {
            self.send(notify(&job, false)).await?;
        }
        Ok(())
    }

    async fn handle_submit(&mut self, request: ClientRequest) -> StratumResult<()> {
        let Some(submission) = submission_from(&request) else {
            return self
                .send(JsonRpcMessage::error(request.id, ERROR_OTHER, "Invalid params"))
                .await;
        };

        self.share_seq += 1;
        let correlation_id = format!("{}-{}-{}", self.ctx.code, self.id, self.share_seq);
        let received_at = unix_now_millis();
        let assigned_difficulty = self.vardiff.difficulty();
        let judgement = self.judge(&submission, assigned_difficulty);

        let response = match judgement.verdict {
            Verdict::Accept { .. } => JsonRpcMessage::ok(request.id, json!(true)),
            Verdict::Reject(reason) => JsonRpcMessage::rejected(request.id, reason),
        };
        self.send(response).await?;

        self.account(&submission, &judgement, &correlation_id, received_at, assigned_difficulty);

        if let (Verdict::Accept { block_candidate: true }, Some(job), Some(eval)) =
            (judgement.verdict, &judgement.job, &judgement.evaluation)
        {
            self.submit_block(&submission, job, eval, &correlation_id)
                .await;
        }
        Ok(())
    }

    /// Structural checks first, stopping at the first failure, then the
    /// proof-of-work check.
    fn judge(&self, submission: &Submission, difficulty: f64) -> Judgement {
        let Some(extranonce1) = self.extranonce1 else {
            return Judgement::reject(RejectReason::NotSubscribed, None);
        };
        if !self.workers.contains(&submission.worker) {
            return Judgement::reject(RejectReason::Unauthorized, None);
        }

        let share = match submission.parse(self.ctx.pool.extranonce2_size) {
            Ok(share) => share,
            Err(reason) => return Judgement::reject(reason, None),
        };

        let Some(job) = self.ctx.job(&submission.job_id) else {
            let reason = if self.ctx.current_job().is_some() {
                RejectReason::StaleJob
            } else {
                RejectReason::NoActiveJob
            };
            return Judgement::reject(reason, None);
        };
        if let Err(reason) = check_ntime(share.ntime, job.ntime) {
            return Judgement::reject(reason, Some(job));
        }
        if !self.within_stale_window(&job.job_id) {
            return Judgement::reject(RejectReason::StaleJob, Some(job));
        }

        let key = ShareKey {
            extranonce1: extranonce1.to_vec(),
            extranonce2: share.extranonce2.clone(),
            ntime: share.ntime,
            nonce: share.nonce,
            version_bits: share.version_bits,
        };
        match self.ctx.record_share(&job.job_id, key) {
            Recorded::New => {}
            Recorded::Duplicate => return Judgement::reject(RejectReason::DuplicateShare, Some(job)),
            Recorded::UnknownJob => return Judgement::reject(RejectReason::StaleJob, Some(job)),
        }

        let version = match resolve_version(job.version, self.version_mask, share.version_bits) {
            Ok(version) => version,
            Err(reason) => return Judgement::reject(reason, Some(job)),
        };
        let share_target = match target_from_difficulty(difficulty, job.diff1) {
            Ok(target) => target,
            Err(e) => {
                warn!(session = self.id, error = %e, "Cannot derive share target");
                return Judgement::reject(RejectReason::ShareEvalFailed, Some(job));
            }
        };

        let evaluation = evaluate(&ShareInput {
            job: &job,
            extranonce1: &extranonce1,
            share: &share,
            version,
            mask: self.version_mask,
            share_target,
        });
        Judgement {
            verdict: evaluation.verdict,
            job: Some(job),
            version: Some(version),
            share_target: Some(share_target),
            evaluation: Some(evaluation),
        }
    }

    /// The current job, or one this session was sent that was replaced
    /// within the grace period.
    fn within_stale_window(&self, job_id: &str) -> bool {
        let grace = self.ctx.pool.stale_job_grace();
        self.sent_jobs
            .iter()
            .rev()
            .find(|sent| sent.job_id == job_id)
            .is_some_and(|sent| match sent.superseded_at {
                None => true,
                Some(at) => at.elapsed() <= grace,
            })
    }

    /// Stats, vardiff, trace and telemetry for one judged submission.
    fn account(
        &mut self,
        submission: &Submission,
        judgement: &Judgement,
        correlation_id: &str,
        received_at: i64,
        assigned_difficulty: f64,
    ) {
        let eval = judgement.evaluation.as_ref();
        match judgement.verdict {
            Verdict::Accept { block_candidate } => {
                let (share_difficulty, ambiguous) =
                    eval.map_or((0.0, false), |e| (e.share_difficulty, e.ambiguous));
                self.ctx.update_stats(|s| {
                    s.share_accepted(share_difficulty, ambiguous);
                    if block_candidate {
                        s.block_candidates += 1;
                    }
                });
                self.vardiff.record_accepted(Instant::now());
                if ambiguous {
                    debug!(
                        session = self.id,
                        correlation_id,
                        variant = %eval.map_or("-", |e| e.variant.as_ref()),
                        "Share accepted through compatibility header"
                    );
                }
            }
            Verdict::Reject(reason) => {
                self.ctx.update_stats(|s| s.share_rejected(reason));
                debug!(
                    session = self.id,
                    correlation_id,
                    worker = %submission.worker,
                    job_id = %submission.job_id,
                    reason = %reason,
                    "Share rejected"
                );
            }
        }

        let job = judgement.job.as_deref();
        self.ctx.traces.record(ShareTrace {
            correlation_id: correlation_id.to_string(),
            coin: self.ctx.code.clone(),
            session_id: self.id,
            received_at,
            submission: submission.clone(),
            extranonce1: self.extranonce1.map(hex::encode).unwrap_or_default(),
            assigned_difficulty,
            share_target: judgement.share_target.map(target_hex),
            network_target: job.map(|j| target_hex(j.network_target)),
            version: judgement.version,
            header: eval.map(|e| hex::encode(e.header)),
            hash: eval.map(|e| display_hash(&e.hash)),
            matched_variant: eval
                .filter(|_| judgement.verdict.is_accept())
                .map(|e| e.variant),
            ambiguous: eval.is_some_and(|e| e.ambiguous),
            share_difficulty: eval.map(|e| e.share_difficulty),
            verdict: judgement.verdict,
        });

        self.ctx.record(TelemetryRow::Share(ShareRow {
            ts: received_at / 1000,
            coin: self.ctx.code.clone(),
            worker: submission.worker.clone(),
            session_id: self.id,
            job_id: submission.job_id.clone(),
            correlation_id: correlation_id.to_string(),
            accepted: judgement.verdict.is_accept(),
            reason: judgement.verdict.reject_reason().map(|r| r.to_string()),
            assigned_difficulty,
            share_difficulty: eval.map(|e| e.share_difficulty),
            block_candidate: matches!(
                judgement.verdict,
                Verdict::Accept {
                    block_candidate: true
                }
            ),
            variant: eval
                .filter(|_| judgement.verdict.is_accept())
                .map(|e| e.variant.to_string()),
        }));
    }

    async fn submit_block(
        &self,
        submission: &Submission,
        job: &ActiveJob,
        eval: &Evaluation,
        correlation_id: &str,
    ) {
        let block_hash = display_hash(&eval.hash);
        let block = assemble_block(job, &eval.header, &eval.coinbase);
        info!(
            coin = %self.ctx.code,
            height = job.height,
            hash = %block_hash,
            worker = %submission.worker,
            correlation_id,
            "Block candidate found, submitting"
        );

        let result = self.ctx.node.submit_block(&hex::encode(&block)).await;
        let (accepted, error) = match &result {
            Ok(SubmitOutcome::Accepted) => {
                info!(coin = %self.ctx.code, height = job.height, hash = %block_hash, "Block accepted");
                (true, None)
            }
            Ok(SubmitOutcome::Rejected(reason)) => {
                warn!(coin = %self.ctx.code, height = job.height, reason = %reason, "Block rejected by node");
                (false, Some(reason.clone()))
            }
            Err(e) => {
                error!(coin = %self.ctx.code, height = job.height, error = %e, "submitblock failed");
                (false, Some(e.to_string()))
            }
        };
        self.ctx.update_stats(|s| {
            s.block_submitted(result.as_ref().ok());
            match &result {
                Ok(_) => s.rpc_succeeded(unix_now()),
                Err(e) => s.rpc_failed(e.to_string(), unix_now()),
            }
        });

        self.ctx.record(TelemetryRow::Block(BlockRow {
            ts: unix_now(),
            coin: self.ctx.code.clone(),
            worker: submission.worker.clone(),
            job_id: job.job_id.clone(),
            height: job.height,
            block_hash,
            correlation_id: correlation_id.to_string(),
            accepted,
            error,
        }));
    }

    async fn send(&mut self, msg: JsonRpcMessage) -> StratumResult<()> {
        self.transport.write_message(&msg).await
    }

    fn event(&self, kind: WorkerEventKind, detail: Option<String>) {
        self.record_event(self.primary_worker.clone(), kind, detail);
    }

    fn event_for(&self, worker: &str, kind: WorkerEventKind, detail: Option<String>) {
        self.record_event(Some(worker.to_string()), kind, detail);
    }

    fn record_event(&self, worker: Option<String>, event: WorkerEventKind, detail: Option<String>) {
        self.ctx.record(TelemetryRow::Event(WorkerEvent {
            ts: unix_now(),
            coin: self.ctx.code.clone(),
            session_id: self.id,
            worker,
            event,
            detail,
        }));
    }
}

fn notify(job: &ActiveJob, clean_jobs: bool) -> JsonRpcMessage {
    JsonRpcMessage::notification("mining.notify", job.notify_params(clean_jobs))
}

/// `[worker, job_id, extranonce2, ntime, nonce, version_bits?]`
fn submission_from(request: &ClientRequest) -> Option<Submission> {
    Some(Submission {
        worker: request.str_param(0)?.to_string(),
        job_id: request.str_param(1)?.to_string(),
        extranonce2: request.str_param(2)?.to_string(),
        ntime: request.str_param(3)?.to_string(),
        nonce: request.str_param(4)?.to_string(),
        version_bits: request.str_param(5).map(str::to_string),
    })
}

fn target_hex(target: U256) -> String {
    hex::encode(target.to_be_bytes::<32>())
}

/// Hash bytes reversed into the order block explorers show.
fn display_hash(hash: &[u8; 32]) -> String {
    let mut display = *hash;
    display.reverse();
    hex::encode(display)
}
