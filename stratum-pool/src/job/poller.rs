//! Template polling.
//!
//! One task per coin asks the node for a block template on a fixed interval
//! and installs a new job only when the template signature changes. Failures
//! are recorded in the coin's stats; the last good job keeps being served.

use std::sync::Arc;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{build_job, template_signature, ActiveJob};
use crate::service::CoinContext;
use crate::telemetry::unix_now;
use crate::tracing::prelude::*;

pub async fn run_template_poller(ctx: Arc<CoinContext>, shutdown: CancellationToken) {
    let mut ticker = interval(ctx.pool.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(coin = %ctx.code, "Template poller started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                poll_once(&ctx).await;
            }
            _ = shutdown.cancelled() => break,
        }
    }
    debug!(coin = %ctx.code, "Template poller stopped");
}

/// One poll. Returns the newly installed job, if any.
pub async fn poll_once(ctx: &CoinContext) -> Option<Arc<ActiveJob>> {
    match ctx.node.get_blockchain_info().await {
        Ok(info) => ctx.update_stats(|s| s.chain_height = Some(info.blocks)),
        Err(e) => {
            warn!(coin = %ctx.code, error = %e, "getblockchaininfo failed");
            ctx.update_stats(|s| s.rpc_failed(e.to_string(), unix_now()));
        }
    }

    let template = match ctx.node.get_block_template().await {
        Ok(template) => template,
        Err(e) => {
            warn!(coin = %ctx.code, error = %e, "getblocktemplate failed, keeping last job");
            ctx.update_stats(|s| s.rpc_failed(e.to_string(), unix_now()));
            return None;
        }
    };
    ctx.update_stats(|s| {
        s.rpc_succeeded(unix_now());
        s.template_height = Some(template.height);
    });

    let current = ctx.current_job();
    let signature = template_signature(&template, &ctx.profile);
    if current.as_ref().is_some_and(|job| job.signature == signature) {
        trace!(coin = %ctx.code, "Template unchanged");
        return None;
    }

    let job = match build_job(
        ctx.next_job_id(),
        &template,
        &ctx.job_params,
        current.as_deref(),
    ) {
        Ok(job) => job,
        Err(e) => {
            warn!(coin = %ctx.code, height = template.height, error = %e, "Unusable block template");
            ctx.update_stats(|s| s.rpc_failed(format!("invalid template: {}", e), unix_now()));
            return None;
        }
    };

    let job = ctx.install_job(job);
    info!(
        coin = %ctx.code,
        job_id = %job.job_id,
        height = job.height,
        txs = job.transactions.len(),
        clean_jobs = job.clean_jobs,
        "New job"
    );
    Some(job)
}
