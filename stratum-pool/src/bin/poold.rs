//! Main entry point for the stratum-pool daemon.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use stratum_pool::{
    config::{Config, DEFAULT_CONFIG_PATH},
    daemon::Daemon,
    tracing,
};

/// Stratum v1 mining pool server.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Configuration file
    #[arg(long, env = "STRATUM_POOL_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load_from(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    tracing::init_journald_or_stdout(tracing::parse_level(&config.log.level));

    let daemon = Daemon::new(args.config, config);
    daemon.run().await
}
