//! Command-line interface for stratum-pool.
//!
//! Talks to the daemon's HTTP API: coin stats, telemetry health, recent
//! shares, blocks, worker events, rollups and share traces, plus coin reload.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use stratum_pool::api_client::{Client, SharesFilter};
use stratum_pool::config::CoinConfig;

#[derive(Debug, Parser)]
#[command(version, about = "Query and control a stratum-pool daemon")]
struct Cli {
    /// API base URL
    #[arg(long, env = "STRATUM_POOL_API_URL", default_value = "http://127.0.0.1:7786")]
    url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Overall health
    Health,
    /// Runtime stats of every coin
    Coins,
    /// Stats and current job of one coin
    Coin { code: String },
    /// Telemetry queue, writer and spool counters
    Telemetry,
    /// Recent shares, newest first
    Shares {
        #[arg(long)]
        coin: Option<String>,
        #[arg(long)]
        worker: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Recent block submissions
    Blocks {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Recent worker events
    Events {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Per-minute share rollups
    Rollups {
        /// Unix seconds; the daemon defaults to the last hour
        #[arg(long)]
        since: Option<i64>,
    },
    /// Recent share evaluation traces
    Traces {
        #[arg(long)]
        worker: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Replace the served coin set from a JSON array or a TOML file with
    /// `[[coins]]` tables
    Reload { file: PathBuf },
    /// Raw API call (e.g. "api coins/BTC")
    Api { endpoint: String },
}

#[derive(Deserialize)]
struct CoinsFile {
    coins: Vec<CoinConfig>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::with_base_url(cli.url);

    match cli.command {
        Command::Health => {
            let health = client.health().await?;
            println!("Status:    {}", health.status);
            println!("Coins:     {}", health.coins);
            println!("Telemetry: {}", if health.telemetry_degraded { "degraded" } else { "ok" });
        }
        Command::Coins => {
            let coins = client.coins().await?;
            if coins.is_empty() {
                println!("Coins: (none)");
            }
            for coin in &coins {
                println!(
                    "{:<6} port {:<5} conns {:<4} accepted {:<8} rejected {:<8} height {}",
                    coin.coin,
                    coin.stratum_port,
                    coin.connections_current,
                    coin.shares_accepted,
                    coin.shares_rejected,
                    coin.template_height.map_or("-".to_string(), |h| h.to_string()),
                );
            }
        }
        Command::Coin { code } => print_json(&client.coin(&code).await?)?,
        Command::Telemetry => print_json(&client.telemetry().await?)?,
        Command::Shares {
            coin,
            worker,
            limit,
        } => {
            let filter = SharesFilter {
                limit,
                coin,
                worker,
            };
            print_json(&client.shares(&filter).await?)?;
        }
        Command::Blocks { limit } => print_json(&client.blocks(limit).await?)?,
        Command::Events { limit } => print_json(&client.events(limit).await?)?,
        Command::Rollups { since } => print_json(&client.rollups(since).await?)?,
        Command::Traces { worker, limit } => {
            print_json(&client.traces(worker.as_deref(), limit).await?)?
        }
        Command::Reload { file } => {
            let coins = read_coins(&file)?;
            let report = client.reload(&coins).await?;
            println!("Started:   {}", report.started.join(", "));
            println!("Stopped:   {}", report.stopped.join(", "));
            println!("Unchanged: {}", report.unchanged.join(", "));
        }
        Command::Api { endpoint } => {
            let body = client.get_raw(&endpoint).await?;
            // Try to pretty-print as JSON; fall back to raw text
            match serde_json::from_str::<serde_json::Value>(&body) {
                Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
                Err(_) => print!("{}", body),
            }
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_coins(path: &Path) -> Result<Vec<CoinConfig>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    if path.extension().is_some_and(|ext| ext == "toml") {
        let file: CoinsFile = toml::from_str(&text)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(file.coins)
    } else {
        serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
    }
}
