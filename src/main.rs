//! Crossed-market arbitrage bot
//!
//! `run` follows new blocks over WebSocket, evaluates every tradable token
//! on each block and races the opportunities it finds as bundles until
//! Ctrl-C. `scan` does a single evaluation and prints what it found.
//!
//! Settings come from the environment (and `.env`); policy thresholds can
//! be overridden with a TOML file.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossed_arb::arbitrage::DEFAULT_MAX_ATTEMPTS;
use crossed_arb::utils::to_display;
use crossed_arb::{ArbitrageService, EngineConfig, EnvSettings, PolicyThresholds, Submissions};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Crossed-market AMM arbitrage with private bundle submission
#[derive(Parser)]
#[command(name = "crossed-arb")]
struct Args {
    /// TOML file overriding the default policy thresholds
    #[arg(short, long, env = "ARBITRAGE_THRESHOLDS")]
    thresholds: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Follow blocks, evaluate and submit until interrupted
    Run {
        /// Evaluate and log opportunities without submitting bundles
        #[arg(long)]
        dry_run: bool,

        /// Blocks each bundle is retried for
        #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
        max_attempts: u32,

        /// Reload markets from the factories every N blocks (0 = never)
        #[arg(long, default_value_t = 300)]
        refresh_every: u64,
    },
    /// Evaluate once at the latest block and print the opportunities
    Scan,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs);

    info!("Crossed-market arbitrage starting...");

    let mut config =
        EngineConfig::from_settings(&EnvSettings::load()).context("invalid configuration")?;
    if let Some(path) = &args.thresholds {
        let thresholds = PolicyThresholds::load(path)?;
        info!("Policy thresholds loaded from {}", path.display());
        config = config.with_thresholds(thresholds);
    }
    info!(
        "Min profit: {} ETH | Max trade: {} ETH | Gas limit: {} | Builder share: {}",
        to_display(config.thresholds.min_profit_threshold, 18),
        to_display(config.thresholds.max_trade_size, 18),
        config.thresholds.gas_limit,
        config.thresholds.miner_reward_percentage
    );

    let mut service = ArbitrageService::new();
    service
        .initialize_with_config(config)
        .await
        .context("failed to initialize arbitrage service")?;
    let service = Arc::new(service);

    match args.command {
        Command::Scan => scan(&service).await,
        Command::Run {
            dry_run,
            max_attempts,
            refresh_every,
        } => run(service, dry_run, max_attempts, refresh_every).await,
    }
}

async fn scan(service: &ArbitrageService) -> Result<()> {
    let opportunities = service.evaluate().await?;
    info!(
        "Block {}: {} opportunities",
        service.current_block()?,
        opportunities.len()
    );
    for (rank, opp) in opportunities.iter().enumerate() {
        info!("#{} {}", rank + 1, opp);
    }
    println!("{}", serde_json::to_string_pretty(&service.market_state())?);
    Ok(())
}

async fn run(
    service: Arc<ArbitrageService>,
    dry_run: bool,
    max_attempts: u32,
    refresh_every: u64,
) -> Result<()> {
    service.start().await?;
    let mut blocks = service.subscribe_blocks()?;

    if dry_run {
        info!("DRY RUN - opportunities are logged, no bundles are sent");
    }
    info!("Watching blocks from {}", service.current_block()?);

    let mut submissions = Submissions::new();
    let mut total_scans = 0u64;
    let mut total_opportunities = 0u64;
    let mut total_submitted = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, shutting down");
                break;
            }
            changed = blocks.changed() => {
                if changed.is_err() {
                    warn!("Block feed closed");
                    break;
                }
                let block = *blocks.borrow_and_update();
                total_scans += 1;
                submissions.reap();

                if refresh_every > 0 && block.current_block % refresh_every == 0 {
                    if let Err(e) = service.refresh_registry().await {
                        warn!("Registry refresh at block {} failed: {}", block.current_block, e);
                    }
                }

                let opportunities = match service.evaluate().await {
                    Ok(found) => found,
                    Err(e) => {
                        error!("Evaluation failed at block {}: {}", block.current_block, e);
                        continue;
                    }
                };
                total_opportunities += opportunities.len() as u64;

                if total_scans % 100 == 0 {
                    info!(
                        "Block {} | {} scans | {} opportunities | {} submitted",
                        block.current_block, total_scans, total_opportunities, total_submitted
                    );
                }

                if opportunities.is_empty() {
                    continue;
                }
                if dry_run {
                    for opp in &opportunities {
                        info!("[DRY RUN] {}", opp);
                    }
                    continue;
                }

                total_submitted += opportunities.len() as u64;
                submissions.spawn(service.clone(), opportunities, Some(max_attempts));
            }
        }
    }

    // Pending retries are cancelled; sends already under way complete
    service.stop().await;
    submissions.drain().await;
    info!(
        "Stopped after {} scans: {} opportunities, {} submitted",
        total_scans, total_opportunities, total_submitted
    );
    Ok(())
}
