mod config;
mod error;
mod ledger;
mod mirror;
mod platform;
mod scheduler;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::ledger::Ledger;
use crate::mirror::{MirrorPipeline, RunSummary};
use crate::platform::discord::DiscordSource;
use crate::platform::telegram::TelegramSink;
use crate::scheduler::Scheduler;

#[derive(Parser)]
#[command(name = "discord-mirror")]
#[command(about = "Mirror Discord channels into Telegram forum threads")]
struct Cli {
    /// Path to config file (TOML, or the legacy config.json layout)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Mirror new messages once and exit (default)
    Run,
    /// Keep running, mirroring on the configured cron schedule
    Serve,
    /// Forget every mirrored message; the next run re-posts the whole window
    ResetLedger {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_filter = if cli.debug {
        "debug"
    } else {
        "info,discord_mirror=debug"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Loading configuration from: {}", cli.config.display());
    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    info!("Configuration loaded successfully");
    info!("  Channels: {}", config.mirror.channels.len());
    info!("  Window: {}h", config.mirror.message_window_hours);
    info!("  Filter words: {}", config.mirror.filter_words.len());
    info!(
        "  Ledger: {} at {}",
        config.ledger.backend,
        config.ledger.path.display()
    );

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let pipeline = build_pipeline(&config)?;
            run_once(&config, &pipeline).await?;
        }
        Command::Serve => serve(config).await?,
        Command::ResetLedger { yes } => reset_ledger(&config, yes)?,
    }

    Ok(())
}

fn build_pipeline(config: &Config) -> Result<MirrorPipeline> {
    let source = Arc::new(DiscordSource::new(config.discord.clone()));
    let sink = Arc::new(TelegramSink::new(&config.telegram.bot_token));
    MirrorPipeline::from_config(config, source, sink)
}

/// One run with the ledger opened for its duration. A ledger that can't be
/// read aborts the run before anything is fetched.
async fn run_once(config: &Config, pipeline: &MirrorPipeline) -> Result<RunSummary> {
    let store = ledger::open_store(config.ledger.backend, &config.ledger.path)
        .context("Failed to open ledger")?;
    let mut ledger = Ledger::open(store).with_context(|| {
        format!(
            "Failed to load ledger from {} (use reset-ledger to start over)",
            config.ledger.path.display()
        )
    })?;

    Ok(pipeline.run(&mut ledger).await)
}

async fn serve(config: Config) -> Result<()> {
    let config = Arc::new(config);
    let pipeline = Arc::new(build_pipeline(&config)?);

    let mut scheduler = Scheduler::new().await?;
    let job_config = Arc::clone(&config);
    scheduler
        .add_exclusive_job(&config.schedule.cron, "mirror", move || {
            let config = Arc::clone(&job_config);
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                if let Err(e) = run_once(&config, &pipeline).await {
                    error!("Mirror run failed: {:#}", e);
                }
            })
        })
        .await?;
    scheduler.start().await?;

    info!("Mirror is running, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    scheduler.shutdown().await?;
    Ok(())
}

fn reset_ledger(config: &Config, confirmed: bool) -> Result<()> {
    if !confirmed {
        anyhow::bail!("Refusing to reset the ledger without --yes");
    }
    let mut store = ledger::open_store(config.ledger.backend, &config.ledger.path)
        .context("Failed to open ledger")?;
    store.reset().context("Failed to reset ledger")?;
    warn!(
        "Ledger at {} reset; the next run re-posts every message in the window",
        config.ledger.path.display()
    );
    Ok(())
}
