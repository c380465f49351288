//! channel-sync daemon: serves the webhook receiver and trigger API, or
//! runs a single reconciliation or restore pass.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cs_core::config::Config;
use cs_daemon::daemon::Daemon;
use tracing::{error, info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "cs-daemon", version, about)]
struct Cli {
    /// Config file (defaults to ~/.channel-sync/config.toml).
    #[arg(long, env = "CHANNEL_SYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server, webhook workers and schedule (default).
    Serve,

    /// Run one full reconciliation and print its report.
    Reconcile {
        /// Compute the diff without writing anything.
        #[arg(long)]
        preview: bool,
    },

    /// Re-verify wrongly cancelled reservations and print the report.
    Restore,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let loaded = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    let (config, load_error) = match loaded {
        Ok(cfg) => (cfg, None),
        Err(e) => (Config::default(), Some(e)),
    };
    cs_telemetry::logging::init("cs-daemon", &config.logging.level, config.logging.json);
    if let Some(e) = load_error {
        warn!(error = %e, "failed to load config, using defaults");
    }

    let daemon = Daemon::new(config)
        .await
        .context("failed to start daemon")?;

    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            info!(version = env!("CARGO_PKG_VERSION"), "channel-sync daemon starting");
            daemon.run().await?;
        }
        Command::Reconcile { preview } => {
            let report = daemon.reconcile_once(preview).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !preview {
                report.ensure_clean()?;
            }
        }
        Command::Restore => {
            let report = daemon.restore_once().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
