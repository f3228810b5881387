//! itmd entry point.
//!
//! Runs the engine against an in-memory store and a recording provisioner.
//! Change notifications are fed through the sinks returned by
//! [`ItmDaemon::start`].

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use itmd::config::DEFAULT_CONFIG_PATH;
use itmd::{InMemoryStore, ItmConfig, ItmContext, ItmDaemon, RecordingProvisioner};
use tracing::{error, info};

/// Internal transport manager daemon
#[derive(Parser, Debug)]
#[command(name = "itmd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Override the number of concurrent job attempts
    #[arg(long)]
    workers: Option<usize>,

    /// Override the retry bound of each job
    #[arg(long)]
    max_retries: Option<u32>,
}

fn init_logging(log_level: &str, json: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let layer = fmt::layer().with_target(true).with_line_number(true);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.compact())
            .init();
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = ItmConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(workers) = args.workers {
        config.coordinator.workers = workers;
    }
    if let Some(max_retries) = args.max_retries {
        config.coordinator.max_retries = max_retries;
    }

    let ctx = ItmContext::new(
        config,
        Arc::new(InMemoryStore::new()),
        Arc::new(RecordingProvisioner::new()),
    )
    .context("building engine context")?;

    let mut daemon = ItmDaemon::new(ctx);
    // Producers attach to these sinks; holding them keeps the streams open.
    let _sinks = daemon.start().await.context("starting daemon")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");

    daemon.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level, args.json_logs);

    info!(version = env!("CARGO_PKG_VERSION"), config = %args.config.display(), "starting itmd");

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "itmd exiting with error");
            ExitCode::FAILURE
        }
    }
}
