use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sensorhub::agent::Agent;
use sensorhub::config::Config;
use sensorhub::export::{self, ExportFormat};
use sensorhub::version;
use tracing_subscriber::{fmt, EnvFilter};

/// Live multi-sensor telemetry ingestion and dashboard backend.
#[derive(Parser)]
#[command(name = "sensorhub", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity, as an env-filter directive (overrides log_level in the config).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,

    /// Export stored samples to one file per device.
    Export {
        /// Output directory.
        #[arg(short, long)]
        out: PathBuf,

        /// Export only this device.
        #[arg(short, long)]
        device: Option<String>,

        #[arg(short, long, value_enum, default_value_t = ExportFormat::Ndjson)]
        format: ExportFormat,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("sensorhub {}", version::full());
        return Ok(());
    }

    // Config is required for everything else.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    // Initialize tracing.
    let level = cli.log_level.unwrap_or_else(|| cfg.log_level.clone());
    let filter =
        EnvFilter::try_new(&level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    if let Some(Command::Export {
        out,
        device,
        format,
    }) = cli.command
    {
        let report = export::export(&cfg.store, &out, device.as_deref(), format)?;
        tracing::info!(
            files = report.files.len(),
            samples = report.samples,
            out = %out.display(),
            "export finished",
        );
        return Ok(());
    }

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting sensorhub",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Start the agent.
    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown.
    agent.stop().await?;

    tracing::info!("sensorhub stopped");

    Ok(())
}
