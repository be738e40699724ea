//! Main entry point for the vdisk-migrator CLI

use anyhow::Context;
use clap::Parser;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;
use vdisk_migrator::cli::{Cli, Commands};
use vdisk_migrator::metrics;
use vdisk_migrator::shutdown::ShutdownCoordinator;

/// Exit code when the command itself could not run
const EXIT_ERROR: i32 = 2;

/// Initialize tracing subscriber with optional JSON formatting
fn init_tracing() {
    let json_format = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vdisk_migrator=info"));

    // Logs go to stderr so stdout stays a clean report
    if json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();

    if let Some(addr) = cli.metrics_addr {
        if let Err(e) = metrics::init_metrics(addr).await {
            warn!(%addr, error = %e, "Metrics exporter unavailable; continuing without it");
        }
    }

    let shutdown = ShutdownCoordinator::shared();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl+C received - finishing in-flight chunks and saving checkpoints...");
                shutdown.request_shutdown();
            }
        }
    });

    // Stage work is blocking; keep it off the async runtime
    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<i32> {
        match &cli.command {
            Commands::Run(args) => {
                let report = args.execute(&cli, shutdown).context("run failed")?;
                Ok(report.exit_code())
            }
            Commands::Status(args) => args.execute(&cli).context("status failed").map(|_| 0),
            Commands::Verify(args) => args.execute(&cli).context("verify failed").map(|_| 0),
            Commands::Reset(args) => args.execute(&cli).context("reset failed").map(|_| 0),
        }
    })
    .await
    .context("command task panicked");

    let code = match result {
        Ok(Ok(code)) => code,
        Ok(Err(e)) | Err(e) => {
            error!("Command failed: {e:#}");
            EXIT_ERROR
        }
    };
    std::process::exit(code);
}
