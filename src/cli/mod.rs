//! CLI command implementations

pub mod error;
pub mod progress;
pub mod run;
pub mod store;

pub use error::CliError;
pub use progress::BarObserver;
pub use run::RunArgs;
pub use store::{ResetArgs, StatusArgs, VerifyArgs};

use clap::{Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Default recovery store directory
pub const DEFAULT_STORE_DIR: &str = ".vdisk-recovery";

/// Default root for per-job working directories
pub const DEFAULT_WORK_ROOT: &str = "vdisk-work";

/// Virtual disk migration pipeline
#[derive(Parser, Debug)]
#[command(name = "vdisk-migrator")]
#[command(about = "Fetch, flatten, inspect, repair, convert and boot-test virtual machine disks", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Recovery store directory
    #[arg(long, global = true, default_value = DEFAULT_STORE_DIR)]
    pub store: PathBuf,

    /// Root directory for per-disk working directories
    #[arg(long, global = true, default_value = DEFAULT_WORK_ROOT)]
    pub work_root: PathBuf,

    /// Report format (human or json)
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Human)]
    pub output_format: OutputFormat,

    /// Serve Prometheus metrics on this address (e.g. 127.0.0.1:9000)
    #[arg(long, global = true)]
    pub metrics_addr: Option<SocketAddr>,
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pipeline over a manifest, an image file, or a directory of images
    Run(RunArgs),

    /// Show checkpoint state for one job or list known jobs
    Status(StatusArgs),

    /// Check every checkpoint record in the recovery store
    Verify(VerifyArgs),

    /// Forget all checkpoints of a job so the next run starts over
    Reset(ResetArgs),
}

/// Report output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output
    Json,
}
