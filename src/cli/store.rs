//! Recovery store commands: `status`, `verify` and `reset`

use super::{Cli, CliError, OutputFormat};
use crate::recovery::{Checkpoint, RecoveryManager};
use clap::Parser;
use serde_json::json;
use std::path::Path;
use tracing::info;

/// Arguments for `status`
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Batch to show; lists every known batch when omitted
    pub job_id: Option<String>,
}

/// Arguments for `verify`
#[derive(Parser, Debug)]
pub struct VerifyArgs {}

/// Arguments for `reset`
#[derive(Parser, Debug)]
pub struct ResetArgs {
    /// Batch whose checkpoints are removed
    pub job_id: String,

    /// Also delete the batch's working directories
    #[arg(long, default_value_t = false)]
    pub purge_work: bool,
}

/// Open the store only if it exists; the inspection commands never create one
fn open_existing(store: &Path, read_only: bool) -> Result<Option<RecoveryManager>, CliError> {
    if !store.exists() {
        println!("No recovery store at {}", store.display());
        return Ok(None);
    }
    let manager = if read_only {
        RecoveryManager::open_read_only(store)?
    } else {
        RecoveryManager::open(store)?
    };
    Ok(Some(manager))
}

fn record_line(cp: &Checkpoint) -> String {
    let detail = match (cp.output_path(), cp.error_summary()) {
        (_, Some(error)) => format!("error: {error}"),
        (Some(output), None) => output.display().to_string(),
        (None, None) => String::new(),
    };
    format!(
        "  {:<28} {:<9} {:<12} attempts={:<3} {}",
        cp.disk_id(),
        cp.stage(),
        cp.status(),
        cp.attempts(),
        detail
    )
}

impl StatusArgs {
    /// Print checkpoint state
    pub fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        let Some(manager) = open_existing(&cli.store, true)? else {
            return Ok(());
        };

        match &self.job_id {
            None => {
                let jobs = manager.job_ids()?;
                match cli.output_format {
                    OutputFormat::Json => println!("{}", json!({ "jobs": jobs })),
                    OutputFormat::Human => {
                        if jobs.is_empty() {
                            println!("No jobs recorded in {}", cli.store.display());
                        }
                        for job in jobs {
                            println!("{job}");
                        }
                    }
                }
            }
            Some(job_id) => {
                let records = manager.records_for_job(job_id)?;
                match cli.output_format {
                    OutputFormat::Json => println!(
                        "{}",
                        serde_json::to_string(&json!({ "job_id": job_id, "records": records }))?
                    ),
                    OutputFormat::Human => {
                        println!("Job {job_id}: {} record(s)", records.len());
                        for cp in &records {
                            println!("{}", record_line(cp));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl VerifyArgs {
    /// Check every record; an untrustworthy store is an error
    pub fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        let Some(manager) = open_existing(&cli.store, false)? else {
            return Ok(());
        };
        let report = manager.verify()?;

        match cli.output_format {
            OutputFormat::Json => println!(
                "{}",
                json!({
                    "valid": report.valid,
                    "stale": report.stale,
                    "invalid": report
                        .invalid
                        .iter()
                        .map(|(path, reason)| json!({ "path": path, "reason": reason }))
                        .collect::<Vec<_>>(),
                })
            ),
            OutputFormat::Human => {
                println!("Valid records: {}", report.valid);
                if report.stale > 0 {
                    println!(
                        "Stale records: {} (completed, output missing; those stages will re-run)",
                        report.stale
                    );
                }
                for (path, reason) in &report.invalid {
                    eprintln!("Invalid record {}: {reason}", path.display());
                }
            }
        }

        if report.is_clean() {
            Ok(())
        } else {
            Err(CliError::InvalidArgument(format!(
                "{} invalid record(s) in {}",
                report.invalid.len(),
                cli.store.display()
            )))
        }
    }
}

impl ResetArgs {
    /// Remove the batch's checkpoints and optionally its work directories
    pub fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        let removed = match open_existing(&cli.store, false)? {
            Some(manager) => manager.reset_job(&self.job_id)?,
            None => 0,
        };
        println!("Removed {removed} checkpoint record(s) for job {}", self.job_id);

        if self.purge_work {
            let work_dir = cli.work_root.join(&self.job_id);
            if work_dir.exists() {
                info!(path = %work_dir.display(), "Deleting job work directory");
                std::fs::remove_dir_all(&work_dir).map_err(|source| CliError::Io {
                    action: "failed to delete",
                    path: work_dir.display().to_string(),
                    source,
                })?;
                println!("Deleted {}", work_dir.display());
            }
        }
        Ok(())
    }
}
