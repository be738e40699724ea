//! `run` command: discover disks and drive them through the pipeline

use super::{BarObserver, Cli, CliError, OutputFormat};
use crate::collaborators::{
    BootProfile, CollaboratorRegistry, CommandFixer, CommandValidator, Discovery, Firmware, LocalDiscovery,
    ManifestDiscovery, QemuImgConverter,
};
use crate::pipeline::config::HARD_CAP;
use crate::pipeline::{Orchestrator, PipelineConfig, PipelineReport};
use crate::shutdown::SharedShutdown;
use crate::{DiskFormat, Stage};
use clap::{Parser, ValueEnum};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Parse and validate the worker count
fn parse_workers(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;

    if value == 0 {
        return Err("max-workers must be at least 1".to_string());
    }
    if value > HARD_CAP {
        return Err(format!("max-workers {value} exceeds maximum of {HARD_CAP}"));
    }
    Ok(value)
}

/// Firmware for boot tests
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FirmwareArg {
    /// Legacy BIOS
    Bios,
    /// UEFI
    Uefi,
}

impl From<FirmwareArg> for Firmware {
    fn from(arg: FirmwareArg) -> Self {
        match arg {
            FirmwareArg::Bios => Firmware::Bios,
            FirmwareArg::Uefi => Firmware::Uefi,
        }
    }
}

/// Arguments for `run`
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Manifest (.json), a disk image, or a directory of disk images
    pub source: PathBuf,

    /// Batch identifier; defaults to the manifest's job_id or the source's file stem
    #[arg(long)]
    pub job_id: Option<String>,

    /// Number of disks processed concurrently (default: 4, max: 32)
    #[arg(long, default_value = "4", value_parser = parse_workers)]
    pub max_workers: usize,

    /// Comma-separated stages to run (default: every stage whose tools are configured)
    #[arg(long, value_delimiter = ',')]
    pub stages: Option<Vec<Stage>>,

    /// Stages to leave out, comma-separated
    #[arg(long = "skip-stage", value_delimiter = ',')]
    pub skip_stages: Vec<Stage>,

    /// Report what would run without touching any disk
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Maximum transfer retries per disk (default: 5, range: 0-20)
    #[arg(long, default_value = "5", value_parser = clap::value_parser!(u32).range(0..=20))]
    pub max_retries: u32,

    /// Format produced by CONVERT
    #[arg(long, default_value = "qcow2")]
    pub target_format: DiskFormat,

    /// Guest repair program; FIX runs only when this is set
    #[arg(long)]
    pub fixer: Option<PathBuf>,

    /// Extra argument for the repair program (repeatable)
    #[arg(long = "fixer-arg", allow_hyphen_values = true)]
    pub fixer_args: Vec<String>,

    /// Boot test program; VALIDATE runs only when this is set
    #[arg(long)]
    pub validator: Option<PathBuf>,

    /// Extra argument for the boot test program (repeatable)
    #[arg(long = "validator-arg", allow_hyphen_values = true)]
    pub validator_args: Vec<String>,

    /// `qemu-img` binary used for flattening and conversion
    #[arg(long, default_value = "qemu-img")]
    pub qemu_img: PathBuf,

    /// Firmware for the boot test
    #[arg(long, value_enum, default_value_t = FirmwareArg::Bios)]
    pub firmware: FirmwareArg,

    /// Guest memory for the boot test, in MiB
    #[arg(long, default_value_t = 1024)]
    pub memory_mb: u32,

    /// Seconds a guest may take to boot
    #[arg(long, default_value_t = 300)]
    pub boot_timeout_secs: u64,

    /// Per-stage timeout in seconds; 0 disables it (default: 6 hours)
    #[arg(long)]
    pub stage_timeout_secs: Option<u64>,

    /// Discard partial downloads instead of continuing them
    #[arg(long, default_value_t = false)]
    pub no_resume: bool,

    /// Skip looking up source-published checksums
    #[arg(long, default_value_t = false)]
    pub no_verify_checksums: bool,

    /// Disable progress bars
    #[arg(long, default_value_t = false)]
    pub no_progress: bool,
}

impl RunArgs {
    /// Stages this invocation enables
    ///
    /// FIX and VALIDATE need an external program, so they are only on by
    /// default when one is configured, and asking for them without one is an error.
    pub fn enabled_stages(&self) -> Result<BTreeSet<Stage>, CliError> {
        let mut stages: BTreeSet<Stage> = match &self.stages {
            Some(requested) => {
                if requested.contains(&Stage::Fix) && self.fixer.is_none() {
                    return Err(CliError::InvalidArgument("FIX requires --fixer".to_string()));
                }
                if requested.contains(&Stage::Validate) && self.validator.is_none() {
                    return Err(CliError::InvalidArgument(
                        "VALIDATE requires --validator".to_string(),
                    ));
                }
                requested.iter().copied().collect()
            }
            None => Stage::ALL
                .into_iter()
                .filter(|stage| match stage {
                    Stage::Fix => self.fixer.is_some(),
                    Stage::Validate => self.validator.is_some(),
                    _ => true,
                })
                .collect(),
        };
        for stage in &self.skip_stages {
            stages.remove(stage);
        }
        if stages.is_empty() {
            return Err(CliError::InvalidArgument("no stages left to run".to_string()));
        }
        Ok(stages)
    }

    /// Pipeline configuration for this invocation
    pub fn pipeline_config(&self, cli: &Cli) -> Result<PipelineConfig, CliError> {
        let stage_timeout = match self.stage_timeout_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(crate::pipeline::config::DEFAULT_STAGE_TIMEOUT),
        };
        Ok(PipelineConfig::new(&cli.store, &cli.work_root)
            .with_max_workers(self.max_workers)
            .with_enabled_stages(self.enabled_stages()?)
            .with_dry_run(self.dry_run)
            .with_transfer_retry_limit(self.max_retries)
            .with_target_format(self.target_format)
            .with_boot_profile(BootProfile {
                firmware: self.firmware.into(),
                memory_mb: self.memory_mb,
                boot_timeout: Duration::from_secs(self.boot_timeout_secs),
            })
            .with_stage_timeout(stage_timeout)
            .with_resume_transfers(!self.no_resume)
            .with_verify_checksums(!self.no_verify_checksums))
    }

    /// External tools for FLATTEN, FIX, CONVERT and VALIDATE
    pub fn collaborators(&self) -> CollaboratorRegistry {
        let mut registry =
            CollaboratorRegistry::new().with_converter(Arc::new(QemuImgConverter::new(&self.qemu_img)));
        if let Some(fixer) = &self.fixer {
            registry = registry.with_fixer(Arc::new(
                CommandFixer::new(fixer).with_args(self.fixer_args.clone()),
            ));
        }
        if let Some(validator) = &self.validator {
            registry = registry.with_validator(Arc::new(
                CommandValidator::new(validator).with_args(self.validator_args.clone()),
            ));
        }
        registry
    }

    fn discovery(&self) -> Box<dyn Discovery> {
        if is_manifest(&self.source) {
            Box::new(ManifestDiscovery::new(&self.source))
        } else {
            Box::new(LocalDiscovery::new(&self.source))
        }
    }

    /// Discover the batch, run it and print the report
    pub fn execute(&self, cli: &Cli, shutdown: SharedShutdown) -> Result<PipelineReport, CliError> {
        let config = self.pipeline_config(cli)?;
        let discovery = self.discovery();
        let job_id = self
            .job_id
            .clone()
            .unwrap_or_else(|| discovery.default_job_id());
        let jobs = discovery.discover(&job_id, &cli.work_root)?;
        info!(
            job_id = %job_id,
            discovery = discovery.name(),
            disks = jobs.len(),
            stages = ?config.stages(),
            dry_run = config.dry_run,
            "Starting run"
        );

        let mut orchestrator = Orchestrator::new(config, self.collaborators(), shutdown);
        if !self.no_progress && !self.dry_run && cli.output_format == OutputFormat::Human {
            orchestrator = orchestrator.with_observer(Arc::new(BarObserver::new()));
        }
        let report = orchestrator.run(jobs)?;

        match cli.output_format {
            OutputFormat::Json => println!("{}", report.to_json()?),
            OutputFormat::Human => println!("{}", report.render_human()),
        }
        Ok(report)
    }
}

fn is_manifest(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}
