//! Pipeline configuration and constants

use crate::collaborators::BootProfile;
use crate::transfer::config::{DEFAULT_CHUNK_BYTES, DEFAULT_RETRY_LIMIT, INITIAL_BACKOFF_MS, MAX_BACKOFF_MS};
use crate::transfer::TransferConfig;
use crate::{DiskFormat, Stage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

/// Absolute ceiling on worker threads, whatever `max_workers` says.
pub const HARD_CAP: usize = 32;

/// Default worker count.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Default per-stage execution timeout (6 hours).
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

/// Immutable configuration for one orchestrator run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Upper bound on concurrent jobs (further bounded by [`HARD_CAP`] and the job count)
    pub max_workers: usize,
    /// Stages to run; order is always [`Stage::ALL`]
    pub enabled_stages: BTreeSet<Stage>,
    /// Plan only; no stage side effects
    pub dry_run: bool,
    /// Transfer retries after the first attempt
    pub transfer_retry_limit: u32,
    /// Transfer chunk size in bytes
    pub transfer_chunk_bytes: usize,
    /// First transfer backoff delay
    pub transfer_initial_backoff: Duration,
    /// Transfer backoff ceiling
    pub transfer_max_backoff: Duration,
    /// Recovery store directory
    pub recovery_store_path: PathBuf,
    /// Root under which each job gets `<job_id>/<disk_id>`
    pub work_root: PathBuf,
    /// Per-stage execution timeout
    pub stage_timeout: Option<Duration>,
    /// Format produced by CONVERT
    pub target_format: DiskFormat,
    /// Boot test settings for VALIDATE
    pub boot_profile: BootProfile,
    /// Continue kept `.part` files instead of starting over
    pub resume_transfers: bool,
    /// Look up source-published checksums when a job declares none
    pub verify_checksums: bool,
}

impl PipelineConfig {
    /// Configuration with defaults for everything but the two directories
    pub fn new(recovery_store_path: impl Into<PathBuf>, work_root: impl Into<PathBuf>) -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            enabled_stages: Stage::ALL.into_iter().collect(),
            dry_run: false,
            transfer_retry_limit: DEFAULT_RETRY_LIMIT,
            transfer_chunk_bytes: DEFAULT_CHUNK_BYTES,
            transfer_initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            transfer_max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
            recovery_store_path: recovery_store_path.into(),
            work_root: work_root.into(),
            stage_timeout: Some(DEFAULT_STAGE_TIMEOUT),
            target_format: DiskFormat::Qcow2,
            boot_profile: BootProfile::default(),
            resume_transfers: true,
            verify_checksums: true,
        }
    }

    /// Set the worker bound
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Set the enabled stages
    pub fn with_enabled_stages(mut self, stages: impl IntoIterator<Item = Stage>) -> Self {
        self.enabled_stages = stages.into_iter().collect();
        self
    }

    /// Set dry-run mode
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Set the transfer retry limit
    pub fn with_transfer_retry_limit(mut self, limit: u32) -> Self {
        self.transfer_retry_limit = limit;
        self
    }

    /// Set the transfer chunk size
    pub fn with_transfer_chunk_bytes(mut self, chunk_bytes: usize) -> Self {
        self.transfer_chunk_bytes = chunk_bytes;
        self
    }

    /// Set the transfer backoff bounds
    pub fn with_transfer_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.transfer_initial_backoff = initial;
        self.transfer_max_backoff = max;
        self
    }

    /// Set the per-stage timeout
    pub fn with_stage_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stage_timeout = timeout;
        self
    }

    /// Set the CONVERT target format
    pub fn with_target_format(mut self, format: DiskFormat) -> Self {
        self.target_format = format;
        self
    }

    /// Set the boot profile
    pub fn with_boot_profile(mut self, profile: BootProfile) -> Self {
        self.boot_profile = profile;
        self
    }

    /// Set transfer resume behaviour
    pub fn with_resume_transfers(mut self, resume: bool) -> Self {
        self.resume_transfers = resume;
        self
    }

    /// Set checksum lookup behaviour
    pub fn with_verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    /// Whether `stage` runs
    pub fn is_enabled(&self, stage: Stage) -> bool {
        self.enabled_stages.contains(&stage)
    }

    /// Enabled stages in pipeline order
    pub fn stages(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|s| self.is_enabled(*s))
            .collect()
    }

    /// Worker slots for a batch of `job_count`: `min(max_workers, HARD_CAP, job_count)`
    pub fn pool_size(&self, job_count: usize) -> usize {
        self.max_workers.min(HARD_CAP).min(job_count)
    }

    /// Transfer settings derived from this configuration
    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig::default()
            .with_retry_limit(self.transfer_retry_limit)
            .with_chunk_bytes(self.transfer_chunk_bytes)
            .with_backoff(self.transfer_initial_backoff, self.transfer_max_backoff)
            .with_verify_checksums(self.verify_checksums)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_workers == 0 {
            return Err("max_workers must be at least 1".to_string());
        }
        if self.enabled_stages.is_empty() {
            return Err("at least one stage must be enabled".to_string());
        }
        if self.stage_timeout.is_some_and(|t| t.is_zero()) {
            return Err("stage timeout must be greater than zero".to_string());
        }
        if self.target_format == DiskFormat::Unknown {
            return Err("target format must be a concrete disk format".to_string());
        }
        if self.recovery_store_path.as_os_str().is_empty() {
            return Err("recovery store path must not be empty".to_string());
        }
        self.transfer_config().validate()
    }
}
