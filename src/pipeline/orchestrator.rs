//! Batch orchestration

use super::config::PipelineConfig;
use super::job::{DiskJob, JobStatus};
use super::pool::WorkerPool;
use super::processor::DiskProcessor;
use super::progress::ProgressObserver;
use super::report::{JobOutcome, JobResult, PipelineReport, StageDisposition, StageReport};
use super::PipelineError;
use crate::collaborators::CollaboratorRegistry;
use crate::metrics;
use crate::recovery::manager::validate_key_component;
use crate::recovery::RecoveryManager;
use crate::shutdown::{SharedShutdown, ShutdownCoordinator};
use crate::transfer::{ResumableTransfer, SourceRegistry};
use crate::Stage;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, info_span, warn};

/// Drives a batch of jobs to completion and aggregates the report
///
/// # Examples
///
/// ```no_run
/// use std::path::Path;
/// use vdisk_migrator::collaborators::CollaboratorRegistry;
/// use vdisk_migrator::pipeline::{DiskJob, Orchestrator, PipelineConfig};
/// use vdisk_migrator::shutdown::ShutdownCoordinator;
/// use vdisk_migrator::Stage;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = PipelineConfig::new("/var/lib/vdisk/recovery", "/var/lib/vdisk/work")
///     .with_enabled_stages([Stage::Fetch, Stage::Flatten, Stage::Inspect])
///     .with_max_workers(2);
/// let jobs = vec![
///     DiskJob::new("wave-1", "/exports/web01.vmdk", Path::new("/var/lib/vdisk/work"))?,
///     DiskJob::new("wave-1", "/exports/db01.vmdk", Path::new("/var/lib/vdisk/work"))?,
/// ];
/// let report = Orchestrator::new(config, CollaboratorRegistry::default(), ShutdownCoordinator::shared())
///     .run(jobs)?;
/// std::process::exit(report.exit_code());
/// # }
/// ```
pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    collaborators: Arc<CollaboratorRegistry>,
    sources: Option<Arc<SourceRegistry>>,
    shutdown: SharedShutdown,
    observer: Option<Arc<dyn ProgressObserver>>,
}

impl Orchestrator {
    /// Create an orchestrator; transfer sources default to the built-in file and HTTP sources
    pub fn new(config: PipelineConfig, collaborators: CollaboratorRegistry, shutdown: SharedShutdown) -> Self {
        Self {
            config: Arc::new(config),
            collaborators: Arc::new(collaborators),
            sources: None,
            shutdown,
            observer: None,
        }
    }

    /// Use a custom transfer source registry
    pub fn with_sources(mut self, sources: SourceRegistry) -> Self {
        self.sources = Some(Arc::new(sources));
        self
    }

    /// Attach a progress observer
    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Configuration in use
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run a batch, consuming the job list
    pub fn run(&self, mut jobs: Vec<DiskJob>) -> Result<PipelineReport, PipelineError> {
        self.run_jobs(&mut jobs)
    }

    /// Run a batch, leaving each job's terminal status on the job
    ///
    /// # Errors
    ///
    /// Only batch-fatal problems are errors: invalid configuration, duplicate
    /// or malformed jobs, and an unusable recovery store. Nothing has executed
    /// when one of these is returned. Every per-job failure is in the report.
    pub fn run_jobs(&self, jobs: &mut [DiskJob]) -> Result<PipelineReport, PipelineError> {
        let started = Instant::now();
        let total = jobs.len();
        self.config.validate().map_err(PipelineError::InvalidConfig)?;
        validate_batch(jobs)?;

        let span = info_span!("pipeline_run", jobs = total, dry_run = self.config.dry_run);
        let _enter = span.enter();

        if self.config.dry_run {
            return self.plan(jobs, started);
        }

        let recovery = Arc::new(RecoveryManager::open(&self.config.recovery_store_path)?);
        let sources = match &self.sources {
            Some(sources) => sources.clone(),
            None => Arc::new(SourceRegistry::with_defaults(&self.config.transfer_config())?),
        };
        let transfer = ResumableTransfer::new(sources, self.config.transfer_config(), self.shutdown.clone());
        let processor = DiskProcessor::new(
            self.config.clone(),
            recovery.clone(),
            self.collaborators.clone(),
            transfer,
            self.shutdown.clone(),
        )
        .with_observer(self.observer.clone());

        let mut results: Vec<Option<JobResult>> = vec![None; total];
        let mut pending = Vec::new();
        for (index, job) in jobs.iter_mut().enumerate() {
            if processor.is_fully_complete(job) {
                info!(job_id = %job.job_id, disk_id = %job.disk_id, "All enabled stages already complete; skipping job");
                job.status = JobStatus::Skipped;
                metrics::record_job_outcome("skipped");
                results[index] = Some(self.skipped_result(&recovery, job));
            } else {
                pending.push((index, job));
            }
        }

        let pool = WorkerPool::new(self.config.pool_size(pending.len()));
        info!(
            workers = pool.size(),
            pending = pending.len(),
            skipped = total - pending.len(),
            "Starting batch"
        );
        let indices: Vec<usize> = pending.iter().map(|(index, _)| *index).collect();
        let outcomes = pool.execute(pending, |(_, job)| processor.process(job));

        for (index, outcome) in indices.into_iter().zip(outcomes) {
            let result = match outcome {
                Ok(result) => result,
                Err(e) => {
                    let job = &mut jobs[index];
                    let stage = self.config.stages().first().copied().unwrap_or(Stage::Fetch);
                    error!(job_id = %job.job_id, disk_id = %job.disk_id, error = %e, "Job aborted by worker failure");
                    job.status = JobStatus::Failed(stage);
                    JobResult::new(
                        job.job_id.clone(),
                        job.disk_id.clone(),
                        JobOutcome::Failed {
                            stage,
                            error: e.to_string(),
                        },
                    )
                }
            };
            results[index] = Some(result);
        }

        let report = PipelineReport {
            results: results.into_iter().flatten().collect(),
            peak_workers: pool.peak(),
            duration: started.elapsed(),
        };
        if self.shutdown.is_shutdown_requested() {
            warn!(cancelled = report.cancelled(), "Batch stopped by shutdown request");
        }
        info!(
            summary = %report.summary(),
            elapsed_ms = report.duration.as_millis() as u64,
            peak_workers = report.peak_workers,
            "Batch finished"
        );
        Ok(report)
    }

    /// Result for a job whose every enabled stage is already complete
    fn skipped_result(&self, recovery: &RecoveryManager, job: &DiskJob) -> JobResult {
        let mut result = JobResult::new(job.job_id.clone(), job.disk_id.clone(), JobOutcome::Skipped);
        for stage in Stage::ALL {
            if !self.config.is_enabled(stage) {
                result.stages.push(report_entry(stage, StageDisposition::Disabled, None));
                continue;
            }
            let output = recovery.completed_output(&job.job_id, &job.disk_id, stage);
            if stage.produces_image() && output.is_some() {
                result.final_artifact = output.clone();
            }
            result.last_stage = Some(stage);
            result.stages.push(report_entry(stage, StageDisposition::Skipped, output));
        }
        result
    }

    /// Dry run: report what would execute without side effects
    ///
    /// An existing store is consulted read-only; a missing store is not created.
    fn plan(&self, jobs: &mut [DiskJob], started: Instant) -> Result<PipelineReport, PipelineError> {
        let recovery = if self.config.recovery_store_path.exists() {
            Some(RecoveryManager::open_read_only(&self.config.recovery_store_path)?)
        } else {
            None
        };

        let mut results = Vec::with_capacity(jobs.len());
        for job in jobs.iter_mut() {
            let mut result = JobResult::new(
                job.job_id.clone(),
                job.disk_id.clone(),
                JobOutcome::Planned { stages: Vec::new() },
            );
            let mut would_run = Vec::new();
            for stage in Stage::ALL {
                if !self.config.is_enabled(stage) {
                    result.stages.push(report_entry(stage, StageDisposition::Disabled, None));
                    continue;
                }
                // Once one stage would run, every later stage runs too
                let done = if would_run.is_empty() {
                    recovery
                        .as_ref()
                        .and_then(|r| r.completed_output(&job.job_id, &job.disk_id, stage))
                } else {
                    None
                };
                match done {
                    Some(output) => {
                        result.stages.push(report_entry(stage, StageDisposition::Skipped, Some(output)));
                    }
                    None => {
                        would_run.push(stage);
                        result.stages.push(report_entry(stage, StageDisposition::Planned, None));
                    }
                }
            }
            info!(
                job_id = %job.job_id,
                disk_id = %job.disk_id,
                stages = ?would_run,
                "Planned"
            );
            result.last_stage = would_run.last().copied();
            result.outcome = JobOutcome::Planned { stages: would_run };
            job.status = JobStatus::Planned;
            results.push(result);
        }

        let report = PipelineReport {
            results,
            peak_workers: 0,
            duration: started.elapsed(),
        };
        info!(summary = %report.summary(), "Dry run finished");
        Ok(report)
    }
}

fn report_entry(stage: Stage, disposition: StageDisposition, output: Option<std::path::PathBuf>) -> StageReport {
    StageReport {
        stage,
        disposition,
        output,
        duration_ms: 0,
    }
}

/// Reject batches that would make two jobs share a resume key or a work directory
fn validate_batch(jobs: &[DiskJob]) -> Result<(), PipelineError> {
    let mut keys = HashSet::new();
    let mut work_dirs = HashSet::new();
    for job in jobs {
        for component in [&job.job_id, &job.disk_id] {
            validate_key_component(component).map_err(|e| PipelineError::InvalidJob {
                disk_id: job.disk_id.clone(),
                reason: e.to_string(),
            })?;
        }
        if !keys.insert((job.job_id.as_str(), job.disk_id.as_str())) {
            return Err(PipelineError::DuplicateJob(format!(
                "{}/{} appears more than once",
                job.job_id, job.disk_id
            )));
        }
        if !work_dirs.insert(job.work_dir.as_path()) {
            return Err(PipelineError::DuplicateJob(format!(
                "work dir {} is shared by more than one job",
                job.work_dir.display()
            )));
        }
    }
    Ok(())
}

/// Run a batch with default transfer sources and no external collaborators
///
/// Suitable for FETCH, FLATTEN and INSPECT; FIX, CONVERT and VALIDATE need
/// collaborators, so enable them through [`Orchestrator`] instead.
pub fn submit(jobs: Vec<DiskJob>, config: PipelineConfig) -> Result<PipelineReport, PipelineError> {
    Orchestrator::new(config, CollaboratorRegistry::default(), ShutdownCoordinator::shared()).run(jobs)
}
