//! Per-disk stage sequencing

use super::config::PipelineConfig;
use super::job::{DiskJob, JobStatus};
use super::pool::panic_message;
use super::progress::ProgressObserver;
use super::report::{JobOutcome, JobResult, StageDisposition, StageReport};
use super::stages::{Artifacts, StageRunner};
use super::StageError;
use crate::collaborators::CollaboratorRegistry;
use crate::metrics::{self, JobInProgressGuard, StageMetrics};
use crate::recovery::RecoveryManager;
use crate::shutdown::SharedShutdown;
use crate::transfer::ResumableTransfer;
use crate::Stage;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, info_span, warn};

/// Runs the fixed stage sequence for one job at a time
///
/// A completed checkpoint is only a hint: a stage is skipped when its record
/// says `completed`, the recorded output still exists and is non-empty, and
/// no earlier stage re-ran in this pass. Once any stage runs, every later
/// stage runs too, since its inputs changed.
pub struct DiskProcessor {
    config: Arc<PipelineConfig>,
    recovery: Arc<RecoveryManager>,
    collaborators: Arc<CollaboratorRegistry>,
    transfer: ResumableTransfer,
    shutdown: SharedShutdown,
    observer: Option<Arc<dyn ProgressObserver>>,
}

impl DiskProcessor {
    /// Create a processor sharing the run's recovery store and collaborators
    pub fn new(
        config: Arc<PipelineConfig>,
        recovery: Arc<RecoveryManager>,
        collaborators: Arc<CollaboratorRegistry>,
        transfer: ResumableTransfer,
        shutdown: SharedShutdown,
    ) -> Self {
        Self {
            config,
            recovery,
            collaborators,
            transfer,
            shutdown,
            observer: None,
        }
    }

    /// Attach a progress observer
    pub fn with_observer(mut self, observer: Option<Arc<dyn ProgressObserver>>) -> Self {
        self.observer = observer;
        self
    }

    /// Whether every enabled stage has a verified completed output
    pub fn is_fully_complete(&self, job: &DiskJob) -> bool {
        self.config
            .stages()
            .into_iter()
            .all(|stage| self.recovery.is_complete(&job.job_id, &job.disk_id, stage))
    }

    /// Drive one job through its enabled stages
    ///
    /// Never fails: every stage error ends up in the returned [`JobResult`].
    pub fn process(&self, job: &mut DiskJob) -> JobResult {
        let started = Instant::now();
        let span = info_span!("process_disk", job_id = %job.job_id, disk_id = %job.disk_id);
        let _enter = span.enter();
        let _in_progress = JobInProgressGuard::enter();

        if let Some(observer) = &self.observer {
            observer.job_started(&job.job_id, &job.disk_id);
        }

        let mut result = JobResult::new(job.job_id.clone(), job.disk_id.clone(), JobOutcome::Succeeded);
        match std::fs::create_dir_all(&job.work_dir) {
            Ok(()) => self.run_stages(job, &mut result),
            Err(e) => {
                let stage = self.config.stages().first().copied().unwrap_or(Stage::Fetch);
                let error = format!("cannot create work dir {}: {e}", job.work_dir.display());
                error!(error = %error, "Job failed before its first stage");
                result.outcome = JobOutcome::Failed { stage, error };
                result.last_stage = Some(stage);
            }
        }

        // Account for stages the job never reached
        for stage in Stage::ALL.into_iter().skip(result.stages.len()) {
            let disposition = if self.config.is_enabled(stage) {
                StageDisposition::NotRun
            } else {
                StageDisposition::Disabled
            };
            result.stages.push(stage_report(stage, disposition, None, Duration::ZERO));
        }

        if result.outcome == JobOutcome::Succeeded && result.ran_stages().is_empty() {
            result.outcome = JobOutcome::Skipped;
        }
        job.status = match &result.outcome {
            JobOutcome::Succeeded => JobStatus::Succeeded,
            JobOutcome::Skipped => JobStatus::Skipped,
            JobOutcome::Planned { .. } => JobStatus::Planned,
            JobOutcome::Failed { stage, .. } => JobStatus::Failed(*stage),
            JobOutcome::Cancelled { stage } => JobStatus::Cancelled(*stage),
        };
        result.duration = started.elapsed();

        metrics::record_job_outcome(result.outcome.label());
        info!(
            outcome = result.outcome.label(),
            status = %job.status,
            elapsed_ms = result.duration.as_millis() as u64,
            "Job finished"
        );
        if let Some(observer) = &self.observer {
            observer.job_finished(&result);
        }
        result
    }

    fn run_stages(&self, job: &DiskJob, result: &mut JobResult) {
        let runner = StageRunner {
            job,
            config: &self.config,
            collaborators: &self.collaborators,
            transfer: &self.transfer,
            shutdown: &self.shutdown,
            observer: self.observer.as_deref(),
        };
        let (job_id, disk_id) = (job.job_id.as_str(), job.disk_id.as_str());
        let mut artifacts = Artifacts::default();
        let mut upstream_reran = false;

        for stage in Stage::ALL {
            if !self.config.is_enabled(stage) {
                // A disabled image stage may still have produced the latest image in an earlier run
                if stage.produces_image() && !upstream_reran {
                    if let Some(output) = self.recovery.completed_output(job_id, disk_id, stage) {
                        artifacts.image = Some(output);
                    }
                }
                result.stages.push(stage_report(stage, StageDisposition::Disabled, None, Duration::ZERO));
                continue;
            }
            result.last_stage = Some(stage);

            if self.shutdown.is_shutdown_requested() {
                info!(stage = %stage, "Shutdown requested; not starting stage");
                result.stages.push(stage_report(stage, StageDisposition::Cancelled, None, Duration::ZERO));
                result.outcome = JobOutcome::Cancelled { stage };
                break;
            }

            if !upstream_reran {
                if let Some(output) = self.recovery.completed_output(job_id, disk_id, stage) {
                    match runner.absorb(stage, &output, &mut artifacts) {
                        Ok(()) => {
                            info!(stage = %stage, output = %output.display(), "Stage already complete; skipping");
                            metrics::record_stage_skipped(stage);
                            result.stages.push(stage_report(
                                stage,
                                StageDisposition::Skipped,
                                Some(output),
                                Duration::ZERO,
                            ));
                            continue;
                        }
                        Err(reason) => {
                            warn!(stage = %stage, reason = %reason, "Completed output unusable; re-running stage");
                        }
                    }
                }
            }

            if let Some(observer) = &self.observer {
                observer.stage_started(job_id, disk_id, stage);
            }
            let stage_metrics = StageMetrics::start(stage);
            let outcome = self
                .recovery
                .begin(job_id, disk_id, stage)
                .map_err(StageError::from)
                .and_then(|_| {
                    panic::catch_unwind(AssertUnwindSafe(|| runner.run(stage, &mut artifacts)))
                        .unwrap_or_else(|payload| {
                            Err(StageError::Execution(format!(
                                "stage panicked: {}",
                                panic_message(payload.as_ref())
                            )))
                        })
                })
                .and_then(|output| {
                    self.recovery
                        .complete(job_id, disk_id, stage, &output)
                        .map(|_| output)
                        .map_err(StageError::from)
                });

            match outcome {
                Ok(output) => {
                    stage_metrics.record_success();
                    info!(
                        stage = %stage,
                        output = %output.display(),
                        elapsed_ms = stage_metrics.elapsed().as_millis() as u64,
                        "Stage completed"
                    );
                    result.stages.push(stage_report(
                        stage,
                        StageDisposition::Ran,
                        Some(output),
                        stage_metrics.elapsed(),
                    ));
                    upstream_reran = true;
                }
                Err(err) => {
                    stage_metrics.record_failure();
                    let summary = if err.is_cancelled() {
                        "cancelled".to_string()
                    } else {
                        err.to_string()
                    };
                    if let Err(record_err) = self.recovery.fail(job_id, disk_id, stage, &summary) {
                        error!(stage = %stage, error = %record_err, "Failed to record stage failure");
                    }

                    let disposition = if err.is_cancelled() {
                        warn!(stage = %stage, "Stage cancelled; partial artifacts kept for resume");
                        result.outcome = JobOutcome::Cancelled { stage };
                        StageDisposition::Cancelled
                    } else {
                        error!(stage = %stage, error = %summary, "Stage failed");
                        result.outcome = JobOutcome::Failed {
                            stage,
                            error: summary,
                        };
                        StageDisposition::Failed
                    };
                    result
                        .stages
                        .push(stage_report(stage, disposition, None, stage_metrics.elapsed()));
                    break;
                }
            }
        }

        if result.outcome == JobOutcome::Succeeded {
            result.final_artifact = artifacts.image;
        }
    }
}

fn stage_report(
    stage: Stage,
    disposition: StageDisposition,
    output: Option<PathBuf>,
    duration: Duration,
) -> StageReport {
    StageReport {
        stage,
        disposition,
        output,
        duration_ms: duration.as_millis() as u64,
    }
}
