//! Stage implementations
//!
//! Every stage reads the image produced by the latest image stage (FETCH,
//! FLATTEN or CONVERT) and writes exactly one output inside the job's work
//! directory. That output path is what the recovery store records.

use super::config::PipelineConfig;
use super::inspect::inspect_image;
use super::job::DiskJob;
use super::progress::{ProgressObserver, ProgressState};
use super::StageError;
use crate::collaborators::{CollaboratorRegistry, ConvertOptions, ExecContext, GuestFacts};
use crate::shutdown::SharedShutdown;
use crate::transfer::{ResumableTransfer, TransferProgress, TransferRequest};
use crate::util::{fsync_dir, write_atomic};
use crate::Stage;
use serde::Serialize;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Facts written by INSPECT
pub const INSPECT_FILE: &str = "inspect.json";
/// Report written by FIX
pub const FIX_REPORT_FILE: &str = "fix-report.json";
/// Result written by VALIDATE
pub const VALIDATION_FILE: &str = "validation.json";

/// What earlier stages of this run handed forward
#[derive(Debug, Default)]
pub(crate) struct Artifacts {
    /// Latest disk image
    pub image: Option<PathBuf>,
    /// Facts from INSPECT, tied to the image they describe
    pub facts: Option<GuestFacts>,
}

/// Everything a stage needs, borrowed from the processor
pub(crate) struct StageRunner<'a> {
    pub job: &'a DiskJob,
    pub config: &'a PipelineConfig,
    pub collaborators: &'a CollaboratorRegistry,
    pub transfer: &'a ResumableTransfer,
    pub shutdown: &'a SharedShutdown,
    pub observer: Option<&'a dyn ProgressObserver>,
}

impl StageRunner<'_> {
    /// Execute `stage` and return its output path
    pub fn run(&self, stage: Stage, artifacts: &mut Artifacts) -> Result<PathBuf, StageError> {
        let started = Instant::now();
        let deadline = self.config.stage_timeout.map(|timeout| started + timeout);
        let output = match stage {
            Stage::Fetch => self.fetch(started, deadline, artifacts),
            Stage::Flatten => self.flatten(started, deadline, artifacts),
            Stage::Inspect => self.inspect(artifacts),
            Stage::Fix => self.fix(started, deadline, artifacts),
            Stage::Convert => self.convert(started, deadline, artifacts),
            Stage::Validate => self.validate(started, deadline, artifacts),
        }?;

        // In-process collaborators are free to ignore the deadline in their context
        let overran = deadline.is_some_and(|d| Instant::now() > d);
        if overran && matches!(stage, Stage::Fix | Stage::Convert | Stage::Validate) {
            return Err(StageError::Timeout {
                stage,
                elapsed: started.elapsed(),
            });
        }
        Ok(output)
    }

    /// Take over the output of a stage completed in an earlier run
    ///
    /// An error means the output cannot be used and the stage must run again.
    pub fn absorb(&self, stage: Stage, output: &Path, artifacts: &mut Artifacts) -> Result<(), String> {
        match stage {
            Stage::Fetch | Stage::Flatten | Stage::Convert => {
                artifacts.image = Some(output.to_path_buf());
            }
            Stage::Inspect => {
                let bytes = std::fs::read(output).map_err(|e| e.to_string())?;
                let facts: GuestFacts = serde_json::from_slice(&bytes).map_err(|e| e.to_string())?;
                if !facts.image_path.is_file() {
                    return Err(format!(
                        "inspected image {} no longer exists",
                        facts.image_path.display()
                    ));
                }
                artifacts.facts = Some(facts);
            }
            Stage::Fix | Stage::Validate => {}
        }
        Ok(())
    }

    fn exec_context(&self, deadline: Option<Instant>) -> ExecContext {
        ExecContext {
            job_id: self.job.job_id.clone(),
            disk_id: self.job.disk_id.clone(),
            work_dir: self.job.work_dir.clone(),
            deadline,
            shutdown: self.shutdown.clone(),
        }
    }

    fn progress_state(&self, stage: Stage, total: Option<u64>) -> ProgressState {
        ProgressState::new(
            format!("{}/{} {stage}", self.job.job_id, self.job.disk_id),
            total,
        )
    }

    fn report_bytes(&self, stage: Stage, progress: &mut ProgressState, done: u64, total: Option<u64>) {
        progress.update_to(done, total);
        if progress.should_emit_update() {
            info!(
                job_id = %self.job.job_id,
                disk_id = %self.job.disk_id,
                "{}",
                progress.format_progress()
            );
            progress.mark_emitted();
        }
        if let Some(observer) = self.observer {
            observer.bytes(&self.job.job_id, &self.job.disk_id, stage, done, progress.total_bytes);
        }
    }

    /// Image the next stage works on: the latest image output, or a local source when nothing was fetched
    fn current_image(&self, artifacts: &Artifacts) -> Result<PathBuf, StageError> {
        if let Some(image) = &artifacts.image {
            return Ok(image.clone());
        }
        match self.job.source_locator.as_local_path() {
            Some(path) => Ok(path.to_path_buf()),
            None => Err(StageError::Execution(format!(
                "no local image: {} is remote and FETCH has not produced a copy",
                self.job.source_locator
            ))),
        }
    }

    fn facts_for(&self, image: &Path, artifacts: &Artifacts) -> Result<GuestFacts, StageError> {
        if let Some(facts) = artifacts.facts.as_ref().filter(|f| f.image_path == image) {
            return Ok(facts.clone());
        }
        let facts = inspect_image(image).map_err(|e| StageError::io(image, e))?;
        if facts.file_size_bytes == 0 {
            return Err(StageError::Execution(format!("image {} is empty", image.display())));
        }
        Ok(facts)
    }

    fn fetch(
        &self,
        started: Instant,
        deadline: Option<Instant>,
        artifacts: &mut Artifacts,
    ) -> Result<PathBuf, StageError> {
        let job = self.job;
        let destination = job
            .work_dir
            .join(format!("source.{}", job.format_hint.extension()));
        let request = TransferRequest::new(&job.source_locator, &destination)
            .with_resume(self.config.resume_transfers)
            .with_expected_len(job.declared_size_bytes)
            .with_expected_sha256(job.expected_sha256.as_deref())
            .with_deadline(deadline);

        let mut progress = self.progress_state(Stage::Fetch, job.declared_size_bytes);
        let result = self
            .transfer
            .fetch_with(request, &mut |p: &TransferProgress| {
                self.report_bytes(Stage::Fetch, &mut progress, p.bytes_so_far, p.total_bytes)
            })
            .map_err(|e| StageError::from_transfer(Stage::Fetch, started.elapsed(), e))?;

        info!(
            job_id = %job.job_id,
            disk_id = %job.disk_id,
            bytes = result.total_bytes,
            transferred = result.bytes_transferred,
            resumed_from = result.resumed_from,
            attempts = result.attempts,
            "Source fetched"
        );
        artifacts.image = Some(result.final_path.clone());
        Ok(result.final_path)
    }

    fn flatten(
        &self,
        started: Instant,
        deadline: Option<Instant>,
        artifacts: &mut Artifacts,
    ) -> Result<PathBuf, StageError> {
        let source = self.current_image(artifacts)?;
        let facts = self.facts_for(&source, artifacts)?;
        let destination = self
            .job
            .work_dir
            .join(format!("flat.{}", facts.format.extension()));

        let output = match &facts.backing_file {
            Some(backing) => {
                let converter = self.collaborators.converter_for(facts.format).map_err(|e| {
                    StageError::Execution(format!(
                        "cannot flatten {} onto backing file {backing}: {e}",
                        source.display()
                    ))
                })?;
                info!(
                    disk_id = %self.job.disk_id,
                    backing = %backing,
                    converter = converter.name(),
                    "Flattening snapshot chain"
                );
                let options = ConvertOptions {
                    source_format: facts.format,
                    compress: false,
                };
                converter
                    .convert(&source, &destination, facts.format, &options, &self.exec_context(deadline))
                    .map_err(|e| StageError::from_collaborator(Stage::Flatten, started.elapsed(), e))?
                    .output_path
            }
            None => {
                self.copy_image(&source, &destination, started, deadline)?;
                destination
            }
        };

        artifacts.image = Some(output.clone());
        Ok(output)
    }

    /// Chunked copy into a temp file in the work dir, renamed into place once complete
    fn copy_image(
        &self,
        source: &Path,
        destination: &Path,
        started: Instant,
        deadline: Option<Instant>,
    ) -> Result<(), StageError> {
        let work_dir = &self.job.work_dir;
        let mut reader = File::open(source).map_err(|e| StageError::io(source, e))?;
        let total = reader
            .metadata()
            .map_err(|e| StageError::io(source, e))?
            .len();
        let mut temp = tempfile::NamedTempFile::new_in(work_dir).map_err(|e| StageError::io(work_dir, e))?;

        let mut buffer = vec![0u8; self.config.transfer_chunk_bytes];
        let mut progress = self.progress_state(Stage::Flatten, Some(total));
        let mut copied = 0u64;
        loop {
            if self.shutdown.is_shutdown_requested() {
                return Err(StageError::Cancelled);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(StageError::Timeout {
                    stage: Stage::Flatten,
                    elapsed: started.elapsed(),
                });
            }
            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(StageError::io(source, e)),
            };
            temp.write_all(&buffer[..n])
                .map_err(|e| StageError::io(temp.path(), e))?;
            copied += n as u64;
            self.report_bytes(Stage::Flatten, &mut progress, copied, Some(total));
        }

        temp.as_file()
            .sync_all()
            .map_err(|e| StageError::io(temp.path(), e))?;
        temp.persist(destination)
            .map_err(|e| StageError::io(destination, e.error))?;
        fsync_dir(work_dir);
        debug!(bytes = copied, path = %destination.display(), "Image copied");
        Ok(())
    }

    fn inspect(&self, artifacts: &mut Artifacts) -> Result<PathBuf, StageError> {
        let image = self.current_image(artifacts)?;
        let facts = inspect_image(&image).map_err(|e| StageError::io(&image, e))?;
        if facts.file_size_bytes == 0 {
            return Err(StageError::Execution(format!("image {} is empty", image.display())));
        }
        if let Some(backing) = &facts.backing_file {
            warn!(disk_id = %self.job.disk_id, backing = %backing, "Image still depends on a backing file");
        }

        let output = self.job.work_dir.join(INSPECT_FILE);
        self.write_json(&output, &facts)?;
        info!(
            disk_id = %self.job.disk_id,
            format = %facts.format,
            virtual_size = ?facts.virtual_size_bytes,
            partition_table = ?facts.partition_table,
            "Image inspected"
        );
        artifacts.facts = Some(facts);
        Ok(output)
    }

    fn fix(
        &self,
        started: Instant,
        deadline: Option<Instant>,
        artifacts: &mut Artifacts,
    ) -> Result<PathBuf, StageError> {
        let image = self.current_image(artifacts)?;
        let facts = self.facts_for(&image, artifacts)?;
        let fixer = self
            .collaborators
            .fixer_for(facts.format)
            .map_err(|e| StageError::Execution(e.to_string()))?;

        if self.job.source_locator.as_local_path() == Some(image.as_path()) {
            warn!(path = %image.display(), "Repairing the source image in place");
        }

        let report = fixer
            .fix(&image, &facts, &self.exec_context(deadline))
            .map_err(|e| StageError::from_collaborator(Stage::Fix, started.elapsed(), e))?;
        for warning in &report.warnings {
            warn!(disk_id = %self.job.disk_id, fixer = fixer.name(), "{warning}");
        }

        let output = self.job.work_dir.join(FIX_REPORT_FILE);
        self.write_json(&output, &report)?;
        info!(disk_id = %self.job.disk_id, changed = report.changed, "Guest repaired");
        Ok(output)
    }

    fn convert(
        &self,
        started: Instant,
        deadline: Option<Instant>,
        artifacts: &mut Artifacts,
    ) -> Result<PathBuf, StageError> {
        let image = self.current_image(artifacts)?;
        let facts = self.facts_for(&image, artifacts)?;
        let target = self.config.target_format;
        let converter = self
            .collaborators
            .converter_for(facts.format)
            .map_err(|e| StageError::Execution(e.to_string()))?;

        let destination = self
            .job
            .work_dir
            .join(format!("converted.{}", target.extension()));
        let options = ConvertOptions {
            source_format: facts.format,
            compress: false,
        };
        let result = converter
            .convert(&image, &destination, target, &options, &self.exec_context(deadline))
            .map_err(|e| StageError::from_collaborator(Stage::Convert, started.elapsed(), e))?;

        let produced = std::fs::metadata(&result.output_path)
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false);
        if !produced {
            return Err(StageError::Execution(format!(
                "{} reported success but {} is missing or empty",
                converter.name(),
                result.output_path.display()
            )));
        }

        info!(
            disk_id = %self.job.disk_id,
            from = %facts.format,
            to = %target,
            size_bytes = result.size_bytes,
            "Image converted"
        );
        artifacts.image = Some(result.output_path.clone());
        Ok(result.output_path)
    }

    fn validate(
        &self,
        started: Instant,
        deadline: Option<Instant>,
        artifacts: &mut Artifacts,
    ) -> Result<PathBuf, StageError> {
        let image = self.current_image(artifacts)?;
        let facts = self.facts_for(&image, artifacts)?;
        let validator = self
            .collaborators
            .validator_for(facts.format)
            .map_err(|e| StageError::Execution(e.to_string()))?;

        let result = validator
            .validate(&image, &self.config.boot_profile, &self.exec_context(deadline))
            .map_err(|e| StageError::from_collaborator(Stage::Validate, started.elapsed(), e))?;

        let output = self.job.work_dir.join(VALIDATION_FILE);
        self.write_json(&output, &result)?;
        if !result.booted {
            return Err(StageError::Execution(format!(
                "guest did not boot: {}",
                result.detail
            )));
        }
        info!(disk_id = %self.job.disk_id, validator = validator.name(), "Boot validation passed");
        Ok(output)
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StageError> {
        let json = serde_json::to_vec_pretty(value)
            .map_err(|e| StageError::Execution(format!("cannot serialize {}: {e}", path.display())))?;
        write_atomic(path, &json).map_err(|e| StageError::io(path, e))
    }
}
