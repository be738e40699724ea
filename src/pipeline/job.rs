//! Disk job model

use crate::locator::{LocatorError, SourceLocator};
use crate::{DiskFormat, Stage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Where a job currently is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "stage")]
pub enum JobStatus {
    /// Not yet processed in this run
    Pending,
    /// Every enabled stage completed
    Succeeded,
    /// The stage failed; later stages were not run
    Failed(Stage),
    /// Shutdown was honored at this stage
    Cancelled(Stage),
    /// Every enabled stage was already complete in the recovery store
    Skipped,
    /// Dry run: planned but not executed
    Planned,
}

impl JobStatus {
    /// Whether the job will not change state again in this run
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed(stage) => write!(f, "failed@{stage}"),
            JobStatus::Cancelled(stage) => write!(f, "cancelled@{stage}"),
            JobStatus::Skipped => write!(f, "skipped"),
            JobStatus::Planned => write!(f, "planned"),
        }
    }
}

/// One disk to migrate
///
/// `(job_id, disk_id)` is the resume key: the same pair across runs maps to
/// the same checkpoints and the same work directory.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use vdisk_migrator::pipeline::DiskJob;
/// use vdisk_migrator::DiskFormat;
///
/// let job = DiskJob::new("wave-1", "/exports/web01/disk0.vmdk", Path::new("/var/work")).unwrap();
/// assert_eq!(job.format_hint, DiskFormat::Vmdk);
/// assert!(job.work_dir.starts_with("/var/work/wave-1"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskJob {
    /// Batch identifier
    pub job_id: String,
    /// Stable disk identifier derived from the locator
    pub disk_id: String,
    /// Where the source artifact lives
    pub source_locator: SourceLocator,
    /// Expected source size, checked during FETCH
    pub declared_size_bytes: Option<u64>,
    /// Format guess; INSPECT replaces it with a sniffed format
    pub format_hint: DiskFormat,
    /// Expected SHA-256 of the source artifact
    pub expected_sha256: Option<String>,
    /// Private working directory, `<work_root>/<job_id>/<disk_id>`
    pub work_dir: PathBuf,
    /// Lifecycle state
    pub status: JobStatus,
}

impl DiskJob {
    /// Create a pending job for the disk at `locator`
    pub fn new(
        job_id: impl Into<String>,
        locator: &str,
        work_root: &Path,
    ) -> Result<Self, LocatorError> {
        let source_locator = SourceLocator::parse(locator)?;
        Ok(Self::from_locator(job_id, source_locator, work_root))
    }

    /// Create a pending job from an already-parsed locator
    pub fn from_locator(job_id: impl Into<String>, source_locator: SourceLocator, work_root: &Path) -> Self {
        let job_id = job_id.into();
        let disk_id = source_locator.disk_id();
        let format_hint = source_locator
            .file_name()
            .map(|name| DiskFormat::from_file_name(&name))
            .unwrap_or_default();
        let work_dir = work_root.join(&job_id).join(&disk_id);
        Self {
            job_id,
            disk_id,
            source_locator,
            declared_size_bytes: None,
            format_hint,
            expected_sha256: None,
            work_dir,
            status: JobStatus::Pending,
        }
    }

    /// Set the declared source size
    pub fn with_declared_size(mut self, size: Option<u64>) -> Self {
        self.declared_size_bytes = size;
        self
    }

    /// Set the expected source checksum (hex, case-insensitive)
    pub fn with_expected_sha256(mut self, sha256: Option<String>) -> Self {
        self.expected_sha256 = sha256.map(|s| s.trim().to_lowercase());
        self
    }

    /// Override the format guess
    pub fn with_format_hint(mut self, format: DiskFormat) -> Self {
        self.format_hint = format;
        self
    }

    /// Override the disk identifier; the work directory follows it
    pub fn with_disk_id(mut self, disk_id: impl Into<String>) -> Self {
        let disk_id = disk_id.into();
        if let Some(parent) = self.work_dir.parent() {
            self.work_dir = parent.join(&disk_id);
        }
        self.disk_id = disk_id;
        self
    }

    /// Override the work directory
    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    /// The resume key
    pub fn key(&self) -> (&str, &str) {
        (&self.job_id, &self.disk_id)
    }
}
