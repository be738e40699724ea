//! Narrow contracts for the collaborators the pipeline calls into
//!
//! The pipeline never implements guest repair, format conversion, boot
//! validation or hypervisor discovery itself. It resolves an implementation
//! from a [`CollaboratorRegistry`] by disk format and hands it a request plus
//! an [`ExecContext`] carrying the stage deadline and the shutdown signal.

use crate::pipeline::DiskJob;
use crate::shutdown::SharedShutdown;
use crate::util::ProcessError;
use crate::DiskFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub mod command;
pub mod discovery;

pub use command::{CommandFixer, CommandValidator, QemuImgConverter};
pub use discovery::{LocalDiscovery, ManifestDiscovery};

/// Errors returned by collaborators
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    /// The collaborator ran and reported failure
    #[error("{collaborator} failed: {message}")]
    Failed {
        /// Collaborator name
        collaborator: String,
        /// What went wrong
        message: String,
    },

    /// No registered collaborator handles this format
    #[error("no {role} supports {format} disks")]
    Unsupported {
        /// Collaborator role ("fixer", "converter", "validator")
        role: &'static str,
        /// Format that was asked for
        format: DiskFormat,
    },

    /// Running an external program failed
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// Discovery input is malformed
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// IO error
    #[error("IO error on {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

impl CollaboratorError {
    /// Build a `Failed` error
    pub fn failed(collaborator: impl Into<String>, message: impl Into<String>) -> Self {
        CollaboratorError::Failed {
            collaborator: collaborator.into(),
            message: message.into(),
        }
    }

    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        CollaboratorError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Per-call context: who the call is for, when it must finish, and how to stop it
#[derive(Debug, Clone)]
pub struct ExecContext {
    /// Batch identifier
    pub job_id: String,
    /// Disk identifier
    pub disk_id: String,
    /// The job's private work directory
    pub work_dir: PathBuf,
    /// Stage deadline
    pub deadline: Option<Instant>,
    /// Cooperative stop signal
    pub shutdown: SharedShutdown,
}

impl ExecContext {
    /// Time left before the deadline, if one is set
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

/// Partition table detected on a raw image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionTable {
    /// Classic DOS/MBR table
    Mbr,
    /// GUID partition table
    Gpt,
}

/// Facts gathered by INSPECT and consumed by guest repair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestFacts {
    /// Image the facts describe
    pub image_path: PathBuf,
    /// Detected container format
    pub format: DiskFormat,
    /// Size of the image file
    pub file_size_bytes: u64,
    /// Virtual disk size when the header exposes it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtual_size_bytes: Option<u64>,
    /// Backing file reference (snapshot chains)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backing_file: Option<String>,
    /// Partition table found in the first sectors (raw images only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_table: Option<PartitionTable>,
}

/// Guest repair outcome
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixReport {
    /// Whether the image was modified
    pub changed: bool,
    /// Non-fatal findings
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Conversion options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertOptions {
    /// Format of the input image
    pub source_format: DiskFormat,
    /// Request a compressed output where the format allows it
    #[serde(default)]
    pub compress: bool,
}

/// Conversion outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertResult {
    /// Produced image
    pub output_path: PathBuf,
    /// Size of the produced image
    pub size_bytes: u64,
}

/// Firmware used for a boot test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    /// Legacy BIOS
    #[default]
    Bios,
    /// UEFI
    Uefi,
}

/// How to boot-test a converted image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootProfile {
    /// Firmware type
    pub firmware: Firmware,
    /// Guest memory in MiB
    pub memory_mb: u32,
    /// Time allowed for the guest to come up
    pub boot_timeout: Duration,
}

impl Default for BootProfile {
    fn default() -> Self {
        Self {
            firmware: Firmware::Bios,
            memory_mb: 1024,
            boot_timeout: Duration::from_secs(300),
        }
    }
}

/// Boot test outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Whether the guest booted
    pub booted: bool,
    /// Human-readable detail
    pub detail: String,
}

/// Guest repair (FIX stage)
pub trait GuestFixer: Send + Sync {
    /// Name for logs and errors
    fn name(&self) -> &str;

    /// Whether this fixer handles images of `format`
    fn supports(&self, format: DiskFormat) -> bool;

    /// Repair the guest in `disk_path`, modifying it in place
    fn fix(&self, disk_path: &Path, facts: &GuestFacts, ctx: &ExecContext) -> Result<FixReport, CollaboratorError>;
}

/// Format conversion (CONVERT stage, and FLATTEN for snapshot chains)
pub trait FormatConverter: Send + Sync {
    /// Name for logs and errors
    fn name(&self) -> &str;

    /// Whether this converter reads images of `format`
    fn supports(&self, format: DiskFormat) -> bool;

    /// Convert `src_path` into `dst_path` in `target_format`
    fn convert(
        &self,
        src_path: &Path,
        dst_path: &Path,
        target_format: DiskFormat,
        options: &ConvertOptions,
        ctx: &ExecContext,
    ) -> Result<ConvertResult, CollaboratorError>;
}

/// Boot validation (VALIDATE stage)
pub trait BootValidator: Send + Sync {
    /// Name for logs and errors
    fn name(&self) -> &str;

    /// Whether this validator can boot images of `format`
    fn supports(&self, format: DiskFormat) -> bool;

    /// Boot-test `image_path`; a guest that does not boot is `Ok` with `booted == false`
    fn validate(
        &self,
        image_path: &Path,
        profile: &BootProfile,
        ctx: &ExecContext,
    ) -> Result<ValidationResult, CollaboratorError>;
}

/// Produces the job list for a batch
pub trait Discovery: Send + Sync {
    /// Name for logs
    fn name(&self) -> &str;

    /// Batch identifier to use when the caller gives none
    fn default_job_id(&self) -> String;

    /// List the batch's disks; each gets a unique work dir under `work_root`
    fn discover(&self, job_id: &str, work_root: &Path) -> Result<Vec<DiskJob>, CollaboratorError>;
}

/// Lookup table of collaborators, resolved by disk format
#[derive(Clone, Default)]
pub struct CollaboratorRegistry {
    fixers: Vec<Arc<dyn GuestFixer>>,
    converters: Vec<Arc<dyn FormatConverter>>,
    validators: Vec<Arc<dyn BootValidator>>,
}

impl CollaboratorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a guest fixer
    pub fn with_fixer(mut self, fixer: Arc<dyn GuestFixer>) -> Self {
        self.fixers.push(fixer);
        self
    }

    /// Add a format converter
    pub fn with_converter(mut self, converter: Arc<dyn FormatConverter>) -> Self {
        self.converters.push(converter);
        self
    }

    /// Add a boot validator
    pub fn with_validator(mut self, validator: Arc<dyn BootValidator>) -> Self {
        self.validators.push(validator);
        self
    }

    /// First fixer supporting `format`
    pub fn fixer_for(&self, format: DiskFormat) -> Result<Arc<dyn GuestFixer>, CollaboratorError> {
        self.fixers
            .iter()
            .find(|f| f.supports(format))
            .cloned()
            .ok_or(CollaboratorError::Unsupported {
                role: "fixer",
                format,
            })
    }

    /// First converter supporting `format`
    pub fn converter_for(&self, format: DiskFormat) -> Result<Arc<dyn FormatConverter>, CollaboratorError> {
        self.converters
            .iter()
            .find(|c| c.supports(format))
            .cloned()
            .ok_or(CollaboratorError::Unsupported {
                role: "converter",
                format,
            })
    }

    /// First validator supporting `format`
    pub fn validator_for(&self, format: DiskFormat) -> Result<Arc<dyn BootValidator>, CollaboratorError> {
        self.validators
            .iter()
            .find(|v| v.supports(format))
            .cloned()
            .ok_or(CollaboratorError::Unsupported {
                role: "validator",
                format,
            })
    }
}

impl std::fmt::Debug for CollaboratorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = |items: Vec<&str>| items.join(", ");
        f.debug_struct("CollaboratorRegistry")
            .field("fixers", &names(self.fixers.iter().map(|x| x.name()).collect()))
            .field("converters", &names(self.converters.iter().map(|x| x.name()).collect()))
            .field("validators", &names(self.validators.iter().map(|x| x.name()).collect()))
            .finish()
    }
}
