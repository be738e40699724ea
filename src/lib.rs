//! # vdisk-migrator
//!
//! A resumable, checkpointed pipeline for migrating virtual machine disks from
//! heterogeneous hypervisor sources into a bootable target format.
//!
//! ## Features
//!
//! - **Fixed stage order**: every disk moves through `FETCH → FLATTEN → INSPECT → FIX → CONVERT → VALIDATE`
//! - **Resumable transfers**: byte-range resume from a `.part` file, bounded retries with exponential backoff
//! - **Crash-consistent checkpoints**: one atomically-written record per job, disk and stage
//! - **Bounded parallelism**: a fixed pool of OS threads, one disk per worker at a time
//! - **Failure isolation**: one disk failing never cancels its siblings
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::path::Path;
//! use vdisk_migrator::collaborators::CollaboratorRegistry;
//! use vdisk_migrator::pipeline::{DiskJob, Orchestrator, PipelineConfig};
//! use vdisk_migrator::shutdown::ShutdownCoordinator;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::new("./.recovery", "./work").with_max_workers(4);
//! let job = DiskJob::new("batch-1", "https://images.example.com/vm1.vmdk", Path::new("./work"))?;
//!
//! let orchestrator = Orchestrator::new(
//!     config,
//!     CollaboratorRegistry::default(),
//!     ShutdownCoordinator::shared(),
//! );
//! let report = orchestrator.run(vec![job])?;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`locator`] - Source locator parsing and stable disk identifiers
//! - [`transfer`] - Resumable transfer primitive and its source registry
//! - [`recovery`] - Checkpoint store used to skip completed stages on rerun
//! - [`pipeline`] - Per-disk processor, worker pool, orchestrator and report
//! - [`collaborators`] - Narrow contracts for discovery, guest repair, conversion and boot validation
//! - [`shutdown`] - Cooperative cancellation shared by every worker

#![warn(missing_docs)]
#![warn(clippy::all)]

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// CLI command implementations
pub mod cli;

/// External collaborator contracts and built-in adapters
pub mod collaborators;

/// Source locator parsing
pub mod locator;

/// Pipeline metrics
pub mod metrics;

/// Disk pipeline engine
pub mod pipeline;

/// Checkpoint persistence and recovery
pub mod recovery;

/// Cooperative shutdown coordination
pub mod shutdown;

/// Resumable transfers
pub mod transfer;

/// Small shared helpers
pub mod util;

// Re-export commonly used types
pub use locator::SourceLocator;
pub use pipeline::{submit, DiskJob, PipelineConfig, PipelineReport};

/// One phase of the per-disk pipeline.
///
/// The relative order is fixed; stages may be disabled per run but never reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Copy the source artifact into the job's work directory
    Fetch,
    /// Collapse snapshot chains into a standalone image
    Flatten,
    /// Collect facts about the image and guest
    Inspect,
    /// Repair the guest so it boots on the target hypervisor
    Fix,
    /// Convert to the target disk format
    Convert,
    /// Boot-test the converted image
    Validate,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 6] = [
        Stage::Fetch,
        Stage::Flatten,
        Stage::Inspect,
        Stage::Fix,
        Stage::Convert,
        Stage::Validate,
    ];

    /// Lowercase name, used for record file names and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Flatten => "flatten",
            Stage::Inspect => "inspect",
            Stage::Fix => "fix",
            Stage::Convert => "convert",
            Stage::Validate => "validate",
        }
    }

    /// Position in the pipeline (0-based).
    pub fn index(&self) -> usize {
        match self {
            Stage::Fetch => 0,
            Stage::Flatten => 1,
            Stage::Inspect => 2,
            Stage::Fix => 3,
            Stage::Convert => 4,
            Stage::Validate => 5,
        }
    }

    /// Whether the stage's output is a disk image that later stages consume.
    pub fn produces_image(&self) -> bool {
        matches!(self, Stage::Fetch | Stage::Flatten | Stage::Convert)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str().to_uppercase())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fetch" => Ok(Stage::Fetch),
            "flatten" => Ok(Stage::Flatten),
            "inspect" => Ok(Stage::Inspect),
            "fix" => Ok(Stage::Fix),
            "convert" => Ok(Stage::Convert),
            "validate" => Ok(Stage::Validate),
            _ => Err(format!(
                "Invalid stage: {s}. Valid options: fetch, flatten, inspect, fix, convert, validate"
            )),
        }
    }
}

/// On-disk image format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    /// Raw sector dump
    Raw,
    /// QEMU copy-on-write v2/v3
    Qcow2,
    /// VMware virtual disk
    Vmdk,
    /// Legacy Hyper-V / Virtual PC disk
    Vhd,
    /// Hyper-V disk
    Vhdx,
    /// VirtualBox disk
    Vdi,
    /// Not yet determined
    #[default]
    Unknown,
}

impl DiskFormat {
    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Raw => "raw",
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Vmdk => "vmdk",
            DiskFormat::Vhd => "vhd",
            DiskFormat::Vhdx => "vhdx",
            DiskFormat::Vdi => "vdi",
            DiskFormat::Unknown => "unknown",
        }
    }

    /// File extension used for artifacts of this format.
    pub fn extension(&self) -> &'static str {
        match self {
            DiskFormat::Raw | DiskFormat::Unknown => "img",
            other => other.as_str(),
        }
    }

    /// Guess the format from a file name's extension.
    pub fn from_file_name(name: &str) -> Self {
        let lower = name.to_lowercase();
        let ext = lower.rsplit('.').next().unwrap_or_default();
        match ext {
            "qcow2" | "qcow" => DiskFormat::Qcow2,
            "vmdk" => DiskFormat::Vmdk,
            "vhd" | "vpc" => DiskFormat::Vhd,
            "vhdx" => DiskFormat::Vhdx,
            "vdi" => DiskFormat::Vdi,
            "raw" | "img" | "dd" | "bin" => DiskFormat::Raw,
            _ => DiskFormat::Unknown,
        }
    }

    /// Name understood by `qemu-img -f/-O`.
    pub fn qemu_name(&self) -> &'static str {
        match self {
            DiskFormat::Vhd => "vpc",
            DiskFormat::Unknown => "raw",
            other => other.as_str(),
        }
    }
}

impl std::fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DiskFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "raw" | "img" => Ok(DiskFormat::Raw),
            "qcow2" => Ok(DiskFormat::Qcow2),
            "vmdk" => Ok(DiskFormat::Vmdk),
            "vhd" | "vpc" => Ok(DiskFormat::Vhd),
            "vhdx" => Ok(DiskFormat::Vhdx),
            "vdi" => Ok(DiskFormat::Vdi),
            "unknown" => Ok(DiskFormat::Unknown),
            _ => Err(format!("Invalid disk format: {s}")),
        }
    }
}
