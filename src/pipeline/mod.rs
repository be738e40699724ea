//! Disk pipeline engine
//!
//! [`Orchestrator`] validates a batch, opens the recovery store, and hands
//! jobs to a [`WorkerPool`]. Each worker runs a [`DiskProcessor`] for one job
//! at a time, walking the fixed stage order and recording every transition in
//! the recovery store. Failures are converted into a typed [`JobResult`] at
//! the processor boundary and never reach sibling jobs.

use crate::collaborators::CollaboratorError;
use crate::recovery::RecoveryError;
use crate::transfer::TransferError;
use crate::util::ProcessError;
use crate::Stage;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod config;
pub mod inspect;
pub mod job;
pub mod orchestrator;
pub mod pool;
pub mod processor;
pub mod progress;
pub mod report;
pub mod stages;

pub use config::PipelineConfig;
pub use job::{DiskJob, JobStatus};
pub use orchestrator::{submit, Orchestrator};
pub use pool::{PoolError, WorkerPool};
pub use processor::DiskProcessor;
pub use progress::{ProgressObserver, ProgressState};
pub use report::{JobOutcome, JobResult, PipelineReport, StageDisposition, StageReport};

/// Batch-fatal errors: nothing has been executed when one of these is returned
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The recovery store cannot be trusted or opened
    #[error("recovery store unusable: {0}")]
    Recovery(#[from] RecoveryError),

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Two jobs share a resume key or a work directory
    #[error("duplicate job: {0}")]
    DuplicateJob(String),

    /// A job's identifiers cannot be used as keys or directory names
    #[error("invalid job {disk_id}: {reason}")]
    InvalidJob {
        /// Offending disk
        disk_id: String,
        /// Why it was rejected
        reason: String,
    },

    /// Transfer sources could not be set up
    #[error("transfer setup failed: {0}")]
    Transfer(#[from] TransferError),
}

/// Failure of one stage of one job
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// FETCH failed permanently (retries exhausted or not retryable)
    #[error("transfer failed: {0}")]
    Transfer(TransferError),

    /// A collaborator or built-in stage reported failure
    #[error("{0}")]
    Execution(String),

    /// The stage exceeded its execution timeout
    #[error("{stage} timed out after {elapsed:?}")]
    Timeout {
        /// Stage that timed out
        stage: Stage,
        /// Time spent
        elapsed: Duration,
    },

    /// A cooperative stop was honored
    #[error("cancelled")]
    Cancelled,

    /// Writing a checkpoint failed
    #[error("checkpoint write failed: {0}")]
    Recovery(#[from] RecoveryError),

    /// Local I/O error
    #[error("IO error on {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

impl StageError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        StageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether the error is a honored stop request
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StageError::Cancelled)
    }

    /// Map a transfer error, keeping cancellation and deadlines distinct
    pub(crate) fn from_transfer(stage: Stage, elapsed: Duration, err: TransferError) -> Self {
        match err {
            TransferError::Cancelled => StageError::Cancelled,
            TransferError::DeadlineExceeded { .. } => StageError::Timeout { stage, elapsed },
            other => StageError::Transfer(other),
        }
    }

    /// Map a collaborator error, keeping cancellation and deadlines distinct
    pub(crate) fn from_collaborator(stage: Stage, elapsed: Duration, err: CollaboratorError) -> Self {
        match err {
            CollaboratorError::Process(ProcessError::Cancelled { .. }) => StageError::Cancelled,
            CollaboratorError::Process(ProcessError::TimedOut { .. }) => {
                StageError::Timeout { stage, elapsed }
            }
            other => StageError::Execution(other.to_string()),
        }
    }
}
