//! Checkpoint persistence for safe reruns
//!
//! Provides one atomically-written record per `(job_id, disk_id, stage)` key,
//! a store-level advisory lock, and strict startup validation: a store that
//! cannot be read is reported as corrupt instead of being treated as empty.

pub mod checkpoint;
pub mod lock;
pub mod manager;

pub use checkpoint::{Checkpoint, CheckpointStatus};
pub use lock::StoreLock;
pub use manager::{RecoveryManager, VerifyReport};

use std::path::{Path, PathBuf};

/// Errors related to the recovery store
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// The store is unreadable or internally inconsistent
    #[error("recovery store is corrupt at {path}: {reason}")]
    Corruption {
        /// Offending file or directory
        path: PathBuf,
        /// What was wrong with it
        reason: String,
    },

    /// Schema version mismatch
    #[error("schema version mismatch in {path}: expected {expected}, found {found}")]
    SchemaVersionMismatch {
        /// Offending file
        path: PathBuf,
        /// Expected schema version
        expected: String,
        /// Found schema version
        found: String,
    },

    /// Record file too large to be a checkpoint
    #[error("record too large: {path} is {size} bytes (max: {max} bytes)")]
    RecordTooLarge {
        /// Offending file
        path: PathBuf,
        /// Actual file size
        size: u64,
        /// Maximum allowed size
        max: u64,
    },

    /// A job or disk identifier cannot be used as a record key
    #[error("invalid record key: {0}")]
    InvalidKey(String),

    /// IO error
    #[error("IO error on {path}: {source}")]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Lock error
    #[error("lock error: {0}")]
    Lock(String),

    /// A write was attempted through a read-only handle
    #[error("recovery store {0} was opened read-only")]
    ReadOnly(PathBuf),
}

impl RecoveryError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        RecoveryError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn corruption(path: &Path, reason: impl Into<String>) -> Self {
        RecoveryError::Corruption {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Whether the error means the store's contents cannot be trusted
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            RecoveryError::Corruption { .. }
                | RecoveryError::SchemaVersionMismatch { .. }
                | RecoveryError::RecordTooLarge { .. }
        )
    }
}
