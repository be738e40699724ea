//! Checkpoint records for resume capability
//!
//! One record describes one `(job_id, disk_id, stage)` key. A `completed`
//! record is only a hint: callers must still confirm the output exists.

use crate::Stage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Current record schema version
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Status of one stage of one disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    /// Planned but not started
    Pending,
    /// Started; the process may have died while running it
    InProgress,
    /// Finished and produced `output_path`
    Completed,
    /// Finished with an error
    Failed,
}

impl CheckpointStatus {
    /// Whether the status is final for the current attempt
    pub fn is_terminal(&self) -> bool {
        matches!(self, CheckpointStatus::Completed | CheckpointStatus::Failed)
    }
}

impl std::fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CheckpointStatus::Pending => "pending",
            CheckpointStatus::InProgress => "in_progress",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A persisted fact: stage S of disk D in batch B reached status X at time T
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    schema_version: String,
    job_id: String,
    disk_id: String,
    stage: Stage,
    status: CheckpointStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_summary: Option<String>,
    /// Number of times the stage has been started
    attempts: u32,
    /// Unix milliseconds when the current attempt started
    #[serde(skip_serializing_if = "Option::is_none")]
    started_at: Option<i64>,
    /// Unix milliseconds of the last status change
    timestamp: i64,
}

impl Checkpoint {
    /// Create a pending record
    pub fn pending(job_id: &str, disk_id: &str, stage: Stage) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            job_id: job_id.to_string(),
            disk_id: disk_id.to_string(),
            stage,
            status: CheckpointStatus::Pending,
            output_path: None,
            error_summary: None,
            attempts: 0,
            started_at: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Transition to `in_progress`, counting a new attempt
    pub fn start(mut self) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        self.status = CheckpointStatus::InProgress;
        self.attempts = self.attempts.saturating_add(1);
        self.output_path = None;
        self.error_summary = None;
        self.started_at = Some(now);
        self.timestamp = now;
        self
    }

    /// Transition to `completed` with the produced artifact
    pub fn complete(mut self, output_path: &Path) -> Self {
        self.status = CheckpointStatus::Completed;
        self.output_path = Some(output_path.to_path_buf());
        self.error_summary = None;
        self.timestamp = chrono::Utc::now().timestamp_millis();
        self
    }

    /// Transition to `failed` with a short error summary
    pub fn fail(mut self, error_summary: impl Into<String>) -> Self {
        self.status = CheckpointStatus::Failed;
        self.output_path = None;
        self.error_summary = Some(error_summary.into());
        self.timestamp = chrono::Utc::now().timestamp_millis();
        self
    }

    /// Schema version the record was written with
    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    /// Batch identifier
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Disk identifier within the batch
    pub fn disk_id(&self) -> &str {
        &self.disk_id
    }

    /// Stage this record describes
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Recorded status
    pub fn status(&self) -> CheckpointStatus {
        self.status
    }

    /// Artifact produced by a completed stage
    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }

    /// Error summary of a failed stage
    pub fn error_summary(&self) -> Option<&str> {
        self.error_summary.as_deref()
    }

    /// Number of attempts so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Start of the current attempt (Unix milliseconds)
    pub fn started_at(&self) -> Option<i64> {
        self.started_at
    }

    /// Last status change (Unix milliseconds)
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Whether the recorded output still exists as a non-empty file
    ///
    /// The filesystem is the source of truth; a completed record whose artifact
    /// vanished or was truncated to zero bytes does not count.
    pub fn output_is_present(&self) -> bool {
        match &self.output_path {
            Some(path) => std::fs::metadata(path)
                .map(|meta| meta.is_file() && meta.len() > 0)
                .unwrap_or(false),
            None => false,
        }
    }

    /// Whether this record proves the stage is done
    pub fn is_trustworthy_completion(&self) -> bool {
        self.status == CheckpointStatus::Completed && self.output_is_present()
    }
}
