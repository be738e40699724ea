//! Per-job results and the batch report

use crate::Stage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;

/// Final outcome of one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum JobOutcome {
    /// Every enabled stage completed
    Succeeded,
    /// A stage failed
    Failed {
        /// Stage that failed
        stage: Stage,
        /// One-line error summary
        error: String,
    },
    /// Every enabled stage was already complete
    Skipped,
    /// Dry run
    Planned {
        /// Stages that would run
        stages: Vec<Stage>,
    },
    /// Shutdown honored before or during this stage
    Cancelled {
        /// Stage that did not complete
        stage: Stage,
    },
}

impl JobOutcome {
    /// Short label used in summaries and metrics
    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Succeeded => "succeeded",
            JobOutcome::Failed { .. } => "failed",
            JobOutcome::Skipped => "skipped",
            JobOutcome::Planned { .. } => "planned",
            JobOutcome::Cancelled { .. } => "cancelled",
        }
    }

    /// Whether the outcome is acceptable for the process exit code
    pub fn is_ok(&self) -> bool {
        matches!(
            self,
            JobOutcome::Succeeded | JobOutcome::Skipped | JobOutcome::Planned { .. }
        )
    }
}

/// What happened to one stage of one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageDisposition {
    /// Executed and completed
    Ran,
    /// Completed output from an earlier run was reused
    Skipped,
    /// Not enabled for this run
    Disabled,
    /// Executed and failed
    Failed,
    /// Stopped by shutdown
    Cancelled,
    /// Not reached because an earlier stage stopped the job
    NotRun,
    /// Dry run
    Planned,
}

/// Per-stage detail inside a [`JobResult`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    /// Stage
    pub stage: Stage,
    /// Disposition
    pub disposition: StageDisposition,
    /// Output artifact, when the stage produced or reused one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    /// Wall time spent, zero for skipped stages
    pub duration_ms: u64,
}

/// Result of one job, returned by the processor and never an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    /// Batch identifier
    pub job_id: String,
    /// Disk identifier
    pub disk_id: String,
    /// Outcome
    pub outcome: JobOutcome,
    /// Last stage reached, `None` when nothing was attempted
    pub last_stage: Option<Stage>,
    /// Per-stage detail in pipeline order
    pub stages: Vec<StageReport>,
    /// Output of the last image-producing stage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_artifact: Option<PathBuf>,
    /// Wall time for the job
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl JobResult {
    /// A result with no stage detail yet
    pub fn new(job_id: impl Into<String>, disk_id: impl Into<String>, outcome: JobOutcome) -> Self {
        Self {
            job_id: job_id.into(),
            disk_id: disk_id.into(),
            outcome,
            last_stage: None,
            stages: Vec::new(),
            final_artifact: None,
            duration: Duration::ZERO,
        }
    }

    /// Disposition recorded for `stage`
    pub fn disposition(&self, stage: Stage) -> Option<StageDisposition> {
        self.stages
            .iter()
            .find(|s| s.stage == stage)
            .map(|s| s.disposition)
    }

    /// Stages that actually executed
    pub fn ran_stages(&self) -> Vec<Stage> {
        self.stages
            .iter()
            .filter(|s| s.disposition == StageDisposition::Ran)
            .map(|s| s.stage)
            .collect()
    }
}

/// Aggregate of a batch run, one entry per submitted job in input order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    /// Per-job results
    pub results: Vec<JobResult>,
    /// Peak concurrent jobs observed
    pub peak_workers: usize,
    /// Wall time for the batch
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl PipelineReport {
    /// Number of jobs with the given outcome label
    pub fn count(&self, label: &str) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome.label() == label)
            .count()
    }

    /// Succeeded jobs
    pub fn succeeded(&self) -> usize {
        self.count("succeeded")
    }

    /// Failed jobs
    pub fn failed(&self) -> usize {
        self.count("failed")
    }

    /// Skipped jobs
    pub fn skipped(&self) -> usize {
        self.count("skipped")
    }

    /// Cancelled jobs
    pub fn cancelled(&self) -> usize {
        self.count("cancelled")
    }

    /// One-line summary, e.g. `2 succeeded, 1 failed@CONVERT`
    pub fn summary(&self) -> String {
        if self.results.is_empty() {
            return "no jobs".to_string();
        }

        let mut parts = Vec::new();
        for label in ["succeeded", "skipped", "planned"] {
            let n = self.count(label);
            if n > 0 {
                parts.push(format!("{n} {label}"));
            }
        }

        let mut failures: BTreeMap<Stage, usize> = BTreeMap::new();
        let mut cancellations: BTreeMap<Stage, usize> = BTreeMap::new();
        for result in &self.results {
            match &result.outcome {
                JobOutcome::Failed { stage, .. } => *failures.entry(*stage).or_default() += 1,
                JobOutcome::Cancelled { stage } => *cancellations.entry(*stage).or_default() += 1,
                _ => {}
            }
        }
        for (stage, n) in failures {
            parts.push(format!("{n} failed@{stage}"));
        }
        for (stage, n) in cancellations {
            parts.push(format!("{n} cancelled@{stage}"));
        }
        parts.join(", ")
    }

    /// Process exit code: non-zero iff any job failed or was cancelled
    pub fn exit_code(&self) -> i32 {
        if self.results.iter().all(|r| r.outcome.is_ok()) {
            0
        } else {
            1
        }
    }

    /// Pretty JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Human-readable multi-line rendering
    pub fn render_human(&self) -> String {
        let mut out = String::new();
        for result in &self.results {
            let detail = match &result.outcome {
                JobOutcome::Succeeded => result
                    .final_artifact
                    .as_ref()
                    .map(|p| format!("-> {}", p.display()))
                    .unwrap_or_default(),
                JobOutcome::Failed { stage, error } => format!("at {stage}: {error}"),
                JobOutcome::Cancelled { stage } => format!("at {stage}"),
                JobOutcome::Planned { stages } => stages
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
                    .join(" -> "),
                JobOutcome::Skipped => "already complete".to_string(),
            };
            let _ = writeln!(
                out,
                "  {:<10} {}/{} {}",
                result.outcome.label(),
                result.job_id,
                result.disk_id,
                detail
            );
        }
        let _ = writeln!(
            out,
            "{} ({} jobs, {:.1}s, peak {} workers)",
            self.summary(),
            self.results.len(),
            self.duration.as_secs_f64(),
            self.peak_workers
        );
        out
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
