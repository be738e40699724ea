//! Terminal progress bars for `run`

use crate::pipeline::{JobOutcome, JobResult, ProgressObserver};
use crate::Stage;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::sync::Mutex;

const BAR_TEMPLATE: &str =
    "{spinner:.green} {prefix:>8} [{elapsed_precise}] [{bar:30.cyan/blue}] {bytes}/{total_bytes} {msg}";

/// One bar per disk, grouped under a [`MultiProgress`]
pub struct BarObserver {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
    style: ProgressStyle,
}

impl BarObserver {
    /// Bars drawn to stderr
    pub fn new() -> Self {
        Self::with_target(ProgressDrawTarget::stderr())
    }

    /// Bars that draw nowhere; progress is still tracked
    pub fn hidden() -> Self {
        Self::with_target(ProgressDrawTarget::hidden())
    }

    fn with_target(target: ProgressDrawTarget) -> Self {
        let style = ProgressStyle::default_bar()
            .template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        Self {
            multi: MultiProgress::with_draw_target(target),
            bars: Mutex::new(HashMap::new()),
            style,
        }
    }

    fn with_bar(&self, job_id: &str, disk_id: &str, f: impl FnOnce(&ProgressBar)) {
        let bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bar) = bars.get(&key(job_id, disk_id)) {
            f(bar);
        }
    }

    /// Position of a disk's bar, if it exists
    pub fn position(&self, job_id: &str, disk_id: &str) -> Option<u64> {
        let bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        bars.get(&key(job_id, disk_id)).map(|bar| bar.position())
    }
}

impl Default for BarObserver {
    fn default() -> Self {
        Self::new()
    }
}

fn key(job_id: &str, disk_id: &str) -> String {
    format!("{job_id}/{disk_id}")
}

impl ProgressObserver for BarObserver {
    fn job_started(&self, job_id: &str, disk_id: &str) {
        let bar = self.multi.add(ProgressBar::new(0));
        bar.set_style(self.style.clone());
        bar.set_message(disk_id.to_string());
        let mut bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        bars.insert(key(job_id, disk_id), bar);
    }

    fn stage_started(&self, job_id: &str, disk_id: &str, stage: Stage) {
        self.with_bar(job_id, disk_id, |bar| {
            bar.set_prefix(stage.to_string());
            bar.set_length(0);
            bar.set_position(0);
        });
    }

    fn bytes(&self, job_id: &str, disk_id: &str, _stage: Stage, done: u64, total: Option<u64>) {
        self.with_bar(job_id, disk_id, |bar| {
            if let Some(total) = total {
                bar.set_length(total);
            } else if done > bar.length().unwrap_or(0) {
                bar.set_length(done);
            }
            bar.set_position(done);
        });
    }

    fn job_finished(&self, result: &JobResult) {
        let message = match &result.outcome {
            JobOutcome::Failed { stage, .. } => format!("{} failed@{stage}", result.disk_id),
            JobOutcome::Cancelled { stage } => format!("{} cancelled@{stage}", result.disk_id),
            other => format!("{} {}", result.disk_id, other.label()),
        };
        self.with_bar(&result.job_id, &result.disk_id, |bar| bar.finish_with_message(message));
    }
}
