//! Progress tracking for long-running byte copies.
//!
//! [`ProgressState`] turns raw byte counts into percentages, rates and ETAs
//! and decides when a `[PROGRESS]` line is worth logging. A
//! [`ProgressObserver`] receives the same events so a front end can draw
//! bars; it never influences correctness decisions.

use super::report::JobResult;
use crate::Stage;
use std::time::{Duration, Instant};

const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_PERCENTAGE_STEP: f64 = 10.0;

/// Receives pipeline progress events from worker threads
pub trait ProgressObserver: Send + Sync {
    /// A job was picked up by a worker
    fn job_started(&self, _job_id: &str, _disk_id: &str) {}

    /// A stage began executing
    fn stage_started(&self, _job_id: &str, _disk_id: &str, _stage: Stage) {}

    /// Bytes moved so far by the running stage
    fn bytes(&self, _job_id: &str, _disk_id: &str, _stage: Stage, _done: u64, _total: Option<u64>) {}

    /// A job reached its terminal result
    fn job_finished(&self, _result: &JobResult) {}
}

/// Byte-based progress for one stage of one job
#[derive(Debug, Clone)]
pub struct ProgressState {
    /// Bytes processed so far
    pub bytes_done: u64,
    /// Total expected bytes (if known)
    pub total_bytes: Option<u64>,
    /// When tracking started
    pub start_time: Instant,
    /// Last time progress was reported
    pub last_update: Instant,
    /// Minimum interval between time-based updates
    pub update_interval: Duration,
    /// Current rate in bytes per second
    pub current_rate: f64,
    /// Last reported completion percentage
    pub last_reported_percentage: f64,
    /// Percentage delta that forces an update
    pub min_percentage_step: f64,
    /// Prefix naming the job and stage
    pub label: String,
}

impl ProgressState {
    /// Start tracking
    pub fn new(label: impl Into<String>, total_bytes: Option<u64>) -> Self {
        let now = Instant::now();
        Self {
            bytes_done: 0,
            total_bytes,
            start_time: now,
            last_update: now,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            current_rate: 0.0,
            last_reported_percentage: 0.0,
            min_percentage_step: DEFAULT_PERCENTAGE_STEP,
            label: label.into(),
        }
    }

    /// Override the time-based cadence
    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    /// Record the absolute byte count reached
    pub fn update_to(&mut self, bytes_done: u64, total_bytes: Option<u64>) {
        self.bytes_done = bytes_done;
        if total_bytes.is_some() {
            self.total_bytes = total_bytes;
        }
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.current_rate = self.bytes_done as f64 / elapsed;
        }
    }

    /// Whether a progress line should be emitted now
    pub fn should_emit_update(&self) -> bool {
        if self.bytes_done == 0 {
            return false;
        }

        let percentage_jump = self
            .percentage()
            .map(|pct| pct - self.last_reported_percentage >= self.min_percentage_step)
            .unwrap_or(false);

        percentage_jump || self.last_update.elapsed() >= self.update_interval
    }

    /// Call after emitting a progress line
    pub fn mark_emitted(&mut self) {
        self.last_update = Instant::now();
        if let Some(pct) = self.percentage() {
            self.last_reported_percentage = pct;
        }
    }

    /// Completion percentage (0-100), when the total is known
    pub fn percentage(&self) -> Option<f64> {
        let total = self.total_bytes?;
        if total == 0 {
            return Some(100.0);
        }
        Some((self.bytes_done as f64 / total as f64 * 100.0).min(100.0))
    }

    /// Estimated time to completion
    pub fn estimate_remaining(&self) -> Option<Duration> {
        if self.current_rate <= 0.0 {
            return None;
        }
        let remaining = self.total_bytes?.saturating_sub(self.bytes_done);
        if remaining == 0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / self.current_rate))
    }

    /// Human-readable progress line
    pub fn format_progress(&self) -> String {
        let mut parts = vec![format!("[PROGRESS] {} {}", self.label, format_bytes(self.bytes_done))];

        if let Some(total) = self.total_bytes {
            parts.push(format!("of {}", format_bytes(total)));
        }

        if let Some(pct) = self.percentage() {
            parts.push(format!("- {pct:.1}% complete"));
        }

        if self.current_rate > 0.0 {
            parts.push(format!("at {}/s", format_bytes(self.current_rate as u64)));
        }

        if let Some(remaining) = self.estimate_remaining() {
            parts.push(format!("- ~{} remaining", format_duration(remaining)));
        }

        parts.join(" ")
    }
}

/// Binary-unit byte formatting
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else {
        format!("{:.1}h", secs as f64 / 3600.0)
    }
}
