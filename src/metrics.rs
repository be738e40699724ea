//! Pipeline observability metrics
//!
//! Stage outcomes, stage durations, transfer volume and retry behaviour are
//! recorded through the `metrics` facade. Without an installed recorder every
//! call is a no-op, so library users pay nothing unless they opt in.
//!
//! ## Architecture
//!
//! - Uses `metrics` crate for low-overhead metric collection
//! - Prometheus exporter for a scrape endpoint, installed on demand by the CLI
//! - Recording never blocks or fails the pipeline

use crate::Stage;
use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Global metrics registry initialization flag
static METRICS_INITIALIZED: Lazy<Arc<RwLock<bool>>> = Lazy::new(|| Arc::new(RwLock::new(false)));

/// Initialize metrics system with Prometheus exporter
///
/// Idempotent: later calls return `Ok(())` without reinstalling.
///
/// # Arguments
/// * `addr` - Socket address to bind Prometheus scrape endpoint (e.g., "0.0.0.0:9090")
pub async fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let mut initialized = METRICS_INITIALIZED.write().await;
    if *initialized {
        debug!("Metrics already initialized, skipping");
        return Ok(());
    }

    info!(%addr, "Initializing metrics system");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        "stages_completed_total",
        Unit::Count,
        "Stages that finished successfully"
    );
    describe_counter!("stages_failed_total", Unit::Count, "Stages that failed");
    describe_counter!(
        "stages_skipped_total",
        Unit::Count,
        "Stages skipped because a verified checkpoint existed"
    );
    describe_histogram!(
        "stage_duration_seconds",
        Unit::Seconds,
        "Wall time spent executing a stage"
    );
    describe_counter!(
        "transfer_bytes_total",
        Unit::Bytes,
        "Bytes read from transfer sources"
    );
    describe_counter!(
        "transfer_retries_total",
        Unit::Count,
        "Transfer retry attempts"
    );
    describe_histogram!(
        "retry_backoff_duration_seconds",
        Unit::Seconds,
        "Duration of retry backoff in seconds"
    );
    describe_gauge!(
        "jobs_in_progress",
        Unit::Count,
        "Disk jobs currently held by a worker"
    );
    describe_counter!(
        "jobs_completed_total",
        Unit::Count,
        "Disk jobs that reached a terminal outcome"
    );

    *initialized = true;
    info!(%addr, "Metrics system initialized successfully");
    Ok(())
}

/// Check if metrics system is initialized
pub async fn is_initialized() -> bool {
    *METRICS_INITIALIZED.read().await
}

/// Record retry backoff duration
pub fn record_retry_backoff(duration: Duration, attempt: u32) {
    counter!(
        "transfer_retries_total",
        "attempt" => attempt.to_string(),
    )
    .increment(1);

    histogram!("retry_backoff_duration_seconds").record(duration.as_secs_f64());

    debug!(
        attempt = attempt,
        backoff_ms = duration.as_millis() as u64,
        "Retry backoff recorded"
    );
}

/// Record bytes read from a source
pub fn record_transfer_bytes(bytes: u64) {
    counter!("transfer_bytes_total").increment(bytes);
}

/// Record a stage skipped on a verified checkpoint
pub fn record_stage_skipped(stage: Stage) {
    counter!("stages_skipped_total", "stage" => stage.as_str()).increment(1);
}

/// Record a job's terminal outcome (`succeeded`, `failed`, `skipped`, ...)
pub fn record_job_outcome(outcome: &'static str) {
    counter!("jobs_completed_total", "outcome" => outcome).increment(1);
}

/// Stage execution metrics
pub struct StageMetrics {
    stage: Stage,
    start_time: Instant,
}

impl StageMetrics {
    /// Start timing a stage
    pub fn start(stage: Stage) -> Self {
        Self {
            stage,
            start_time: Instant::now(),
        }
    }

    /// Record successful completion
    pub fn record_success(&self) {
        let elapsed = self.start_time.elapsed();
        counter!("stages_completed_total", "stage" => self.stage.as_str()).increment(1);
        histogram!("stage_duration_seconds", "stage" => self.stage.as_str())
            .record(elapsed.as_secs_f64());
    }

    /// Record failure
    pub fn record_failure(&self) {
        let elapsed = self.start_time.elapsed();
        counter!("stages_failed_total", "stage" => self.stage.as_str()).increment(1);
        histogram!("stage_duration_seconds", "stage" => self.stage.as_str())
            .record(elapsed.as_secs_f64());
    }

    /// Time since the stage started
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Holds the `jobs_in_progress` gauge up for as long as it lives
pub struct JobInProgressGuard(());

impl JobInProgressGuard {
    /// Increment the gauge
    pub fn enter() -> Self {
        gauge!("jobs_in_progress").increment(1.0);
        Self(())
    }
}

impl Drop for JobInProgressGuard {
    fn drop(&mut self) {
        gauge!("jobs_in_progress").decrement(1.0);
    }
}
