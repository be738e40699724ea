//! The worker bound holds for the whole batch

use crate::common::{fast_config, local_jobs, registry_with, CopyConverter};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use vdisk_migrator::pipeline::Orchestrator;
use vdisk_migrator::shutdown::ShutdownCoordinator;

#[test]
fn test_never_more_than_max_workers_jobs_at_once() {
    let dir = TempDir::new().unwrap();
    let converter = Arc::new(CopyConverter::new().with_delay(Duration::from_millis(40)));
    let config = fast_config(dir.path()).with_max_workers(2);
    let jobs = local_jobs(dir.path(), &["a", "b", "c", "d", "e", "f"], 8 * 1024);

    let report = Orchestrator::new(config, registry_with(converter.clone()), ShutdownCoordinator::shared())
        .run(jobs)
        .unwrap();

    assert_eq!(report.summary(), "6 succeeded");
    assert!(report.peak_workers >= 1 && report.peak_workers <= 2, "{}", report.peak_workers);
    assert!(converter.max_in_flight.load(Ordering::SeqCst) <= 2);
}

#[test]
fn test_pool_never_exceeds_job_count() {
    let dir = TempDir::new().unwrap();
    let converter = Arc::new(CopyConverter::new().with_delay(Duration::from_millis(20)));
    let config = fast_config(dir.path()).with_max_workers(16);
    let jobs = local_jobs(dir.path(), &["a", "b", "c"], 4 * 1024);

    let report = Orchestrator::new(config, registry_with(converter.clone()), ShutdownCoordinator::shared())
        .run(jobs)
        .unwrap();

    assert_eq!(report.succeeded(), 3);
    assert!(report.peak_workers <= 3);
}

#[test]
fn test_single_worker_runs_jobs_sequentially() {
    let dir = TempDir::new().unwrap();
    let converter = Arc::new(CopyConverter::new().with_delay(Duration::from_millis(10)));
    let config = fast_config(dir.path()).with_max_workers(1);
    let jobs = local_jobs(dir.path(), &["a", "b", "c", "d"], 4 * 1024);

    let report = Orchestrator::new(config, registry_with(converter.clone()), ShutdownCoordinator::shared())
        .run(jobs)
        .unwrap();

    assert_eq!(report.succeeded(), 4);
    assert_eq!(report.peak_workers, 1);
    assert_eq!(converter.max_in_flight.load(Ordering::SeqCst), 1);
}
