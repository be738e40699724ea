//! Cooperative cancellation: stop between chunks, keep partial work, resume later

use crate::common::{fast_config, image_bytes, local_jobs, registry_with, CopyConverter, ScriptedSource};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use vdisk_migrator::pipeline::{JobOutcome, JobStatus, Orchestrator, ProgressObserver};
use vdisk_migrator::recovery::{CheckpointStatus, RecoveryManager};
use vdisk_migrator::shutdown::{SharedShutdown, ShutdownCoordinator};
use vdisk_migrator::transfer::resumable::temp_path_for;
use vdisk_migrator::transfer::SourceRegistry;
use vdisk_migrator::{DiskJob, Stage};

const URL: &str = "https://mirror.test/exports/db01.img";

/// Requests shutdown on the first FETCH progress callback
struct StopOnFirstChunk {
    shutdown: SharedShutdown,
}

impl ProgressObserver for StopOnFirstChunk {
    fn bytes(&self, _job_id: &str, _disk_id: &str, stage: Stage, _done: u64, _total: Option<u64>) {
        if stage == Stage::Fetch {
            self.shutdown.request_shutdown();
        }
    }
}

#[test]
fn test_shutdown_before_start_cancels_every_job() {
    let dir = TempDir::new().unwrap();
    let shutdown = ShutdownCoordinator::shared();
    shutdown.request_shutdown();
    let mut jobs = local_jobs(dir.path(), &["web01", "db01"], 4 * 1024);

    let report = Orchestrator::new(
        fast_config(dir.path()),
        registry_with(Arc::new(CopyConverter::new())),
        shutdown,
    )
    .run_jobs(&mut jobs)
    .unwrap();

    assert_eq!(report.summary(), "2 cancelled@FETCH");
    assert_eq!(report.exit_code(), 1);
    assert!(jobs.iter().all(|j| j.status == JobStatus::Cancelled(Stage::Fetch)));
    assert!(report.results.iter().all(|r| r.final_artifact.is_none()));
}

#[test]
fn test_cancelled_fetch_keeps_partial_and_resumes() {
    let dir = TempDir::new().unwrap();
    let data = image_bytes(256 * 1024, 9);
    let source = Arc::new(ScriptedSource::new().with_object(URL, data.clone(), &[]));
    let converter = Arc::new(CopyConverter::new());
    let config = fast_config(dir.path());
    let work_root = dir.path().join("work");
    let job = DiskJob::new("batch", URL, &work_root).unwrap();
    let destination = job.work_dir.join("source.img");

    let shutdown = ShutdownCoordinator::shared();
    let first = Orchestrator::new(config.clone(), registry_with(converter.clone()), shutdown.clone())
        .with_sources(SourceRegistry::new().with_source(source.clone()))
        .with_observer(Arc::new(StopOnFirstChunk { shutdown }))
        .run(vec![job.clone()])
        .unwrap();

    assert_eq!(first.results[0].outcome, JobOutcome::Cancelled { stage: Stage::Fetch });
    assert!(!destination.exists());
    let kept = std::fs::metadata(temp_path_for(&destination)).unwrap().len();
    assert!(kept > 0 && kept < data.len() as u64, "kept {kept} bytes");
    {
        let store = RecoveryManager::open(dir.path().join("store")).unwrap();
        let record = store.get("batch", &job.disk_id, Stage::Fetch).unwrap().unwrap();
        assert_eq!(record.status(), CheckpointStatus::Failed);
        assert_eq!(record.error_summary(), Some("cancelled"));
    }

    let second = Orchestrator::new(config, registry_with(converter), ShutdownCoordinator::shared())
        .with_sources(SourceRegistry::new().with_source(source.clone()))
        .run(vec![job])
        .unwrap();

    assert_eq!(second.results[0].outcome, JobOutcome::Succeeded);
    assert_eq!(source.open_offsets(URL), vec![0, kept]);
    assert_eq!(std::fs::read(&destination).unwrap(), data);
}

#[tokio::test]
async fn shutdown_notifies_async_waiters() {
    let shutdown = ShutdownCoordinator::shared();
    let waiter = {
        let handle = shutdown.clone();
        tokio::spawn(async move {
            handle.wait_for_shutdown().await;
            true
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.request_shutdown();

    let result = tokio::time::timeout(Duration::from_secs(1), waiter).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn shutdown_wait_returns_immediately_when_already_set() {
    let shutdown = ShutdownCoordinator::shared();
    shutdown.request_shutdown();

    let result = tokio::time::timeout(Duration::from_millis(100), shutdown.wait_for_shutdown()).await;
    assert!(result.is_ok(), "wait_for_shutdown blocked after shutdown was requested");
}
