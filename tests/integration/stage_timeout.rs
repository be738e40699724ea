//! A stage that overruns its timeout fails that disk only

use crate::common::{fast_config, local_jobs, registry_with, CopyConverter};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use vdisk_migrator::pipeline::{JobOutcome, JobStatus, Orchestrator};
use vdisk_migrator::recovery::{CheckpointStatus, RecoveryManager};
use vdisk_migrator::shutdown::ShutdownCoordinator;
use vdisk_migrator::Stage;

#[test]
fn test_convert_timeout_is_recorded_as_failure() {
    let dir = TempDir::new().unwrap();
    let converter = Arc::new(
        CopyConverter::new()
            .with_delay(Duration::from_millis(800))
            .slow_for("slow-"),
    );
    let config = fast_config(dir.path())
        .with_max_workers(3)
        .with_stage_timeout(Some(Duration::from_millis(250)));
    let mut jobs = local_jobs(dir.path(), &["web01", "slow-db01", "app01"], 16 * 1024);

    let report = Orchestrator::new(config, registry_with(converter.clone()), ShutdownCoordinator::shared())
        .run_jobs(&mut jobs)
        .unwrap();

    assert_eq!(report.summary(), "2 succeeded, 1 failed@CONVERT");
    assert_eq!(report.exit_code(), 1);
    assert_eq!(converter.calls(), 3);

    match &report.results[1].outcome {
        JobOutcome::Failed { stage, error } => {
            assert_eq!(*stage, Stage::Convert);
            assert!(error.contains("timed out"), "{error}");
        }
        other => panic!("expected timeout failure, got {other:?}"),
    }
    assert_eq!(jobs[1].status, JobStatus::Failed(Stage::Convert));
    assert_eq!(report.results[0].outcome, JobOutcome::Succeeded);
    assert_eq!(report.results[2].outcome, JobOutcome::Succeeded);

    let store = RecoveryManager::open(dir.path().join("store")).unwrap();
    let record = store
        .get("batch", &jobs[1].disk_id, Stage::Convert)
        .unwrap()
        .unwrap();
    assert_eq!(record.status(), CheckpointStatus::Failed);
    assert!(record.error_summary().unwrap().contains("timed out"));
    assert!(!store.is_complete("batch", &jobs[1].disk_id, Stage::Convert));
    assert!(store.is_complete("batch", &jobs[0].disk_id, Stage::Convert));
}
