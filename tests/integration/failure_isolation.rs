//! One disk failing never stops its siblings

use crate::common::{fast_config, local_jobs, registry_with, CopyConverter};
use std::sync::Arc;
use tempfile::TempDir;
use vdisk_migrator::pipeline::{JobOutcome, JobStatus, Orchestrator};
use vdisk_migrator::shutdown::ShutdownCoordinator;
use vdisk_migrator::Stage;

#[test]
fn test_one_failure_does_not_affect_siblings() {
    let dir = TempDir::new().unwrap();
    let converter = Arc::new(CopyConverter::new().failing_for("bad-"));
    let config = fast_config(dir.path()).with_max_workers(2);
    let mut jobs = local_jobs(dir.path(), &["web01", "bad-db01", "app01"], 48 * 1024);

    let report = Orchestrator::new(config, registry_with(converter.clone()), ShutdownCoordinator::shared())
        .run_jobs(&mut jobs)
        .unwrap();

    assert_eq!(report.summary(), "2 succeeded, 1 failed@CONVERT");
    assert_eq!(report.exit_code(), 1);
    assert_eq!(converter.calls(), 3);

    // Results keep input order
    let disk_ids: Vec<&str> = report.results.iter().map(|r| r.disk_id.as_str()).collect();
    let expected: Vec<&str> = jobs.iter().map(|j| j.disk_id.as_str()).collect();
    assert_eq!(disk_ids, expected);

    let failed = &report.results[1];
    match &failed.outcome {
        JobOutcome::Failed { stage, error } => {
            assert_eq!(*stage, Stage::Convert);
            assert!(error.contains("unsupported controller"), "{error}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(jobs[1].status, JobStatus::Failed(Stage::Convert));

    for index in [0, 2] {
        assert_eq!(report.results[index].outcome, JobOutcome::Succeeded);
        assert!(report.results[index].final_artifact.as_ref().unwrap().is_file());
    }
}

#[test]
fn test_failed_disk_resumes_at_failed_stage() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(dir.path()).with_max_workers(2);
    let jobs = local_jobs(dir.path(), &["web01", "bad-db01"], 16 * 1024);

    let failing = Arc::new(CopyConverter::new().failing_for("bad-"));
    let first = Orchestrator::new(config.clone(), registry_with(failing), ShutdownCoordinator::shared())
        .run(jobs.clone())
        .unwrap();
    assert_eq!(first.failed(), 1);

    // The fault is fixed; only the failed disk has work left, and only from CONVERT on
    let healthy = Arc::new(CopyConverter::new());
    let second = Orchestrator::new(config, registry_with(healthy.clone()), ShutdownCoordinator::shared())
        .run(jobs)
        .unwrap();

    assert_eq!(second.summary(), "1 succeeded, 1 skipped");
    assert_eq!(healthy.calls(), 1);
    let retried = &second.results[1];
    assert_eq!(retried.ran_stages(), vec![Stage::Convert]);
}
