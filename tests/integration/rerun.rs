//! Reruns against an existing recovery store

use crate::common::{fast_config, local_jobs, registry_with, CopyConverter};
use std::sync::Arc;
use tempfile::TempDir;
use vdisk_migrator::pipeline::{JobOutcome, Orchestrator, PipelineConfig, StageDisposition};
use vdisk_migrator::shutdown::ShutdownCoordinator;
use vdisk_migrator::{DiskJob, Stage};

fn run(config: &PipelineConfig, jobs: &[DiskJob], converter: &Arc<CopyConverter>) -> vdisk_migrator::PipelineReport {
    Orchestrator::new(config.clone(), registry_with(converter.clone()), ShutdownCoordinator::shared())
        .run(jobs.to_vec())
        .unwrap()
}

#[test]
fn test_rerun_of_finished_batch_skips_everything() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(dir.path());
    let jobs = local_jobs(dir.path(), &["web01", "db01"], 32 * 1024);
    let converter = Arc::new(CopyConverter::new());

    let first = run(&config, &jobs, &converter);
    assert_eq!(first.summary(), "2 succeeded");
    let artifacts: Vec<_> = first.results.iter().map(|r| r.final_artifact.clone()).collect();
    let mtime = std::fs::metadata(artifacts[0].as_ref().unwrap())
        .unwrap()
        .modified()
        .unwrap();

    let second = run(&config, &jobs, &converter);
    assert_eq!(second.summary(), "2 skipped");
    assert_eq!(second.exit_code(), 0);
    assert_eq!(converter.calls(), 2);
    for (result, artifact) in second.results.iter().zip(&artifacts) {
        assert_eq!(result.outcome, JobOutcome::Skipped);
        assert!(result.ran_stages().is_empty());
        assert_eq!(&result.final_artifact, artifact);
    }
    let mtime_after = std::fs::metadata(artifacts[0].as_ref().unwrap())
        .unwrap()
        .modified()
        .unwrap();
    assert_eq!(mtime, mtime_after);
}

#[test]
fn test_missing_output_reruns_that_stage_only() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(dir.path());
    let jobs = local_jobs(dir.path(), &["web01"], 32 * 1024);
    let converter = Arc::new(CopyConverter::new());
    run(&config, &jobs, &converter);

    std::fs::remove_file(jobs[0].work_dir.join("converted.qcow2")).unwrap();
    let report = run(&config, &jobs, &converter);

    let result = &report.results[0];
    assert_eq!(result.outcome, JobOutcome::Succeeded);
    assert_eq!(result.ran_stages(), vec![Stage::Convert]);
    assert_eq!(result.disposition(Stage::Fetch), Some(StageDisposition::Skipped));
    assert_eq!(converter.calls(), 2);
    assert!(jobs[0].work_dir.join("converted.qcow2").is_file());
}

#[test]
fn test_truncated_output_counts_as_missing() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(dir.path());
    let jobs = local_jobs(dir.path(), &["web01"], 32 * 1024);
    let converter = Arc::new(CopyConverter::new());
    run(&config, &jobs, &converter);

    std::fs::write(jobs[0].work_dir.join("converted.qcow2"), b"").unwrap();
    let report = run(&config, &jobs, &converter);
    assert_eq!(report.results[0].ran_stages(), vec![Stage::Convert]);
}

#[test]
fn test_upstream_rerun_forces_downstream_stages() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(dir.path());
    let jobs = local_jobs(dir.path(), &["web01"], 32 * 1024);
    let converter = Arc::new(CopyConverter::new());
    run(&config, &jobs, &converter);

    std::fs::remove_file(jobs[0].work_dir.join("flat.img")).unwrap();
    let report = run(&config, &jobs, &converter);

    let result = &report.results[0];
    assert_eq!(
        result.ran_stages(),
        vec![Stage::Flatten, Stage::Inspect, Stage::Convert]
    );
    assert_eq!(result.disposition(Stage::Fetch), Some(StageDisposition::Skipped));
    assert_eq!(converter.calls(), 2);
}

#[test]
fn test_dry_run_reports_plan_without_side_effects() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(dir.path());
    let jobs = local_jobs(dir.path(), &["web01"], 16 * 1024);
    let converter = Arc::new(CopyConverter::new());

    let planned = run(&config.clone().with_dry_run(true), &jobs, &converter);
    assert_eq!(planned.summary(), "1 planned");
    assert_eq!(
        planned.results[0].outcome,
        JobOutcome::Planned {
            stages: vec![Stage::Fetch, Stage::Flatten, Stage::Inspect, Stage::Convert]
        }
    );
    assert!(!dir.path().join("store").exists());
    assert!(!jobs[0].work_dir.exists());

    run(&config, &jobs, &converter);
    std::fs::remove_file(jobs[0].work_dir.join("converted.qcow2")).unwrap();

    let replanned = run(&config.with_dry_run(true), &jobs, &converter);
    let result = &replanned.results[0];
    assert_eq!(result.outcome, JobOutcome::Planned { stages: vec![Stage::Convert] });
    assert_eq!(result.disposition(Stage::Inspect), Some(StageDisposition::Skipped));
    assert_eq!(result.disposition(Stage::Fix), Some(StageDisposition::Disabled));
    assert_eq!(converter.calls(), 1);
}

#[test]
fn test_dry_run_does_not_touch_existing_store_dir() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(dir.path()).with_dry_run(true);
    let jobs = local_jobs(dir.path(), &["web01"], 16 * 1024);
    let converter = Arc::new(CopyConverter::new());
    let store = dir.path().join("store");
    std::fs::create_dir_all(&store).unwrap();

    let planned = run(&config, &jobs, &converter);
    assert_eq!(planned.summary(), "1 planned");
    assert_eq!(std::fs::read_dir(&store).unwrap().count(), 0);
    assert_eq!(converter.calls(), 0);
}

#[test]
fn test_corrupt_store_aborts_before_any_work() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(dir.path());
    let jobs = local_jobs(dir.path(), &["web01"], 16 * 1024);
    let converter = Arc::new(CopyConverter::new());
    run(&config, &jobs, &converter);

    let store = dir.path().join("store").join("jobs").join("batch").join(&jobs[0].disk_id);
    let record = std::fs::read_dir(&store)
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.extension().is_some_and(|e| e == "json"))
        .unwrap();
    std::fs::write(&record, b"{ not json").unwrap();

    let err = Orchestrator::new(config, registry_with(converter.clone()), ShutdownCoordinator::shared())
        .run(jobs)
        .unwrap_err();
    assert!(err.to_string().contains("recovery store"), "{err}");
    assert_eq!(converter.calls(), 1);
}
