//! End-to-end batches over local images with in-process collaborators

use crate::common::{fast_config, local_jobs, CopyConverter, FixedValidator, RecordingFixer};
use std::sync::Arc;
use tempfile::TempDir;
use vdisk_migrator::collaborators::CollaboratorRegistry;
use vdisk_migrator::pipeline::{JobOutcome, JobStatus, Orchestrator, StageDisposition};
use vdisk_migrator::recovery::{CheckpointStatus, RecoveryManager};
use vdisk_migrator::shutdown::ShutdownCoordinator;
use vdisk_migrator::Stage;

#[test]
fn test_all_six_stages_run_in_order() {
    let dir = TempDir::new().unwrap();
    let converter = Arc::new(CopyConverter::new());
    let fixer = Arc::new(RecordingFixer::default());
    let registry = CollaboratorRegistry::new()
        .with_converter(converter.clone())
        .with_fixer(fixer.clone())
        .with_validator(Arc::new(FixedValidator { booted: true }));
    let config = fast_config(dir.path()).with_enabled_stages(Stage::ALL);
    let mut jobs = local_jobs(dir.path(), &["web01"], 96 * 1024);

    let report = Orchestrator::new(config, registry, ShutdownCoordinator::shared())
        .run_jobs(&mut jobs)
        .unwrap();

    let result = &report.results[0];
    assert_eq!(result.outcome, JobOutcome::Succeeded);
    assert_eq!(result.ran_stages(), Stage::ALL.to_vec());
    assert_eq!(result.last_stage, Some(Stage::Validate));
    assert_eq!(jobs[0].status, JobStatus::Succeeded);
    assert_eq!(report.summary(), "1 succeeded");
    assert_eq!(report.exit_code(), 0);

    let work_dir = &jobs[0].work_dir;
    let artifact = result.final_artifact.clone().unwrap();
    assert_eq!(artifact, work_dir.join("converted.qcow2"));
    assert_eq!(
        std::fs::read(&artifact).unwrap(),
        std::fs::read(work_dir.join("source.img")).unwrap()
    );
    assert!(work_dir.join("inspect.json").is_file());
    assert!(work_dir.join("fix-report.json").is_file());
    assert!(work_dir.join("validation.json").is_file());

    // Repair works on the pipeline's copy, never on the source
    let seen = fixer.seen.lock().unwrap().clone();
    assert_eq!(seen, vec![work_dir.join("flat.img")]);

    let store = RecoveryManager::open(dir.path().join("store")).unwrap();
    let records = store.records_for_job("batch").unwrap();
    assert_eq!(records.len(), 6);
    assert!(records.iter().all(|cp| cp.status() == CheckpointStatus::Completed));
    assert!(records.iter().all(|cp| cp.attempts() == 1));
}

#[test]
fn test_failed_boot_keeps_validation_output() {
    let dir = TempDir::new().unwrap();
    let registry = CollaboratorRegistry::new()
        .with_converter(Arc::new(CopyConverter::new()))
        .with_validator(Arc::new(FixedValidator { booted: false }));
    let config = fast_config(dir.path()).with_enabled_stages([Stage::Fetch, Stage::Convert, Stage::Validate]);
    let jobs = local_jobs(dir.path(), &["db01"], 32 * 1024);
    let work_dir = jobs[0].work_dir.clone();

    let report = Orchestrator::new(config, registry, ShutdownCoordinator::shared())
        .run(jobs)
        .unwrap();

    let result = &report.results[0];
    match &result.outcome {
        JobOutcome::Failed { stage, error } => {
            assert_eq!(*stage, Stage::Validate);
            assert!(error.contains("did not boot"), "{error}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(result.final_artifact.is_none());
    assert_eq!(result.disposition(Stage::Flatten), Some(StageDisposition::Disabled));
    assert!(work_dir.join("validation.json").is_file());
    assert_eq!(report.summary(), "1 failed@VALIDATE");
    assert_eq!(report.exit_code(), 1);
}

#[test]
fn test_missing_collaborator_fails_only_that_stage() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(dir.path());
    let jobs = local_jobs(dir.path(), &["web01"], 8 * 1024);

    let report = Orchestrator::new(config, CollaboratorRegistry::new(), ShutdownCoordinator::shared())
        .run(jobs)
        .unwrap();

    let result = &report.results[0];
    assert!(matches!(result.outcome, JobOutcome::Failed { stage: Stage::Convert, .. }));
    assert_eq!(result.disposition(Stage::Fetch), Some(StageDisposition::Ran));
    assert_eq!(result.disposition(Stage::Inspect), Some(StageDisposition::Ran));
    assert_eq!(result.disposition(Stage::Convert), Some(StageDisposition::Failed));
}

#[test]
fn test_snapshot_chain_is_flattened_by_converter() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("child.qcow2");
    let backing = b"base.qcow2";
    let mut header = vec![0u8; 8192];
    header[..4].copy_from_slice(b"QFI\xfb");
    header[4..8].copy_from_slice(&3u32.to_be_bytes());
    header[8..16].copy_from_slice(&1024u64.to_be_bytes());
    header[16..20].copy_from_slice(&(backing.len() as u32).to_be_bytes());
    header[24..32].copy_from_slice(&(1u64 << 30).to_be_bytes());
    header[1024..1024 + backing.len()].copy_from_slice(backing);
    std::fs::write(&source, &header).unwrap();

    let converter = Arc::new(CopyConverter::new());
    let config = fast_config(dir.path()).with_enabled_stages([Stage::Fetch, Stage::Flatten, Stage::Inspect]);
    let job = vdisk_migrator::DiskJob::new("batch", &source.to_string_lossy(), &dir.path().join("work")).unwrap();
    let work_dir = job.work_dir.clone();

    let report = Orchestrator::new(
        config,
        CollaboratorRegistry::new().with_converter(converter.clone()),
        ShutdownCoordinator::shared(),
    )
    .run(vec![job])
    .unwrap();

    assert_eq!(report.results[0].outcome, JobOutcome::Succeeded);
    assert_eq!(converter.calls(), 1);
    assert!(work_dir.join("source.qcow2").is_file());
    assert!(work_dir.join("flat.qcow2").is_file());
    let facts = std::fs::read_to_string(work_dir.join("inspect.json")).unwrap();
    assert!(facts.contains("\"qcow2\""), "{facts}");
}
