//! Interrupted transfers continue from the confirmed prefix

use crate::common::{fast_config, image_bytes, registry_with, sha256_hex, CopyConverter, ScriptedSource, Step};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use vdisk_migrator::locator::SourceLocator;
use vdisk_migrator::pipeline::{JobOutcome, Orchestrator, StageDisposition};
use vdisk_migrator::shutdown::ShutdownCoordinator;
use vdisk_migrator::transfer::resumable::temp_path_for;
use vdisk_migrator::transfer::{ResumableTransfer, SourceRegistry, TransferConfig, TransferRequest};
use vdisk_migrator::{DiskJob, Stage};

const URL: &str = "https://mirror.test/exports/web01.img";
const TOTAL: usize = 500 * 1024;
const CUT: usize = 200 * 1024;

fn engine(source: Arc<ScriptedSource>) -> ResumableTransfer {
    let config = TransferConfig::default()
        .with_chunk_bytes(16 * 1024)
        .with_backoff(Duration::from_millis(2), Duration::from_millis(10));
    ResumableTransfer::new(
        Arc::new(SourceRegistry::new().with_source(source)),
        config,
        ShutdownCoordinator::shared(),
    )
}

#[test]
fn test_reset_mid_stream_resumes_at_confirmed_offset() {
    let dir = TempDir::new().unwrap();
    let data = image_bytes(TOTAL, 1);
    let source = Arc::new(ScriptedSource::new().with_object(URL, data.clone(), &[Step::ResetAfter(CUT)]));
    let destination = dir.path().join("web01.img");
    let locator = SourceLocator::parse(URL).unwrap();

    let result = engine(source.clone())
        .fetch_with(
            TransferRequest::new(&locator, &destination).with_expected_sha256(Some(sha256_hex(&data).as_str())),
            &mut |_| {},
        )
        .unwrap();

    assert_eq!(source.open_offsets(URL), vec![0, CUT as u64]);
    assert_eq!(result.attempts, 2);
    assert_eq!(result.bytes_transferred, TOTAL as u64);
    assert_eq!(result.total_bytes, TOTAL as u64);
    assert_eq!(result.checksum.as_deref(), Some(sha256_hex(&data).as_str()));
    assert_eq!(std::fs::read(&destination).unwrap(), data);
    assert!(!temp_path_for(&destination).exists());
}

#[test]
fn test_partial_file_from_earlier_process_is_continued() {
    let dir = TempDir::new().unwrap();
    let data = image_bytes(TOTAL, 2);
    let destination = dir.path().join("web01.img");
    std::fs::write(temp_path_for(&destination), &data[..CUT]).unwrap();

    let source = Arc::new(ScriptedSource::new().with_object(URL, data.clone(), &[]));
    let locator = SourceLocator::parse(URL).unwrap();
    let result = engine(source.clone()).fetch(&locator, &destination, true).unwrap();

    assert_eq!(source.open_offsets(URL), vec![CUT as u64]);
    assert_eq!(result.resumed_from, CUT as u64);
    assert_eq!(result.bytes_transferred, (TOTAL - CUT) as u64);
    assert_eq!(std::fs::read(&destination).unwrap(), data);
}

#[test]
fn test_resume_disabled_starts_over() {
    let dir = TempDir::new().unwrap();
    let data = image_bytes(64 * 1024, 3);
    let destination = dir.path().join("disk.img");
    std::fs::write(temp_path_for(&destination), b"stale prefix from another object").unwrap();

    let source = Arc::new(ScriptedSource::new().with_object(URL, data.clone(), &[]));
    let locator = SourceLocator::parse(URL).unwrap();
    let result = engine(source.clone()).fetch(&locator, &destination, false).unwrap();

    assert_eq!(source.open_offsets(URL), vec![0]);
    assert_eq!(result.resumed_from, 0);
    assert_eq!(std::fs::read(&destination).unwrap(), data);
}

fn job(work_root: &Path) -> DiskJob {
    DiskJob::new("batch", URL, work_root).unwrap()
}

#[test]
fn test_rerun_after_failed_fetch_resumes_partial_download() {
    let dir = TempDir::new().unwrap();
    let data = image_bytes(TOTAL, 4);
    let source = Arc::new(ScriptedSource::new().with_object(URL, data.clone(), &[Step::ResetAfter(CUT)]));
    let converter = Arc::new(CopyConverter::new());
    let config = fast_config(dir.path()).with_transfer_retry_limit(0);
    let work_root = dir.path().join("work");

    let first = Orchestrator::new(config.clone(), registry_with(converter.clone()), ShutdownCoordinator::shared())
        .with_sources(SourceRegistry::new().with_source(source.clone()))
        .run(vec![job(&work_root)])
        .unwrap();
    assert_eq!(first.summary(), "1 failed@FETCH");
    let destination = job(&work_root).work_dir.join("source.img");
    assert!(!destination.exists());
    assert_eq!(
        std::fs::metadata(temp_path_for(&destination)).unwrap().len(),
        CUT as u64
    );

    let second = Orchestrator::new(config, registry_with(converter.clone()), ShutdownCoordinator::shared())
        .with_sources(SourceRegistry::new().with_source(source.clone()))
        .run(vec![job(&work_root)])
        .unwrap();

    assert_eq!(second.results[0].outcome, JobOutcome::Succeeded);
    assert_eq!(second.results[0].disposition(Stage::Fetch), Some(StageDisposition::Ran));
    // Bytes before the cut were requested exactly once across both runs
    assert_eq!(source.open_offsets(URL), vec![0, CUT as u64]);
    assert_eq!(std::fs::read(&destination).unwrap(), data);
    let artifact = second.results[0].final_artifact.clone().unwrap();
    assert_eq!(sha256_hex(&std::fs::read(artifact).unwrap()), sha256_hex(&data));
}

#[test]
fn test_checksum_mismatch_discards_partial_file() {
    let dir = TempDir::new().unwrap();
    let data = image_bytes(32 * 1024, 5);
    let source = Arc::new(ScriptedSource::new().with_object(URL, data, &[]));
    let destination = dir.path().join("disk.img");
    let locator = SourceLocator::parse(URL).unwrap();
    let wrong = "0".repeat(64);

    let err = engine(source)
        .fetch_with(
            TransferRequest::new(&locator, &destination).with_expected_sha256(Some(wrong.as_str())),
            &mut |_| {},
        )
        .unwrap_err();

    assert!(err.to_string().contains("checksum mismatch"), "{err}");
    assert!(!destination.exists());
    assert!(!temp_path_for(&destination).exists());
}
