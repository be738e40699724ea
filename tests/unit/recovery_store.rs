//! Recovery store durability and startup validation

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;
use vdisk_migrator::recovery::{CheckpointStatus, RecoveryError, RecoveryManager};
use vdisk_migrator::Stage;

fn output(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

fn record_path(store: &Path, job: &str, disk: &str, stage: &str) -> PathBuf {
    store.join("jobs").join(job).join(disk).join(format!("{stage}.json"))
}

#[test]
fn test_completed_stage_survives_restart() {
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("store");
    let image = output(dir.path(), "source.img", b"image");
    {
        let manager = RecoveryManager::open(&store).unwrap();
        manager.begin("b1", "disk-a", Stage::Fetch).unwrap();
        manager.complete("b1", "disk-a", Stage::Fetch, &image).unwrap();
    }

    let manager = RecoveryManager::open(&store).unwrap();
    assert_eq!(manager.completed_output("b1", "disk-a", Stage::Fetch), Some(image));
    assert!(!manager.is_complete("b1", "disk-a", Stage::Flatten));
    assert_eq!(manager.job_ids().unwrap(), vec!["b1".to_string()]);
}

#[test]
fn test_second_open_is_refused_while_locked() {
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("store");
    let first = RecoveryManager::open(&store).unwrap();

    let err = RecoveryManager::open(&store).unwrap_err();
    assert!(matches!(err, RecoveryError::Lock(_)), "got {err:?}");

    drop(first);
    assert!(RecoveryManager::open(&store).is_ok());
}

#[test]
fn test_unparseable_record_fails_open() {
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("store");
    drop(RecoveryManager::open(&store).unwrap());

    let path = record_path(&store, "b1", "disk-a", "fetch");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "{\"schema_version\": \"1.0.0\", \"job_id\"").unwrap();

    let err = RecoveryManager::open(&store).unwrap_err();
    assert!(err.is_corruption(), "got {err:?}");
    assert!(err.to_string().contains("fetch.json"));
}

#[test]
fn test_misplaced_record_is_corruption() {
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("store");
    let image = output(dir.path(), "source.img", b"image");
    {
        let manager = RecoveryManager::open(&store).unwrap();
        manager.complete("b1", "disk-a", Stage::Fetch, &image).unwrap();
    }
    let from = record_path(&store, "b1", "disk-a", "fetch");
    let to = record_path(&store, "b1", "disk-b", "fetch");
    std::fs::create_dir_all(to.parent().unwrap()).unwrap();
    std::fs::copy(&from, &to).unwrap();

    let err = RecoveryManager::open(&store).unwrap_err();
    assert!(matches!(err, RecoveryError::Corruption { .. }), "got {err:?}");
}

#[test]
fn test_foreign_schema_version_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("store");
    let image = output(dir.path(), "source.img", b"image");
    {
        let manager = RecoveryManager::open(&store).unwrap();
        manager.complete("b1", "disk-a", Stage::Fetch, &image).unwrap();
    }
    let path = record_path(&store, "b1", "disk-a", "fetch");
    let mut record: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    record["schema_version"] = serde_json::Value::String("9.0.0".to_string());
    std::fs::write(&path, record.to_string()).unwrap();

    let err = RecoveryManager::open(&store).unwrap_err();
    assert!(matches!(err, RecoveryError::SchemaVersionMismatch { ref found, .. } if found == "9.0.0"));
}

#[test]
fn test_records_without_marker_are_not_treated_as_empty() {
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("store");
    let image = output(dir.path(), "source.img", b"image");
    {
        let manager = RecoveryManager::open(&store).unwrap();
        manager.complete("b1", "disk-a", Stage::Fetch, &image).unwrap();
    }
    std::fs::remove_file(store.join("store.json")).unwrap();

    let err = RecoveryManager::open(&store).unwrap_err();
    assert!(err.is_corruption());
}

#[test]
fn test_oversized_record_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("store");
    drop(RecoveryManager::open(&store).unwrap());
    let path = record_path(&store, "b1", "disk-a", "inspect");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, vec![b' '; 2 * 1024 * 1024]).unwrap();

    let err = RecoveryManager::open(&store).unwrap_err();
    assert!(matches!(err, RecoveryError::RecordTooLarge { .. }));
}

#[test]
fn test_leftover_temp_files_are_cleaned_on_open() {
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("store");
    let image = output(dir.path(), "source.img", b"image");
    {
        let manager = RecoveryManager::open(&store).unwrap();
        manager.complete("b1", "disk-a", Stage::Fetch, &image).unwrap();
    }
    let leftover = store.join("jobs/b1/disk-a/.tmpAbC123");
    std::fs::write(&leftover, "{\"half\":").unwrap();

    let manager = RecoveryManager::open(&store).unwrap();
    assert!(!leftover.exists());
    assert!(manager.is_complete("b1", "disk-a", Stage::Fetch));
}

#[test]
fn test_verify_reports_stale_completions() {
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("store");
    let manager = RecoveryManager::open(&store).unwrap();
    let kept = output(dir.path(), "source.img", b"image");
    let lost = output(dir.path(), "flat.img", b"image");
    manager.complete("b1", "disk-a", Stage::Fetch, &kept).unwrap();
    manager.complete("b1", "disk-a", Stage::Flatten, &lost).unwrap();
    manager.fail("b1", "disk-a", Stage::Inspect, "unreadable header").unwrap();
    std::fs::remove_file(&lost).unwrap();

    let report = manager.verify().unwrap();
    assert_eq!(report.valid, 3);
    assert_eq!(report.stale, 1);
    assert!(report.is_clean());
    assert!(!manager.is_complete("b1", "disk-a", Stage::Flatten));
}

#[test]
fn test_empty_output_does_not_count_as_complete() {
    let dir = TempDir::new().unwrap();
    let manager = RecoveryManager::open(dir.path().join("store")).unwrap();
    let empty = output(dir.path(), "converted.qcow2", b"");
    manager.complete("b1", "disk-a", Stage::Convert, &empty).unwrap();

    let record = manager.get("b1", "disk-a", Stage::Convert).unwrap().unwrap();
    assert_eq!(record.status(), CheckpointStatus::Completed);
    assert!(!manager.is_complete("b1", "disk-a", Stage::Convert));
}

#[test]
fn test_unsafe_identifiers_are_rejected() {
    let dir = TempDir::new().unwrap();
    let manager = RecoveryManager::open(dir.path().join("store")).unwrap();

    for bad in ["", "..", "../escape", "a/b", ".hidden"] {
        let err = manager.begin("b1", bad, Stage::Fetch).unwrap_err();
        assert!(matches!(err, RecoveryError::InvalidKey(_)), "{bad:?} accepted");
    }
    assert!(manager.reset_job("../b1").is_err());
}

#[test]
fn test_reset_job_removes_only_that_batch() {
    let dir = TempDir::new().unwrap();
    let manager = RecoveryManager::open(dir.path().join("store")).unwrap();
    let image = output(dir.path(), "source.img", b"image");
    for disk in ["disk-a", "disk-b"] {
        manager.complete("b1", disk, Stage::Fetch, &image).unwrap();
        manager.complete("b1", disk, Stage::Flatten, &image).unwrap();
    }
    manager.complete("b2", "disk-a", Stage::Fetch, &image).unwrap();

    assert_eq!(manager.reset_job("b1").unwrap(), 4);
    assert!(manager.records_for_job("b1").unwrap().is_empty());
    assert_eq!(manager.records_for_job("b2").unwrap().len(), 1);
    assert_eq!(manager.reset_job("b1").unwrap(), 0);
}

#[test]
fn test_concurrent_writers_on_distinct_keys() {
    let dir = TempDir::new().unwrap();
    let manager = Arc::new(RecoveryManager::open(dir.path().join("store")).unwrap());
    let image = output(dir.path(), "source.img", b"image");

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let manager = manager.clone();
            let image = image.clone();
            thread::spawn(move || {
                let disk = format!("disk-{i}");
                for stage in [Stage::Fetch, Stage::Flatten, Stage::Inspect] {
                    manager.begin("b1", &disk, stage).unwrap();
                    manager.complete("b1", &disk, stage, &image).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let records = manager.records_for_job("b1").unwrap();
    assert_eq!(records.len(), 24);
    assert!(records.iter().all(|r| r.status() == CheckpointStatus::Completed && r.attempts() == 1));
}
