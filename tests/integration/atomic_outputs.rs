//! Stage outputs only appear once complete

use crate::common::{fast_config, local_jobs, registry_with, CopyConverter, VisibilityObserver};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::TempDir;
use vdisk_migrator::pipeline::Orchestrator;
use vdisk_migrator::shutdown::ShutdownCoordinator;

#[test]
fn test_outputs_invisible_while_being_written() {
    let dir = TempDir::new().unwrap();
    let jobs = local_jobs(dir.path(), &["web01", "db01"], 200 * 1024);
    let observer = Arc::new(VisibilityObserver::new(&dir.path().join("work")));

    let report = Orchestrator::new(
        fast_config(dir.path()),
        registry_with(Arc::new(CopyConverter::new())),
        ShutdownCoordinator::shared(),
    )
    .with_observer(observer.clone())
    .run(jobs)
    .unwrap();

    assert_eq!(report.summary(), "2 succeeded");
    assert!(observer.checks.load(Ordering::SeqCst) > 0);
    assert!(
        observer.violations.lock().unwrap().is_empty(),
        "{:?}",
        observer.violations.lock().unwrap()
    );
}

#[test]
fn test_no_temporary_files_left_after_success() {
    let dir = TempDir::new().unwrap();
    let jobs = local_jobs(dir.path(), &["web01"], 64 * 1024);
    let work_dir = jobs[0].work_dir.clone();

    let report = Orchestrator::new(
        fast_config(dir.path()),
        registry_with(Arc::new(CopyConverter::new())),
        ShutdownCoordinator::shared(),
    )
    .run(jobs)
    .unwrap();
    assert_eq!(report.exit_code(), 0);

    let leftovers: Vec<String> = std::fs::read_dir(&work_dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with(".tmp") || name.ends_with(".part"))
        .collect();
    assert!(leftovers.is_empty(), "leftover files: {leftovers:?}");
    assert!(work_dir.join("source.img").exists());
    assert!(work_dir.join("flat.img").exists());
}
