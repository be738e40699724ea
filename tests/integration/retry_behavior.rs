//! Bounded retries with non-decreasing backoff

use crate::common::{image_bytes, ScriptedSource, Step};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use vdisk_migrator::locator::SourceLocator;
use vdisk_migrator::shutdown::{SharedShutdown, ShutdownCoordinator};
use vdisk_migrator::transfer::{calculate_backoff, ResumableTransfer, SourceRegistry, TransferConfig, TransferError};

const URL: &str = "https://mirror.test/exports/app01.img";

fn engine(source: Arc<ScriptedSource>, config: TransferConfig, shutdown: SharedShutdown) -> ResumableTransfer {
    ResumableTransfer::new(Arc::new(SourceRegistry::new().with_source(source)), config, shutdown)
}

fn fast() -> TransferConfig {
    TransferConfig::default()
        .with_chunk_bytes(8 * 1024)
        .with_backoff(Duration::from_millis(5), Duration::from_millis(12))
}

#[test]
fn test_succeeds_on_third_attempt() {
    let dir = TempDir::new().unwrap();
    let data = image_bytes(24 * 1024, 1);
    let source = Arc::new(ScriptedSource::new().with_object(URL, data.clone(), &[Step::Refuse, Step::Refuse]));
    let locator = SourceLocator::parse(URL).unwrap();

    let result = engine(source.clone(), fast(), ShutdownCoordinator::shared())
        .fetch(&locator, &dir.path().join("app01.img"), true)
        .unwrap();

    assert_eq!(result.attempts, 3);
    assert_eq!(
        result.retry_delays,
        vec![Duration::from_millis(5), Duration::from_millis(10)]
    );
    assert!(result.retry_delays.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(source.open_offsets(URL), vec![0, 0, 0]);
    assert_eq!(std::fs::read(dir.path().join("app01.img")).unwrap(), data);
}

#[test]
fn test_backoff_is_capped_and_never_decreases() {
    let config = fast().with_retry_limit(6);
    let delays: Vec<Duration> = (0..6).map(|n| config.backoff(n)).collect();
    assert_eq!(delays[0], Duration::from_millis(5));
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    assert!(delays.iter().all(|d| *d <= Duration::from_millis(12)));

    assert_eq!(calculate_backoff(0), Duration::from_secs(1));
    assert_eq!(calculate_backoff(5), Duration::from_secs(30));
    assert_eq!(calculate_backoff(40), Duration::from_secs(30));
}

#[test]
fn test_retry_limit_exhaustion_is_permanent() {
    let dir = TempDir::new().unwrap();
    let steps = [Step::Refuse; 6];
    let source = Arc::new(ScriptedSource::new().with_object(URL, image_bytes(1024, 2), &steps));
    let locator = SourceLocator::parse(URL).unwrap();

    let err = engine(source.clone(), fast().with_retry_limit(2), ShutdownCoordinator::shared())
        .fetch(&locator, &dir.path().join("app01.img"), true)
        .unwrap_err();

    assert!(matches!(err, TransferError::Permanent(_)), "{err}");
    assert!(!err.is_retryable());
    assert_eq!(source.open_offsets(URL).len(), 3);
}

#[test]
fn test_permanent_error_is_not_retried() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(ScriptedSource::new());
    let locator = SourceLocator::parse("https://mirror.test/missing.img").unwrap();

    let err = engine(source.clone(), fast(), ShutdownCoordinator::shared())
        .fetch(&locator, &dir.path().join("missing.img"), true)
        .unwrap_err();

    assert!(matches!(err, TransferError::Permanent(_)));
    assert_eq!(source.opens().len(), 1);
}

#[test]
fn test_shutdown_interrupts_backoff() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(ScriptedSource::new().with_object(URL, image_bytes(1024, 3), &[Step::Refuse; 4]));
    let locator = SourceLocator::parse(URL).unwrap();
    let shutdown = ShutdownCoordinator::shared();
    let config = fast().with_backoff(Duration::from_secs(30), Duration::from_secs(30));

    let stopper = {
        let shutdown = shutdown.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            shutdown.request_shutdown();
        })
    };
    let started = Instant::now();
    let err = engine(source, config, shutdown)
        .fetch(&locator, &dir.path().join("app01.img"), true)
        .unwrap_err();
    stopper.join().unwrap();

    assert!(matches!(err, TransferError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(10));
}
