//! Shared fixtures: a scripted transfer source, in-process collaborators and
//! batch helpers, so pipeline scenarios run without network or qemu-img.

#![allow(dead_code)]

use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vdisk_migrator::collaborators::{
    BootProfile, BootValidator, CollaboratorError, CollaboratorRegistry, ConvertOptions, ConvertResult,
    ExecContext, FixReport, FormatConverter, GuestFacts, GuestFixer, ValidationResult,
};
use vdisk_migrator::locator::SourceLocator;
use vdisk_migrator::pipeline::{DiskJob, PipelineConfig, ProgressObserver};
use vdisk_migrator::transfer::{RetryErrorType, SourceStream, TransferError, TransferSource};
use vdisk_migrator::{DiskFormat, Stage};

/// Deterministic, non-magic image content
pub fn image_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u64 * 31 + seed as u64 * 7) % 251) as u8 + 1)
        .collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Config tuned for tests: small chunks and millisecond backoff
pub fn fast_config(root: &Path) -> PipelineConfig {
    PipelineConfig::new(root.join("store"), root.join("work"))
        .with_transfer_chunk_bytes(16 * 1024)
        .with_transfer_backoff(Duration::from_millis(5), Duration::from_millis(20))
        .with_verify_checksums(false)
        .with_enabled_stages([Stage::Fetch, Stage::Flatten, Stage::Inspect, Stage::Convert])
}

/// One local raw image per name, each with its own job
pub fn local_jobs(root: &Path, names: &[&str], len: usize) -> Vec<DiskJob> {
    let source_dir = root.join("sources");
    std::fs::create_dir_all(&source_dir).unwrap();
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let path = source_dir.join(format!("{name}.img"));
            std::fs::write(&path, image_bytes(len, i as u8)).unwrap();
            DiskJob::new("batch", &path.to_string_lossy(), &root.join("work")).unwrap()
        })
        .collect()
}

/// What one `open` call does
#[derive(Debug, Clone, Copy)]
pub enum Step {
    /// Serve the rest of the object
    Serve,
    /// Serve this many bytes, then fail with a connection reset
    ResetAfter(usize),
    /// Refuse the connection
    Refuse,
}

/// In-memory source that plays a script of failures per object
#[derive(Default)]
pub struct ScriptedSource {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    opens: Mutex<Vec<(String, u64)>>,
    advertise_len: bool,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self {
            advertise_len: true,
            ..Self::default()
        }
    }

    /// Register an object under `url`; steps run in order, then every open serves
    pub fn with_object(self, url: &str, data: Vec<u8>, steps: &[Step]) -> Self {
        self.objects.lock().unwrap().insert(url.to_string(), data);
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), steps.iter().copied().collect());
        self
    }

    /// Replace the remaining script of `url`
    pub fn rescript(&self, url: &str, steps: &[Step]) {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), steps.iter().copied().collect());
    }

    /// Offsets requested so far, per open call
    pub fn opens(&self) -> Vec<(String, u64)> {
        self.opens.lock().unwrap().clone()
    }

    pub fn open_offsets(&self, url: &str) -> Vec<u64> {
        self.opens()
            .into_iter()
            .filter(|(u, _)| u == url)
            .map(|(_, offset)| offset)
            .collect()
    }
}

/// Reader that fails with a reset after serving its slice
struct FailingReader {
    data: io::Cursor<Vec<u8>>,
    fail_at_end: bool,
}

impl Read for FailingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.data.read(buf)?;
        if n == 0 && self.fail_at_end {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"));
        }
        Ok(n)
    }
}

impl TransferSource for ScriptedSource {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn supports(&self, _locator: &SourceLocator) -> bool {
        true
    }

    fn probe_len(&self, locator: &SourceLocator) -> Result<Option<u64>, TransferError> {
        let objects = self.objects.lock().unwrap();
        Ok(objects.get(&locator.to_string()).map(|d| d.len() as u64))
    }

    fn open(&self, locator: &SourceLocator, offset: u64) -> Result<SourceStream, TransferError> {
        let url = locator.to_string();
        self.opens.lock().unwrap().push((url.clone(), offset));
        let data = self
            .objects
            .lock()
            .unwrap()
            .get(&url)
            .cloned()
            .ok_or_else(|| TransferError::Permanent(format!("no such object {url}")))?;
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&url)
            .and_then(|steps| steps.pop_front())
            .unwrap_or(Step::Serve);

        let rest = data[offset as usize..].to_vec();
        let (slice, fail_at_end) = match step {
            Step::Refuse => {
                return Err(TransferError::transient(
                    RetryErrorType::NetworkOffline,
                    "connection refused",
                ))
            }
            Step::Serve => (rest, false),
            Step::ResetAfter(n) => (rest[..n.min(rest.len())].to_vec(), true),
        };
        Ok(SourceStream {
            reader: Box::new(FailingReader {
                data: io::Cursor::new(slice),
                fail_at_end,
            }),
            start_offset: offset,
            total_len: if self.advertise_len {
                Some(data.len() as u64)
            } else {
                None
            },
        })
    }
}

/// Converter that copies the input and tracks how many run at once
#[derive(Default)]
pub struct CopyConverter {
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub delay: Duration,
    /// Disk ids starting with this prefix fail
    pub fail_prefix: Option<String>,
    /// When set, only disk ids starting with this prefix are delayed
    pub slow_prefix: Option<String>,
}

impl CopyConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn slow_for(mut self, prefix: &str) -> Self {
        self.slow_prefix = Some(prefix.to_string());
        self
    }

    pub fn failing_for(mut self, prefix: &str) -> Self {
        self.fail_prefix = Some(prefix.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FormatConverter for CopyConverter {
    fn name(&self) -> &str {
        "copy-converter"
    }

    fn supports(&self, _format: DiskFormat) -> bool {
        true
    }

    fn convert(
        &self,
        src_path: &Path,
        dst_path: &Path,
        _target_format: DiskFormat,
        _options: &ConvertOptions,
        ctx: &ExecContext,
    ) -> Result<ConvertResult, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let slow = self
            .slow_prefix
            .as_deref()
            .map_or(true, |prefix| ctx.disk_id.starts_with(prefix));
        if slow {
            std::thread::sleep(self.delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(prefix) = &self.fail_prefix {
            if ctx.disk_id.starts_with(prefix.as_str()) {
                return Err(CollaboratorError::failed(self.name(), "unsupported controller"));
            }
        }
        let bytes = std::fs::read(src_path).map_err(|e| CollaboratorError::failed(self.name(), e.to_string()))?;
        std::fs::write(dst_path, &bytes).map_err(|e| CollaboratorError::failed(self.name(), e.to_string()))?;
        Ok(ConvertResult {
            output_path: dst_path.to_path_buf(),
            size_bytes: bytes.len() as u64,
        })
    }
}

/// Fixer that records which images it was handed
#[derive(Default)]
pub struct RecordingFixer {
    pub seen: Mutex<Vec<PathBuf>>,
}

impl GuestFixer for RecordingFixer {
    fn name(&self) -> &str {
        "recording-fixer"
    }

    fn supports(&self, _format: DiskFormat) -> bool {
        true
    }

    fn fix(&self, disk_path: &Path, _facts: &GuestFacts, _ctx: &ExecContext) -> Result<FixReport, CollaboratorError> {
        self.seen.lock().unwrap().push(disk_path.to_path_buf());
        Ok(FixReport {
            changed: true,
            warnings: vec!["initramfs rebuilt".to_string()],
        })
    }
}

/// Validator with a fixed verdict
pub struct FixedValidator {
    pub booted: bool,
}

impl BootValidator for FixedValidator {
    fn name(&self) -> &str {
        "fixed-validator"
    }

    fn supports(&self, _format: DiskFormat) -> bool {
        true
    }

    fn validate(
        &self,
        _image_path: &Path,
        _profile: &BootProfile,
        _ctx: &ExecContext,
    ) -> Result<ValidationResult, CollaboratorError> {
        Ok(ValidationResult {
            booted: self.booted,
            detail: if self.booted {
                "login prompt reached".to_string()
            } else {
                "no bootable device".to_string()
            },
        })
    }
}

pub fn registry_with(converter: Arc<CopyConverter>) -> CollaboratorRegistry {
    CollaboratorRegistry::new().with_converter(converter)
}

/// Observer that checks a stage's output never appears before the stage finishes
#[derive(Default)]
pub struct VisibilityObserver {
    pub work_root: PathBuf,
    pub checks: AtomicUsize,
    pub violations: Mutex<Vec<String>>,
}

impl VisibilityObserver {
    pub fn new(work_root: &Path) -> Self {
        Self {
            work_root: work_root.to_path_buf(),
            ..Self::default()
        }
    }
}

impl ProgressObserver for VisibilityObserver {
    fn bytes(&self, job_id: &str, disk_id: &str, stage: Stage, _done: u64, _total: Option<u64>) {
        let work_dir = self.work_root.join(job_id).join(disk_id);
        let output = match stage {
            Stage::Fetch => work_dir.join("source.img"),
            Stage::Flatten => work_dir.join("flat.img"),
            _ => return,
        };
        self.checks.fetch_add(1, Ordering::SeqCst);
        if output.exists() {
            self.violations
                .lock()
                .unwrap()
                .push(format!("{} visible during {stage}", output.display()));
        }
    }
}
