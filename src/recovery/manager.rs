//! Recovery store: one durable record per `(job_id, disk_id, stage)`
//!
//! Layout under the store root:
//!
//! ```text
//! store.json                       schema marker
//! .store.lock                      advisory process lock
//! jobs/<job_id>/<disk_id>/<stage>.json
//! ```
//!
//! Records are written to a temp file in the same directory, synced, and
//! renamed over the target, so a reader never observes a torn record.

use super::checkpoint::{Checkpoint, CheckpointStatus, SCHEMA_VERSION};
use super::lock::StoreLock;
use super::RecoveryError;
use crate::util::{fsync_dir, write_atomic};
use crate::Stage;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Directory holding the per-job record trees
const RECORDS_DIR: &str = "jobs";

/// Schema marker file
const MARKER_FILE: &str = "store.json";

/// Maximum allowed record size (1 MiB); anything larger is not a checkpoint
pub const MAX_RECORD_SIZE: u64 = 1024 * 1024;

/// Number of mutexes serializing record updates; keys share them by hash
const KEY_LOCK_STRIPES: usize = 64;

#[derive(Debug, Serialize, Deserialize)]
struct StoreMarker {
    schema_version: String,
    created_at: i64,
}

/// Outcome of [`RecoveryManager::verify`]
#[derive(Debug, Default)]
pub struct VerifyReport {
    /// Records that parsed and matched their location
    pub valid: usize,
    /// Completed records whose output no longer exists
    pub stale: usize,
    /// Records that could not be trusted, with the reason
    pub invalid: Vec<(PathBuf, String)>,
}

impl VerifyReport {
    /// Whether every record is readable
    pub fn is_clean(&self) -> bool {
        self.invalid.is_empty()
    }
}

/// Thread-safe, crash-consistent checkpoint store
#[derive(Debug)]
pub struct RecoveryManager {
    root: PathBuf,
    key_locks: Vec<Mutex<()>>,
    // None for read-only handles
    lock: Option<StoreLock>,
}

impl RecoveryManager {
    /// Open (or initialize) a store and validate every record in it
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::Corruption`] if the marker or any record is
    /// unreadable; absence of state is only accepted for a brand-new store.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, RecoveryError> {
        let root = root.into();
        if root.exists() && !root.is_dir() {
            return Err(RecoveryError::corruption(&root, "store path is not a directory"));
        }

        let lock = StoreLock::try_acquire(&root)?;

        let marker_path = root.join(MARKER_FILE);
        let records_root = root.join(RECORDS_DIR);
        if marker_path.exists() {
            let marker = read_marker(&marker_path)?;
            if marker.schema_version != SCHEMA_VERSION {
                return Err(RecoveryError::SchemaVersionMismatch {
                    path: marker_path,
                    expected: SCHEMA_VERSION.to_string(),
                    found: marker.schema_version,
                });
            }
        } else {
            if dir_has_entries(&records_root)? {
                return Err(RecoveryError::corruption(
                    &marker_path,
                    "records present but store marker is missing",
                ));
            }
            let marker = StoreMarker {
                schema_version: SCHEMA_VERSION.to_string(),
                created_at: chrono::Utc::now().timestamp_millis(),
            };
            let json = serde_json::to_string_pretty(&marker)
                .map_err(|e| RecoveryError::Serialization(e.to_string()))?;
            write_atomic(&marker_path, json.as_bytes())
                .map_err(|e| RecoveryError::io(&marker_path, e))?;
            info!(path = %root.display(), "Initialized new recovery store");
        }

        std::fs::create_dir_all(&records_root).map_err(|e| RecoveryError::io(&records_root, e))?;

        let manager = Self::with_lock(root, Some(lock));
        let record_count = manager.scan()?;
        info!(
            path = %manager.root.display(),
            records = record_count,
            "Recovery store opened"
        );
        Ok(manager)
    }

    /// Open an existing store for reading only
    ///
    /// Validates the marker and every record like [`open`](Self::open) but
    /// creates nothing, takes no lock and leaves leftover temp files alone.
    /// A directory without a marker and without records reads as empty.
    /// Every write through the returned handle fails with
    /// [`RecoveryError::ReadOnly`].
    pub fn open_read_only(root: impl Into<PathBuf>) -> Result<Self, RecoveryError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(RecoveryError::corruption(&root, "store path is not a directory"));
        }

        let marker_path = root.join(MARKER_FILE);
        if marker_path.exists() {
            let marker = read_marker(&marker_path)?;
            if marker.schema_version != SCHEMA_VERSION {
                return Err(RecoveryError::SchemaVersionMismatch {
                    path: marker_path,
                    expected: SCHEMA_VERSION.to_string(),
                    found: marker.schema_version,
                });
            }
        } else if dir_has_entries(&root.join(RECORDS_DIR))? {
            return Err(RecoveryError::corruption(
                &marker_path,
                "records present but store marker is missing",
            ));
        }

        let manager = Self::with_lock(root, None);
        let record_count = manager.scan()?;
        debug!(
            path = %manager.root.display(),
            records = record_count,
            "Recovery store opened read-only"
        );
        Ok(manager)
    }

    fn with_lock(root: PathBuf, lock: Option<StoreLock>) -> Self {
        Self {
            root,
            key_locks: (0..KEY_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            lock,
        }
    }

    /// Whether writes through this handle are refused
    pub fn is_read_only(&self) -> bool {
        self.lock.is_none()
    }

    fn ensure_writable(&self) -> Result<(), RecoveryError> {
        if self.is_read_only() {
            return Err(RecoveryError::ReadOnly(self.root.clone()));
        }
        Ok(())
    }

    /// Store root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Record `in_progress` for a stage
    ///
    /// Idempotent: calling it again before the stage finishes returns the
    /// existing record without counting another attempt.
    pub fn begin(&self, job_id: &str, disk_id: &str, stage: Stage) -> Result<Checkpoint, RecoveryError> {
        self.ensure_writable()?;
        let path = self.record_path(job_id, disk_id, stage)?;
        let _guard = self.key_lock(job_id, disk_id).lock().unwrap_or_else(|e| e.into_inner());

        let existing = read_record(&path)?;
        if let Some(cp) = existing.as_ref().filter(|cp| cp.status() == CheckpointStatus::InProgress) {
            debug!(job_id, disk_id, stage = %stage, "Stage already marked in progress");
            return Ok(cp.clone());
        }

        let checkpoint = existing
            .unwrap_or_else(|| Checkpoint::pending(job_id, disk_id, stage))
            .start();
        write_record(&path, &checkpoint)?;
        debug!(job_id, disk_id, stage = %stage, attempts = checkpoint.attempts(), "Stage started");
        Ok(checkpoint)
    }

    /// Record `completed` with the stage's output artifact
    pub fn complete(
        &self,
        job_id: &str,
        disk_id: &str,
        stage: Stage,
        output_path: &Path,
    ) -> Result<Checkpoint, RecoveryError> {
        self.finish(job_id, disk_id, stage, |cp| cp.complete(output_path))
    }

    /// Record `failed` with an error summary
    pub fn fail(
        &self,
        job_id: &str,
        disk_id: &str,
        stage: Stage,
        error: &str,
    ) -> Result<Checkpoint, RecoveryError> {
        self.finish(job_id, disk_id, stage, |cp| cp.fail(error))
    }

    fn finish(
        &self,
        job_id: &str,
        disk_id: &str,
        stage: Stage,
        transition: impl FnOnce(Checkpoint) -> Checkpoint,
    ) -> Result<Checkpoint, RecoveryError> {
        self.ensure_writable()?;
        let path = self.record_path(job_id, disk_id, stage)?;
        let _guard = self.key_lock(job_id, disk_id).lock().unwrap_or_else(|e| e.into_inner());

        let base = match read_record(&path)? {
            Some(cp) => cp,
            None => Checkpoint::pending(job_id, disk_id, stage).start(),
        };
        let checkpoint = transition(base);
        write_record(&path, &checkpoint)?;
        debug!(job_id, disk_id, stage = %stage, status = %checkpoint.status(), "Stage finished");
        Ok(checkpoint)
    }

    /// Load the record for a key, if any
    pub fn get(&self, job_id: &str, disk_id: &str, stage: Stage) -> Result<Option<Checkpoint>, RecoveryError> {
        let path = self.record_path(job_id, disk_id, stage)?;
        read_record(&path)
    }

    /// Whether a stage is provably done
    ///
    /// True only if a `completed` record exists **and** its output still exists
    /// on disk with non-zero size. An unreadable record counts as not done.
    pub fn is_complete(&self, job_id: &str, disk_id: &str, stage: Stage) -> bool {
        self.completed_output(job_id, disk_id, stage).is_some()
    }

    /// Output of a provably completed stage
    pub fn completed_output(&self, job_id: &str, disk_id: &str, stage: Stage) -> Option<PathBuf> {
        match self.get(job_id, disk_id, stage) {
            Ok(Some(cp)) if cp.is_trustworthy_completion() => cp.output_path().map(Path::to_path_buf),
            Ok(Some(cp)) if cp.status() == CheckpointStatus::Completed => {
                warn!(
                    job_id,
                    disk_id,
                    stage = %stage,
                    output = ?cp.output_path(),
                    "Completed checkpoint has no output on disk; stage will be redone"
                );
                None
            }
            Ok(_) => None,
            Err(e) => {
                warn!(job_id, disk_id, stage = %stage, error = %e, "Unreadable checkpoint; stage will be redone");
                None
            }
        }
    }

    /// All records for a batch, ordered by disk then stage
    pub fn records_for_job(&self, job_id: &str) -> Result<Vec<Checkpoint>, RecoveryError> {
        validate_key_component(job_id)?;
        let job_dir = self.root.join(RECORDS_DIR).join(job_id);
        if !job_dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for disk_dir in sorted_entries(&job_dir)? {
            if !disk_dir.is_dir() {
                continue;
            }
            for record_path in sorted_entries(&disk_dir)? {
                if !is_record_file(&record_path) {
                    continue;
                }
                if let Some(cp) = read_record(&record_path)? {
                    records.push(cp);
                }
            }
        }

        records.sort_by(|a, b| {
            a.disk_id()
                .cmp(b.disk_id())
                .then_with(|| a.stage().cmp(&b.stage()))
        });
        Ok(records)
    }

    /// Batch identifiers present in the store
    pub fn job_ids(&self) -> Result<Vec<String>, RecoveryError> {
        let records_root = self.root.join(RECORDS_DIR);
        Ok(sorted_entries(&records_root)?
            .into_iter()
            .filter(|p| p.is_dir())
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect())
    }

    /// Check every record without failing on the first bad one
    pub fn verify(&self) -> Result<VerifyReport, RecoveryError> {
        let mut report = VerifyReport::default();
        self.walk_records(|path, result| match result {
            Ok(cp) => {
                report.valid += 1;
                if cp.status() == CheckpointStatus::Completed && !cp.output_is_present() {
                    report.stale += 1;
                }
            }
            Err(e) => report.invalid.push((path.to_path_buf(), e.to_string())),
        })?;
        Ok(report)
    }

    /// Delete every record of a batch; returns the number removed
    pub fn reset_job(&self, job_id: &str) -> Result<usize, RecoveryError> {
        self.ensure_writable()?;
        validate_key_component(job_id)?;
        let job_dir = self.root.join(RECORDS_DIR).join(job_id);
        if !job_dir.exists() {
            return Ok(0);
        }

        let mut count = 0;
        for disk_dir in sorted_entries(&job_dir)? {
            if disk_dir.is_dir() {
                count += sorted_entries(&disk_dir)?
                    .iter()
                    .filter(|p| is_record_file(p))
                    .count();
            }
        }
        std::fs::remove_dir_all(&job_dir).map_err(|e| RecoveryError::io(&job_dir, e))?;
        fsync_dir(&self.root.join(RECORDS_DIR));
        info!(job_id, records = count, "Reset recovery records for job");
        Ok(count)
    }

    /// Validate every record at startup; the first bad one aborts
    fn scan(&self) -> Result<usize, RecoveryError> {
        let mut count = 0;
        let mut first_error = None;
        self.walk_records(|_, result| match result {
            Ok(_) => count += 1,
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        })?;
        match first_error {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    fn walk_records(
        &self,
        mut visit: impl FnMut(&Path, Result<Checkpoint, RecoveryError>),
    ) -> Result<(), RecoveryError> {
        let records_root = self.root.join(RECORDS_DIR);
        for job_dir in sorted_entries(&records_root)? {
            if !job_dir.is_dir() {
                continue;
            }
            for disk_dir in sorted_entries(&job_dir)? {
                if !disk_dir.is_dir() {
                    continue;
                }
                for path in sorted_entries(&disk_dir)? {
                    if is_leftover_temp(&path) {
                        if self.is_read_only() {
                            continue;
                        }
                        debug!(path = %path.display(), "Removing leftover temp file");
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    if !is_record_file(&path) {
                        continue;
                    }
                    let result = load_and_check(&path, &job_dir, &disk_dir);
                    visit(&path, result);
                }
            }
        }
        Ok(())
    }

    fn record_path(&self, job_id: &str, disk_id: &str, stage: Stage) -> Result<PathBuf, RecoveryError> {
        validate_key_component(job_id)?;
        validate_key_component(disk_id)?;
        Ok(self
            .root
            .join(RECORDS_DIR)
            .join(job_id)
            .join(disk_id)
            .join(format!("{}.json", stage.as_str())))
    }

    fn key_lock(&self, job_id: &str, disk_id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        (job_id, disk_id).hash(&mut hasher);
        &self.key_locks[(hasher.finish() % KEY_LOCK_STRIPES as u64) as usize]
    }
}

/// Reject identifiers that would escape or alias a directory
pub(crate) fn validate_key_component(component: &str) -> Result<(), RecoveryError> {
    if component.is_empty()
        || component.starts_with('.')
        || component.contains(['/', '\\', '\0'])
    {
        return Err(RecoveryError::InvalidKey(format!("{component:?}")));
    }
    Ok(())
}

fn is_record_file(path: &Path) -> bool {
    path.is_file()
        && path.extension().is_some_and(|ext| ext == "json")
        && !path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().starts_with('.'))
}

fn is_leftover_temp(path: &Path) -> bool {
    path.is_file()
        && path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().starts_with(".tmp"))
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, RecoveryError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| RecoveryError::corruption(dir, e.to_string()))? {
        let entry = entry.map_err(|e| RecoveryError::corruption(dir, e.to_string()))?;
        entries.push(entry.path());
    }
    entries.sort();
    Ok(entries)
}

fn dir_has_entries(dir: &Path) -> Result<bool, RecoveryError> {
    Ok(!sorted_entries(dir)?.is_empty())
}

fn read_marker(path: &Path) -> Result<StoreMarker, RecoveryError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| RecoveryError::corruption(path, format!("unreadable store marker: {e}")))?;
    serde_json::from_str(&contents)
        .map_err(|e| RecoveryError::corruption(path, format!("invalid store marker: {e}")))
}

/// Load a record and check it describes the key its location implies
fn load_and_check(path: &Path, job_dir: &Path, disk_dir: &Path) -> Result<Checkpoint, RecoveryError> {
    let checkpoint = read_record(path)?
        .ok_or_else(|| RecoveryError::corruption(path, "record disappeared during scan"))?;

    let dir_name = |p: &Path| p.file_name().map(|n| n.to_string_lossy().into_owned());
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned());
    let stage_matches = stem
        .as_deref()
        .and_then(|s| Stage::from_str(s).ok())
        .is_some_and(|stage| stage == checkpoint.stage());

    if dir_name(job_dir).as_deref() != Some(checkpoint.job_id())
        || dir_name(disk_dir).as_deref() != Some(checkpoint.disk_id())
        || !stage_matches
    {
        return Err(RecoveryError::corruption(
            path,
            format!(
                "record describes {}/{}/{} but is stored elsewhere",
                checkpoint.job_id(),
                checkpoint.disk_id(),
                checkpoint.stage()
            ),
        ));
    }
    Ok(checkpoint)
}

fn read_record(path: &Path) -> Result<Option<Checkpoint>, RecoveryError> {
    let metadata = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(RecoveryError::corruption(path, e.to_string())),
    };
    if metadata.len() > MAX_RECORD_SIZE {
        return Err(RecoveryError::RecordTooLarge {
            path: path.to_path_buf(),
            size: metadata.len(),
            max: MAX_RECORD_SIZE,
        });
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| RecoveryError::corruption(path, format!("unreadable record: {e}")))?;
    let checkpoint: Checkpoint = serde_json::from_str(&contents).map_err(|e| {
        warn!(path = %path.display(), error = %e, "Failed to deserialize checkpoint");
        RecoveryError::corruption(path, format!("invalid record: {e}"))
    })?;

    if checkpoint.schema_version() != SCHEMA_VERSION {
        return Err(RecoveryError::SchemaVersionMismatch {
            path: path.to_path_buf(),
            expected: SCHEMA_VERSION.to_string(),
            found: checkpoint.schema_version().to_string(),
        });
    }
    Ok(Some(checkpoint))
}

fn write_record(path: &Path, checkpoint: &Checkpoint) -> Result<(), RecoveryError> {
    let json = serde_json::to_string_pretty(checkpoint)
        .map_err(|e| RecoveryError::Serialization(e.to_string()))?;
    write_atomic(path, json.as_bytes()).map_err(|e| RecoveryError::io(path, e))
}
