//! Discovery adapters that turn a source descriptor into a job list
//!
//! - [`ManifestDiscovery`] reads a JSON manifest listing disk sources
//! - [`LocalDiscovery`] takes one image file, or every disk image in a directory

use super::{CollaboratorError, Discovery};
use crate::locator::to_filesystem_safe;
use crate::pipeline::DiskJob;
use crate::DiskFormat;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One entry of a manifest
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    /// Source locator (path or URL)
    pub source: String,
    /// Declared size in bytes
    #[serde(default)]
    pub size_bytes: Option<u64>,
    /// Format hint; guessed from the file name when absent
    #[serde(default)]
    pub format: Option<DiskFormat>,
    /// Expected SHA-256 of the source artifact
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Manifest file layout
///
/// ```json
/// {
///   "job_id": "dc1-wave3",
///   "disks": [
///     { "source": "https://exports.example.com/web01/disk0.vmdk", "size_bytes": 21474836480 },
///     { "source": "/mnt/exports/db01.qcow2", "format": "qcow2" }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    /// Batch identifier
    #[serde(default)]
    pub job_id: Option<String>,
    /// Disks in the batch
    pub disks: Vec<ManifestEntry>,
}

/// Discovery from a JSON manifest file
#[derive(Debug, Clone)]
pub struct ManifestDiscovery {
    path: PathBuf,
}

impl ManifestDiscovery {
    /// Discovery over the manifest at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read and parse the manifest
    pub fn load(&self) -> Result<Manifest, CollaboratorError> {
        let contents =
            std::fs::read_to_string(&self.path).map_err(|e| CollaboratorError::io(&self.path, e))?;
        let manifest: Manifest = serde_json::from_str(&contents).map_err(|e| {
            CollaboratorError::InvalidInput(format!(
                "invalid manifest {}: {e}",
                self.path.display()
            ))
        })?;
        if manifest.disks.is_empty() {
            return Err(CollaboratorError::InvalidInput(format!(
                "manifest {} lists no disks",
                self.path.display()
            )));
        }
        Ok(manifest)
    }
}

fn stem_job_id(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| to_filesystem_safe(&s.to_string_lossy()))
        .unwrap_or_default();
    if stem.is_empty() {
        "batch".to_string()
    } else {
        stem
    }
}

impl Discovery for ManifestDiscovery {
    fn name(&self) -> &str {
        "manifest"
    }

    fn default_job_id(&self) -> String {
        self.load()
            .ok()
            .and_then(|m| m.job_id)
            .unwrap_or_else(|| stem_job_id(&self.path))
    }

    fn discover(&self, job_id: &str, work_root: &Path) -> Result<Vec<DiskJob>, CollaboratorError> {
        let manifest = self.load()?;
        let mut jobs = Vec::with_capacity(manifest.disks.len());
        for (index, entry) in manifest.disks.into_iter().enumerate() {
            let mut job = DiskJob::new(job_id, &entry.source, work_root).map_err(|e| {
                CollaboratorError::InvalidInput(format!("manifest entry {index}: {e}"))
            })?;
            job = job
                .with_declared_size(entry.size_bytes)
                .with_expected_sha256(entry.sha256);
            if let Some(format) = entry.format {
                job = job.with_format_hint(format);
            }
            jobs.push(job);
        }
        info!(manifest = %self.path.display(), disks = jobs.len(), "Discovered disks from manifest");
        Ok(jobs)
    }
}

/// Discovery from a local image file or a directory of images
#[derive(Debug, Clone)]
pub struct LocalDiscovery {
    path: PathBuf,
}

impl LocalDiscovery {
    /// Discovery over `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn image_files(&self) -> Result<Vec<PathBuf>, CollaboratorError> {
        let meta = std::fs::metadata(&self.path).map_err(|e| CollaboratorError::io(&self.path, e))?;
        if meta.is_file() {
            return Ok(vec![self.path.clone()]);
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.path).map_err(|e| CollaboratorError::io(&self.path, e))? {
            let entry = entry.map_err(|e| CollaboratorError::io(&self.path, e))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if DiskFormat::from_file_name(&name) == DiskFormat::Unknown {
                debug!(file = %name, "Skipping non-disk file");
                continue;
            }
            files.push(path);
        }
        files.sort();
        Ok(files)
    }
}

impl Discovery for LocalDiscovery {
    fn name(&self) -> &str {
        "local"
    }

    fn default_job_id(&self) -> String {
        stem_job_id(&self.path)
    }

    fn discover(&self, job_id: &str, work_root: &Path) -> Result<Vec<DiskJob>, CollaboratorError> {
        let files = self.image_files()?;
        if files.is_empty() {
            return Err(CollaboratorError::InvalidInput(format!(
                "no disk images found in {}",
                self.path.display()
            )));
        }

        let mut jobs = Vec::with_capacity(files.len());
        for file in files {
            let absolute = std::fs::canonicalize(&file).map_err(|e| CollaboratorError::io(&file, e))?;
            let size = std::fs::metadata(&absolute)
                .map_err(|e| CollaboratorError::io(&absolute, e))?
                .len();
            let job = DiskJob::new(job_id, &absolute.to_string_lossy(), work_root)
                .map_err(|e| CollaboratorError::InvalidInput(e.to_string()))?
                .with_declared_size(Some(size));
            jobs.push(job);
        }
        info!(path = %self.path.display(), disks = jobs.len(), "Discovered local disks");
        Ok(jobs)
    }
}
