//! Chunked, retryable, resumable copy into a `.part` file
//!
//! The destination path only ever appears through a rename of the verified
//! partial file, so an observer sees either nothing or the complete object.
//! Interrupted transfers keep their `.part` file; a later resume re-hashes the
//! kept prefix from disk and asks the source for the remaining bytes only.

use super::classify::RetryContext;
use super::{SourceRegistry, TransferConfig, TransferError, TransferSource};
use crate::locator::SourceLocator;
use crate::metrics;
use crate::shutdown::SharedShutdown;
use crate::util::fsync_dir;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn};

/// Suffix of the partial file kept next to the destination
pub const PART_SUFFIX: &str = ".part";

/// Partial-file path for a destination (`disk.vmdk` → `disk.vmdk.part`)
pub fn temp_path_for(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

/// What to fetch, where to, and under which constraints
#[derive(Debug, Clone)]
pub struct TransferRequest<'a> {
    /// Source to read
    pub locator: &'a SourceLocator,
    /// Final path; only created by the verifying rename
    pub destination: &'a Path,
    /// Continue from an existing partial file
    pub resume: bool,
    /// Declared length; a source reporting a different length is rejected
    pub expected_len: Option<u64>,
    /// Expected SHA-256 (hex); falls back to the source's published checksum
    pub expected_sha256: Option<&'a str>,
    /// Give up (keeping the partial file) once this instant passes
    pub deadline: Option<Instant>,
}

impl<'a> TransferRequest<'a> {
    /// Resumable request with no declared length or checksum
    pub fn new(locator: &'a SourceLocator, destination: &'a Path) -> Self {
        Self {
            locator,
            destination,
            resume: true,
            expected_len: None,
            expected_sha256: None,
            deadline: None,
        }
    }

    /// Set whether an existing partial file is continued
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Set the declared length
    pub fn with_expected_len(mut self, len: Option<u64>) -> Self {
        self.expected_len = len;
        self
    }

    /// Set the expected checksum
    pub fn with_expected_sha256(mut self, sha256: Option<&'a str>) -> Self {
        self.expected_sha256 = sha256;
        self
    }

    /// Set the deadline
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }
}

/// Progress snapshot handed to the caller's callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    /// Bytes confirmed in the partial file
    pub bytes_so_far: u64,
    /// Object length, if known
    pub total_bytes: Option<u64>,
}

/// Outcome of a successful fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    /// Bytes read from the source by this call (excludes the resumed prefix)
    pub bytes_transferred: u64,
    /// The destination path, now complete
    pub final_path: PathBuf,
    /// SHA-256 of the final file (lowercase hex)
    pub checksum: Option<String>,
    /// Final file size
    pub total_bytes: u64,
    /// Attempts used, including the successful one
    pub attempts: u32,
    /// Offset the call resumed from (0 for a fresh transfer)
    pub resumed_from: u64,
    /// Backoff waited before each retry, in order
    pub retry_delays: Vec<Duration>,
}

/// Working set of one fetch
#[derive(Debug, Clone)]
pub struct TransferState {
    /// Source being read
    pub source_locator: SourceLocator,
    /// Final path
    pub destination_path: PathBuf,
    /// Partial file; the only place partial data lives
    pub temp_path: PathBuf,
    /// Bytes written to the partial file that form a prefix of the object
    pub bytes_confirmed: u64,
    /// Attempts started so far
    pub attempt_count: u32,
    /// Object length once known
    pub total_len: Option<u64>,
}

/// Streams a source into a partial file and renames it into place once verified
#[derive(Debug, Clone)]
pub struct ResumableTransfer {
    registry: Arc<SourceRegistry>,
    config: TransferConfig,
    shutdown: SharedShutdown,
}

impl ResumableTransfer {
    /// Create a transfer engine over a source registry
    pub fn new(registry: Arc<SourceRegistry>, config: TransferConfig, shutdown: SharedShutdown) -> Self {
        Self {
            registry,
            config,
            shutdown,
        }
    }

    /// Transfer configuration in use
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Fetch `locator` to `destination`, resuming a kept partial file if `resume` is set
    pub fn fetch(
        &self,
        locator: &SourceLocator,
        destination: &Path,
        resume: bool,
    ) -> Result<TransferResult, TransferError> {
        self.fetch_with(
            TransferRequest::new(locator, destination).with_resume(resume),
            &mut |_| {},
        )
    }

    /// Fetch with full request options and a progress callback
    ///
    /// # Errors
    ///
    /// - [`TransferError::Permanent`] for non-retryable failures, exhausted retries, or a checksum mismatch
    /// - [`TransferError::Cancelled`] / [`TransferError::DeadlineExceeded`] keep the partial file
    pub fn fetch_with(
        &self,
        request: TransferRequest<'_>,
        on_progress: &mut dyn FnMut(&TransferProgress),
    ) -> Result<TransferResult, TransferError> {
        let span = info_span!("transfer", source = %request.locator);
        let _enter = span.enter();

        let source = self.registry.resolve(request.locator)?;
        let mut state = TransferState {
            source_locator: request.locator.clone(),
            destination_path: request.destination.to_path_buf(),
            temp_path: temp_path_for(request.destination),
            bytes_confirmed: 0,
            attempt_count: 0,
            total_len: request.expected_len,
        };

        if let Some(parent) = request.destination.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TransferError::io(parent, e))?;
        }
        if !request.resume && state.temp_path.exists() {
            debug!(path = %state.temp_path.display(), "Discarding partial file (resume disabled)");
            std::fs::remove_file(&state.temp_path).map_err(|e| TransferError::io(&state.temp_path, e))?;
        }

        let expected_sha256 = self.expected_checksum(source.as_ref(), &request);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&state.temp_path)
            .map_err(|e| TransferError::io(&state.temp_path, e))?;

        let mut hasher = Sha256::new();
        let resumed_from = rehash_prefix(&mut file, &state.temp_path, &mut hasher)?;
        state.bytes_confirmed = resumed_from;
        if resumed_from > 0 {
            info!(offset = resumed_from, path = %state.temp_path.display(), "Resuming transfer from partial file");
        }

        let mut bytes_transferred = 0u64;
        let mut retry_delays = Vec::new();

        if !self.already_complete(source.as_ref(), &mut state) {
            loop {
                self.check_interrupts(&request, &state)?;
                state.attempt_count += 1;

                let result = self.attempt(
                    source.as_ref(),
                    &request,
                    &mut file,
                    &mut state,
                    &mut hasher,
                    &mut bytes_transferred,
                    on_progress,
                );
                let err = match result {
                    Ok(()) => break,
                    Err(err) => err,
                };

                let kind = match &err {
                    TransferError::Transient { kind, .. } if kind.is_retryable() => *kind,
                    _ => return Err(err),
                };

                let context = RetryContext {
                    attempt: state.attempt_count,
                    max_attempts: self.config.max_attempts(),
                    error_type: kind,
                    backoff_duration: self.config.backoff(state.attempt_count - 1),
                    bytes_confirmed: state.bytes_confirmed,
                    source: request.locator.to_string(),
                };

                if state.attempt_count >= self.config.max_attempts() {
                    let message = context.format_failure(&err.to_string());
                    warn!(attempts = state.attempt_count, "{message}");
                    return Err(TransferError::Permanent(message));
                }

                let backoff = context.backoff_duration;
                warn!(
                    attempt = state.attempt_count,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "{}",
                    context.format_retry()
                );
                metrics::record_retry_backoff(backoff, state.attempt_count);
                retry_delays.push(backoff);

                let wait = match request.deadline {
                    Some(deadline) => backoff.min(deadline.saturating_duration_since(Instant::now())),
                    None => backoff,
                };
                if !self.shutdown.sleep(wait) {
                    info!(bytes_confirmed = state.bytes_confirmed, "Transfer cancelled during backoff");
                    return Err(TransferError::Cancelled);
                }
            }
        }

        let checksum = finalize_digest(hasher);
        if let Some(expected) = expected_sha256 {
            if expected != checksum {
                drop(file);
                // The kept bytes are wrong somewhere; a resume would only reproduce the mismatch
                let _ = std::fs::remove_file(&state.temp_path);
                return Err(TransferError::Permanent(format!(
                    "checksum mismatch for {}: expected {expected}, got {checksum}",
                    request.locator
                )));
            }
            debug!(checksum = %checksum, "Checksum verified");
        }

        file.sync_all().map_err(|e| TransferError::io(&state.temp_path, e))?;
        drop(file);
        std::fs::rename(&state.temp_path, &state.destination_path)
            .map_err(|e| TransferError::io(&state.destination_path, e))?;
        if let Some(parent) = state.destination_path.parent() {
            fsync_dir(parent);
        }

        info!(
            path = %state.destination_path.display(),
            total_bytes = state.bytes_confirmed,
            bytes_transferred,
            attempts = state.attempt_count,
            resumed_from,
            "Transfer complete"
        );

        Ok(TransferResult {
            bytes_transferred,
            final_path: state.destination_path,
            checksum: Some(checksum),
            total_bytes: state.bytes_confirmed,
            attempts: state.attempt_count,
            resumed_from,
            retry_delays,
        })
    }

    fn expected_checksum(&self, source: &dyn TransferSource, request: &TransferRequest<'_>) -> Option<String> {
        if let Some(expected) = request.expected_sha256 {
            return Some(expected.trim().to_ascii_lowercase());
        }
        if !self.config.verify_checksums {
            return None;
        }
        match source.fetch_checksum(request.locator) {
            Ok(checksum) => checksum,
            Err(e) => {
                warn!(error = %e, "Could not fetch published checksum; continuing without");
                None
            }
        }
    }

    /// Partial file already holds the whole object according to a cheap probe
    fn already_complete(&self, source: &dyn TransferSource, state: &mut TransferState) -> bool {
        if state.bytes_confirmed == 0 {
            return false;
        }
        match source.probe_len(&state.source_locator) {
            Ok(Some(len)) if len == state.bytes_confirmed => {
                if state.total_len.is_some_and(|expected| expected != len) {
                    return false;
                }
                state.total_len = Some(len);
                debug!(len, "Partial file is already complete");
                true
            }
            Ok(_) => false,
            Err(e) => {
                debug!(error = %e, "Length probe failed; opening the source instead");
                false
            }
        }
    }

    fn check_interrupts(&self, request: &TransferRequest<'_>, state: &TransferState) -> Result<(), TransferError> {
        if self.shutdown.is_shutdown_requested() {
            info!(bytes_confirmed = state.bytes_confirmed, "Transfer cancelled; partial file kept");
            return Err(TransferError::Cancelled);
        }
        if request.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(TransferError::DeadlineExceeded {
                bytes_confirmed: state.bytes_confirmed,
            });
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn attempt(
        &self,
        source: &dyn TransferSource,
        request: &TransferRequest<'_>,
        file: &mut File,
        state: &mut TransferState,
        hasher: &mut Sha256,
        bytes_transferred: &mut u64,
        on_progress: &mut dyn FnMut(&TransferProgress),
    ) -> Result<(), TransferError> {
        let offset = state.bytes_confirmed;
        let stream = source.open(&state.source_locator, offset)?;

        if stream.start_offset != offset {
            if stream.start_offset != 0 {
                return Err(TransferError::Permanent(format!(
                    "source {} resumed at {} instead of {offset}",
                    source.name(),
                    stream.start_offset
                )));
            }
            info!(discarded = offset, "Source does not support byte ranges; restarting from zero");
            file.set_len(0).map_err(|e| TransferError::io(&state.temp_path, e))?;
            *hasher = Sha256::new();
            state.bytes_confirmed = 0;
        }
        file.seek(SeekFrom::Start(state.bytes_confirmed))
            .map_err(|e| TransferError::io(&state.temp_path, e))?;

        match (stream.total_len, state.total_len) {
            (Some(reported), Some(expected)) if reported != expected => {
                return Err(TransferError::Permanent(format!(
                    "source reports {reported} bytes but {expected} were declared"
                )));
            }
            (Some(reported), None) => state.total_len = Some(reported),
            _ => {}
        }

        let mut reader = stream.reader;
        let mut buffer = vec![0u8; self.config.chunk_bytes];
        let mut last_progress: Option<Instant> = None;

        loop {
            if let Err(e) = self.check_interrupts(request, state) {
                file.sync_data().map_err(|e| TransferError::io(&state.temp_path, e))?;
                return Err(e);
            }

            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    file.sync_data().map_err(|e| TransferError::io(&state.temp_path, e))?;
                    return Err(TransferError::transient(
                        super::RetryErrorType::from_io(&e),
                        format!("read failed after {} bytes: {e}", state.bytes_confirmed),
                    ));
                }
            };

            if let Some(total) = state.total_len {
                if state.bytes_confirmed + n as u64 > total {
                    return Err(TransferError::Permanent(format!(
                        "source sent more than the expected {total} bytes"
                    )));
                }
            }

            let chunk = &buffer[..n];
            file.write_all(chunk)
                .map_err(|e| TransferError::io(&state.temp_path, e))?;
            hasher.update(chunk);
            state.bytes_confirmed += n as u64;
            *bytes_transferred += n as u64;
            metrics::record_transfer_bytes(n as u64);

            if last_progress.map_or(true, |t| t.elapsed() >= self.config.progress_interval) {
                on_progress(&TransferProgress {
                    bytes_so_far: state.bytes_confirmed,
                    total_bytes: state.total_len,
                });
                last_progress = Some(Instant::now());
            }
        }

        file.flush().map_err(|e| TransferError::io(&state.temp_path, e))?;
        file.sync_data().map_err(|e| TransferError::io(&state.temp_path, e))?;
        on_progress(&TransferProgress {
            bytes_so_far: state.bytes_confirmed,
            total_bytes: state.total_len,
        });

        if let Some(total) = state.total_len {
            if state.bytes_confirmed < total {
                return Err(TransferError::transient(
                    super::RetryErrorType::Truncated,
                    format!(
                        "stream ended after {} of {total} bytes",
                        state.bytes_confirmed
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Hash the existing partial file and leave the cursor at its end
fn rehash_prefix(file: &mut File, path: &Path, hasher: &mut Sha256) -> Result<u64, TransferError> {
    file.seek(SeekFrom::Start(0)).map_err(|e| TransferError::io(path, e))?;
    let mut buffer = vec![0u8; 1024 * 1024];
    let mut total = 0u64;
    loop {
        let n = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransferError::io(path, e)),
        };
        hasher.update(&buffer[..n]);
        total += n as u64;
    }
    Ok(total)
}

fn finalize_digest(hasher: Sha256) -> String {
    format!("{:x}", hasher.finalize())
}
