//! Transfer configuration constants

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of retries after the first attempt.
/// 5 retries with exponential backoff rides out a short outage
/// while still failing a dead source within about a minute.
pub const DEFAULT_RETRY_LIMIT: u32 = 5;

/// Initial backoff delay in milliseconds.
pub const INITIAL_BACKOFF_MS: u64 = 1000; // 1 second

/// Maximum backoff delay in milliseconds.
/// Retry 5 would wait 32s; capped to 30s.
pub const MAX_BACKOFF_MS: u64 = 30000; // 30 seconds

/// Default chunk size for streaming to the partial file (8 MiB).
pub const DEFAULT_CHUNK_BYTES: usize = 8 * 1024 * 1024;

/// Default connect timeout for network sources.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default per-read timeout for network sources.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Minimum interval between progress callbacks.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Calculate exponential backoff delay with the default bounds
pub fn calculate_backoff(retry_count: u32) -> Duration {
    backoff_between(
        retry_count,
        Duration::from_millis(INITIAL_BACKOFF_MS),
        Duration::from_millis(MAX_BACKOFF_MS),
    )
}

fn backoff_between(retry_count: u32, initial: Duration, max: Duration) -> Duration {
    let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
    initial.saturating_mul(factor).min(max)
}

/// Settings for [`super::ResumableTransfer`] and the built-in sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Retries after the first attempt before a transient error becomes permanent
    pub retry_limit: u32,
    /// Bytes read from the source per chunk
    pub chunk_bytes: usize,
    /// First backoff delay
    pub initial_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
    /// Connect timeout for network sources
    pub connect_timeout: Duration,
    /// Per-read timeout for network sources
    pub read_timeout: Duration,
    /// Minimum interval between progress callbacks
    pub progress_interval: Duration,
    /// Look up a source-provided checksum when the job carries none
    pub verify_checksums: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            retry_limit: DEFAULT_RETRY_LIMIT,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            verify_checksums: true,
        }
    }
}

impl TransferConfig {
    /// Set the retry limit
    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// Set the chunk size
    pub fn with_chunk_bytes(mut self, chunk_bytes: usize) -> Self {
        self.chunk_bytes = chunk_bytes;
        self
    }

    /// Set the backoff bounds
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Set the network timeouts
    pub fn with_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.connect_timeout = connect;
        self.read_timeout = read;
        self
    }

    /// Set the progress callback interval
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Enable or disable sidecar checksum lookup
    pub fn with_verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    /// Total attempts allowed (first try plus retries)
    pub fn max_attempts(&self) -> u32 {
        self.retry_limit.saturating_add(1)
    }

    /// Backoff before retry number `retry_count` (0-based); never decreases
    pub fn backoff(&self, retry_count: u32) -> Duration {
        backoff_between(retry_count, self.initial_backoff, self.max_backoff)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_bytes == 0 {
            return Err("transfer chunk size must be greater than zero".to_string());
        }
        if self.initial_backoff > self.max_backoff {
            return Err(format!(
                "initial backoff {:?} exceeds max backoff {:?}",
                self.initial_backoff, self.max_backoff
            ));
        }
        Ok(())
    }
}
