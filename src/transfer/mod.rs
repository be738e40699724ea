//! Resumable transfers and the sources they read from
//!
//! A [`TransferSource`] knows how to open a byte stream for one kind of
//! [`SourceLocator`] starting at an offset. [`ResumableTransfer`] drives a
//! source into a `.part` file, retrying transient failures with backoff, and
//! only renames the file into place once its length and checksum check out.

use crate::locator::SourceLocator;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod classify;
pub mod config;
pub mod file;
pub mod http;
pub mod resumable;

pub use classify::RetryErrorType;
pub use config::{calculate_backoff, TransferConfig};
pub use file::LocalFileSource;
pub use http::HttpSource;
pub use resumable::{
    temp_path_for, ResumableTransfer, TransferProgress, TransferRequest, TransferResult,
    TransferState,
};

/// Transfer errors
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// Retryable failure (timeout, reset, 429, 5xx, short body)
    #[error("transient transfer error ({}): {message}", kind.description())]
    Transient {
        /// Classification used for the retry decision
        kind: RetryErrorType,
        /// Error details
        message: String,
    },

    /// Failure that retrying will not fix
    #[error("permanent transfer error: {0}")]
    Permanent(String),

    /// A cooperative stop was honored
    #[error("transfer cancelled")]
    Cancelled,

    /// The caller's deadline passed
    #[error("transfer deadline exceeded after {bytes_confirmed} bytes")]
    DeadlineExceeded {
        /// Bytes kept in the partial file
        bytes_confirmed: u64,
    },

    /// Local I/O error on the partial or final file
    #[error("IO error on {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

impl TransferError {
    /// Build a transient error
    pub fn transient(kind: RetryErrorType, message: impl Into<String>) -> Self {
        TransferError::Transient {
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        TransferError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether the retry loop should try again
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Transient { kind, .. } if kind.is_retryable())
    }
}

/// An open byte stream from a source
pub struct SourceStream {
    /// Bytes from `start_offset` to the end of the object
    pub reader: Box<dyn Read + Send>,
    /// Offset the stream actually starts at; 0 when the source ignored the requested range
    pub start_offset: u64,
    /// Full object length, if the source knows it
    pub total_len: Option<u64>,
}

impl std::fmt::Debug for SourceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceStream")
            .field("start_offset", &self.start_offset)
            .field("total_len", &self.total_len)
            .finish_non_exhaustive()
    }
}

/// Capability interface for one kind of transfer source
pub trait TransferSource: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Whether this source can read the locator
    fn supports(&self, locator: &SourceLocator) -> bool;

    /// Object length without reading it, if cheaply known
    fn probe_len(&self, locator: &SourceLocator) -> Result<Option<u64>, TransferError>;

    /// Open a stream starting at `offset`
    ///
    /// A source that cannot seek returns a stream with `start_offset == 0`;
    /// the caller then restarts from zero.
    fn open(&self, locator: &SourceLocator, offset: u64) -> Result<SourceStream, TransferError>;

    /// Expected SHA-256 (lowercase hex) published alongside the object
    fn fetch_checksum(&self, _locator: &SourceLocator) -> Result<Option<String>, TransferError> {
        Ok(None)
    }
}

/// Lookup table of transfer sources, resolved by locator kind
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: Vec<Arc<dyn TransferSource>>,
}

impl SourceRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in local-file and HTTP sources
    pub fn with_defaults(config: &TransferConfig) -> Result<Self, TransferError> {
        Ok(Self::new()
            .with_source(Arc::new(LocalFileSource::new()))
            .with_source(Arc::new(HttpSource::new(config)?)))
    }

    /// Add a source; earlier registrations win when several support a locator
    pub fn with_source(mut self, source: Arc<dyn TransferSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Find the source for a locator
    pub fn resolve(&self, locator: &SourceLocator) -> Result<Arc<dyn TransferSource>, TransferError> {
        self.sources
            .iter()
            .find(|source| source.supports(locator))
            .cloned()
            .ok_or_else(|| {
                TransferError::Permanent(format!(
                    "no transfer source supports {} locators ({locator})",
                    locator.scheme()
                ))
            })
    }

    /// Names of the registered sources, in resolution order
    pub fn names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|s| s.name()).collect()
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.names())
            .finish()
    }
}

/// Parse the first token of a `.sha256` sidecar as a SHA-256 hex digest
pub(crate) fn parse_checksum_sidecar(contents: &str) -> Option<String> {
    let token = contents.split_whitespace().next()?;
    if token.len() == 64 && token.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(token.to_ascii_lowercase())
    } else {
        None
    }
}
