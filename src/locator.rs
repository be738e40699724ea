//! Source locator parsing and disk identifier derivation
//!
//! A locator is either a URL (`http://`, `https://`, `file://`) or a plain
//! filesystem path. The derived disk identifier is stable for a given locator,
//! which is what makes it usable as a resume key across process restarts.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

/// Maximum length of the human-readable part of a disk identifier
const DISK_ID_STEM_MAX: usize = 40;

/// Number of hex digits of the locator hash appended to a disk identifier
const DISK_ID_HASH_LEN: usize = 12;

/// Where a disk's source artifact lives
///
/// # Examples
///
/// ```
/// use vdisk_migrator::locator::SourceLocator;
///
/// let loc = SourceLocator::parse("https://images.example.com/vm1/disk0.vmdk").unwrap();
/// assert_eq!(loc.scheme(), "https");
/// assert_eq!(loc.file_name().as_deref(), Some("disk0.vmdk"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SourceLocator {
    /// Path on a locally mounted filesystem
    Local(PathBuf),
    /// HTTP(S) URL
    Http(String),
}

impl SourceLocator {
    /// Parse a locator string
    ///
    /// # Errors
    ///
    /// Returns an error for empty input, an unsupported scheme, or a URL without a host.
    pub fn parse(s: &str) -> Result<Self, LocatorError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(LocatorError::Empty);
        }

        if let Some(rest) = s.strip_prefix("file://") {
            if rest.is_empty() {
                return Err(LocatorError::InvalidFormat(
                    "file:// locator has no path".to_string(),
                ));
            }
            return Ok(SourceLocator::Local(PathBuf::from(rest)));
        }

        let lower = s.to_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            let after_scheme = &s[s.find("://").map(|i| i + 3).unwrap_or(0)..];
            let host = after_scheme.split(['/', '?', '#']).next().unwrap_or_default();
            if host.is_empty() {
                return Err(LocatorError::InvalidFormat(format!("URL has no host: {s}")));
            }
            return Ok(SourceLocator::Http(s.to_string()));
        }

        if let Some(idx) = s.find("://") {
            return Err(LocatorError::UnsupportedScheme(s[..idx].to_string()));
        }

        Ok(SourceLocator::Local(PathBuf::from(s)))
    }

    /// Scheme name ("file", "http" or "https")
    pub fn scheme(&self) -> &'static str {
        match self {
            SourceLocator::Local(_) => "file",
            SourceLocator::Http(url) if url.to_lowercase().starts_with("https://") => "https",
            SourceLocator::Http(_) => "http",
        }
    }

    /// Local path, if this locator points at the local filesystem
    pub fn as_local_path(&self) -> Option<&Path> {
        match self {
            SourceLocator::Local(path) => Some(path),
            SourceLocator::Http(_) => None,
        }
    }

    /// Whether fetching requires the network
    pub fn is_remote(&self) -> bool {
        matches!(self, SourceLocator::Http(_))
    }

    /// Last path segment, without query string or fragment
    pub fn file_name(&self) -> Option<String> {
        match self {
            SourceLocator::Local(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            SourceLocator::Http(url) => {
                let without_query = url.split(['?', '#']).next().unwrap_or_default();
                let after_scheme = without_query
                    .find("://")
                    .map(|i| &without_query[i + 3..])
                    .unwrap_or(without_query);
                // Host-only URLs have no file name
                let (_, path) = after_scheme.split_once('/')?;
                path.rsplit('/')
                    .find(|segment| !segment.is_empty())
                    .map(|segment| segment.to_string())
            }
        }
    }

    /// Stable, filesystem-safe identifier for the disk behind this locator
    ///
    /// The identifier is a readable stem derived from the file name followed by
    /// a short hash of the full locator, so two disks with the same file name in
    /// different places never collide.
    ///
    /// # Examples
    ///
    /// ```
    /// use vdisk_migrator::locator::SourceLocator;
    ///
    /// let a = SourceLocator::parse("/exports/vm1/disk0.vmdk").unwrap();
    /// let b = SourceLocator::parse("/exports/vm2/disk0.vmdk").unwrap();
    /// assert!(a.disk_id().starts_with("disk0-vmdk-"));
    /// assert_ne!(a.disk_id(), b.disk_id());
    /// assert_eq!(a.disk_id(), a.disk_id());
    /// ```
    pub fn disk_id(&self) -> String {
        let stem = self
            .file_name()
            .map(|name| to_filesystem_safe(&name))
            .filter(|stem| !stem.is_empty())
            .unwrap_or_else(|| "disk".to_string());
        let stem: String = stem.chars().take(DISK_ID_STEM_MAX).collect();
        let stem = stem.trim_end_matches('-');

        let mut hasher = Sha256::new();
        hasher.update(self.to_string().as_bytes());
        let digest = format!("{:x}", hasher.finalize());

        format!("{stem}-{}", &digest[..DISK_ID_HASH_LEN])
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocator::Local(path) => write!(f, "{}", path.display()),
            SourceLocator::Http(url) => write!(f, "{url}"),
        }
    }
}

impl TryFrom<String> for SourceLocator {
    type Error = LocatorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        SourceLocator::parse(&value)
    }
}

impl From<SourceLocator> for String {
    fn from(locator: SourceLocator) -> Self {
        locator.to_string()
    }
}

/// Lowercase, keep ASCII alphanumerics, and collapse everything else into single dashes
pub fn to_filesystem_safe(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_dash = true;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_end_matches('-').to_string()
}

/// Errors that can occur during locator parsing
#[derive(Debug, thiserror::Error)]
pub enum LocatorError {
    /// Empty input
    #[error("source locator is empty")]
    Empty,

    /// Scheme not supported by any transfer source
    #[error("unsupported locator scheme: {0}")]
    UnsupportedScheme(String),

    /// Malformed locator
    #[error("invalid locator: {0}")]
    InvalidFormat(String),
}
