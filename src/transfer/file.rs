//! Transfer source for locally mounted files (`file://` and plain paths)

use super::{parse_checksum_sidecar, RetryErrorType, SourceStream, TransferError, TransferSource};
use crate::locator::SourceLocator;
use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Reads from the local filesystem; ranges are served by seeking
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSource;

impl LocalFileSource {
    /// Create a new local file source
    pub fn new() -> Self {
        Self
    }

    fn path<'a>(&self, locator: &'a SourceLocator) -> Result<&'a Path, TransferError> {
        locator
            .as_local_path()
            .ok_or_else(|| TransferError::Permanent(format!("not a local locator: {locator}")))
    }
}

/// Missing or unreadable files will not appear on retry; anything else might
fn classify_io(path: &Path, err: io::Error) -> TransferError {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => TransferError::Permanent(
            format!("cannot read source {}: {err}", path.display()),
        ),
        _ => TransferError::transient(
            RetryErrorType::from_io(&err),
            format!("reading {}: {err}", path.display()),
        ),
    }
}

impl TransferSource for LocalFileSource {
    fn name(&self) -> &'static str {
        "file"
    }

    fn supports(&self, locator: &SourceLocator) -> bool {
        matches!(locator, SourceLocator::Local(_))
    }

    fn probe_len(&self, locator: &SourceLocator) -> Result<Option<u64>, TransferError> {
        let path = self.path(locator)?;
        let meta = std::fs::metadata(path).map_err(|e| classify_io(path, e))?;
        if !meta.is_file() {
            return Err(TransferError::Permanent(format!(
                "source {} is not a regular file",
                path.display()
            )));
        }
        Ok(Some(meta.len()))
    }

    fn open(&self, locator: &SourceLocator, offset: u64) -> Result<SourceStream, TransferError> {
        let path = self.path(locator)?;
        let mut file = File::open(path).map_err(|e| classify_io(path, e))?;
        let len = file.metadata().map_err(|e| classify_io(path, e))?.len();

        // A partial file longer than the source cannot be a prefix of it
        let start_offset = if offset <= len { offset } else { 0 };
        file.seek(SeekFrom::Start(start_offset))
            .map_err(|e| classify_io(path, e))?;

        Ok(SourceStream {
            reader: Box::new(file),
            start_offset,
            total_len: Some(len),
        })
    }

    fn fetch_checksum(&self, locator: &SourceLocator) -> Result<Option<String>, TransferError> {
        let path = self.path(locator)?;
        let mut sidecar = PathBuf::from(path.as_os_str());
        sidecar.as_mut_os_string().push(".sha256");

        match std::fs::read_to_string(&sidecar) {
            Ok(contents) => {
                let checksum = parse_checksum_sidecar(&contents);
                if checksum.is_none() {
                    debug!(path = %sidecar.display(), "Ignoring malformed checksum sidecar");
                }
                Ok(checksum)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(classify_io(&sidecar, e)),
        }
    }
}
