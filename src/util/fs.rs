//! Crash-safe file writes

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

/// Write `bytes` to a temp file in the target's directory, sync it, then rename it over `path`
///
/// Readers see either the old contents or the new contents, never a torn file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;
    temp_file.write_all(bytes)?;
    temp_file.flush()?;
    temp_file.as_file().sync_all()?;
    temp_file.persist(path).map_err(|e| e.error)?;

    fsync_dir(parent);
    Ok(())
}

/// Best-effort directory fsync so a rename is durable
pub fn fsync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}
