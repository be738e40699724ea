//! Advisory lock on a recovery store directory
//!
//! Uses fd-lock so two processes never drive the same store at once. Within a
//! process, per-key serialization is handled by the manager itself.

use super::RecoveryError;
use fd_lock::RwLock;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Name of the lock file inside the store root
pub const LOCK_FILE_NAME: &str = ".store.lock";

/// Exclusive lock held for the lifetime of a [`super::RecoveryManager`]
pub struct StoreLock {
    // Closing the descriptor releases the lock
    _lock: RwLock<File>,
    path: PathBuf,
}

impl StoreLock {
    /// Try to acquire the store lock without blocking
    ///
    /// Returns an error immediately if another process holds it.
    pub fn try_acquire(store_root: &Path) -> Result<Self, RecoveryError> {
        std::fs::create_dir_all(store_root).map_err(|e| RecoveryError::io(store_root, e))?;

        let path = store_root.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| RecoveryError::Lock(format!("Failed to open lock file: {e}")))?;

        let mut lock = RwLock::new(file);
        {
            let guard = lock.try_write().map_err(|e| {
                RecoveryError::Lock(format!(
                    "recovery store {} is in use by another process: {e}",
                    store_root.display()
                ))
            })?;
            // Keep the lock past the guard's scope; it is released when `_lock` closes the file
            std::mem::forget(guard);
        }

        Ok(Self { _lock: lock, path })
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for StoreLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreLock").field("path", &self.path).finish()
    }
}
