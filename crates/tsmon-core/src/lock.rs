//! Single-instance lock for the poller supervisor.
//!
//! Uses OS-level file locking (via fs2) so only one supervisor mirrors a
//! given database at a time; stale client JVMs from a crashed run die with
//! the held lock rather than being hunted down by pid. A sidecar metadata
//! file records who holds the lock for diagnostics.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during lock operations.
#[derive(Error, Debug)]
pub enum LockError {
    /// Lock is already held by another process.
    #[error("supervisor already running (pid: {pid}, started: {started_at})")]
    AlreadyRunning { pid: u32, started_at: String },

    /// Lock is held but metadata is missing or corrupt.
    #[error("supervisor already running (lock held, metadata unavailable)")]
    AlreadyRunningNoMeta,

    /// I/O error during lock operations.
    #[error("lock I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize/deserialize metadata.
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Diagnostic metadata written alongside the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMetadata {
    /// Process ID of the lock holder.
    pub pid: u32,
    /// Unix timestamp when the lock was acquired.
    pub started_at: u64,
    /// Human-readable start time.
    pub started_at_human: String,
    /// Version of tsmon that acquired the lock.
    pub version: String,
}

impl LockMetadata {
    fn new() -> Self {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());

        let human = chrono::DateTime::from_timestamp(i64::try_from(now).unwrap_or(0), 0)
            .map_or_else(|| format!("unix:{now}"), |dt| dt.to_rfc3339());

        Self {
            pid: std::process::id(),
            started_at: now,
            started_at_human: human,
            version: crate::VERSION.to_string(),
        }
    }
}

/// An acquired single-instance lock.
///
/// The lock is released when this guard is dropped.
pub struct SupervisorLock {
    _lock_file: File,
    lock_path: PathBuf,
    meta_path: PathBuf,
}

impl SupervisorLock {
    /// Attempt to acquire the single-instance lock.
    ///
    /// Returns `Err(LockError::AlreadyRunning)` if another supervisor
    /// holds the lock.
    pub fn acquire(lock_path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => {
                let meta_path = metadata_path(lock_path);
                let lock = Self {
                    _lock_file: lock_file,
                    lock_path: lock_path.to_path_buf(),
                    meta_path,
                };
                lock.write_metadata()?;
                tracing::debug!(
                    lock_path = %lock_path.display(),
                    "Acquired supervisor lock"
                );
                Ok(lock)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Err(read_existing_lock_error(lock_path))
            }
            Err(e) => Err(LockError::Io(e)),
        }
    }

    fn write_metadata(&self) -> Result<(), LockError> {
        let metadata = LockMetadata::new();
        let json = serde_json::to_string_pretty(&metadata)?;

        let mut file = File::create(&self.meta_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Path to the lock file.
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Path to the metadata sidecar.
    #[must_use]
    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }
}

impl Drop for SupervisorLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.meta_path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    meta_path = %self.meta_path.display(),
                    error = %e,
                    "Failed to remove lock metadata"
                );
            }
        }
        // The file lock itself releases when _lock_file drops.
        tracing::debug!(
            lock_path = %self.lock_path.display(),
            "Released supervisor lock"
        );
    }
}

fn metadata_path(lock_path: &Path) -> PathBuf {
    let mut meta_path = lock_path.to_path_buf();
    let file_name = lock_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("lock");
    meta_path.set_file_name(format!("{file_name}.meta.json"));
    meta_path
}

/// Read metadata from an existing lock to build a helpful error.
#[allow(clippy::option_if_let_else)]
fn read_existing_lock_error(lock_path: &Path) -> LockError {
    let meta_path = metadata_path(lock_path);
    match fs::read_to_string(&meta_path) {
        Ok(contents) => match serde_json::from_str::<LockMetadata>(&contents) {
            Ok(meta) => LockError::AlreadyRunning {
                pid: meta.pid,
                started_at: meta.started_at_human,
            },
            Err(_) => LockError::AlreadyRunningNoMeta,
        },
        Err(_) => LockError::AlreadyRunningNoMeta,
    }
}

/// Check whether a supervisor is running without taking the lock.
///
/// Returns `Some(metadata)` if the lock is held, `None` if it's free.
#[must_use]
pub fn check_running(lock_path: &Path) -> Option<LockMetadata> {
    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(false)
        .open(lock_path)
        .ok()?;

    match lock_file.try_lock_exclusive() {
        Ok(()) => {
            drop(lock_file);
            None
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            let meta_path = metadata_path(lock_path);
            fs::read_to_string(&meta_path)
                .ok()
                .and_then(|s| serde_json::from_str(&s).ok())
        }
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_and_release_lock() {
        let tmp = TempDir::new().unwrap();
        let lock_path = tmp.path().join("tsmon.lock");

        let lock = SupervisorLock::acquire(&lock_path).unwrap();
        assert!(lock_path.exists());
        let meta_path = lock.meta_path().to_path_buf();
        assert!(meta_path.exists());

        drop(lock);
        assert!(!meta_path.exists());
    }

    #[test]
    fn double_acquire_fails() {
        let tmp = TempDir::new().unwrap();
        let lock_path = tmp.path().join("tsmon.lock");

        let _lock1 = SupervisorLock::acquire(&lock_path).unwrap();
        let result = SupervisorLock::acquire(&lock_path);
        assert!(matches!(result, Err(LockError::AlreadyRunning { .. })));
    }

    #[test]
    fn check_running_detects_held_lock() {
        let tmp = TempDir::new().unwrap();
        let lock_path = tmp.path().join("tsmon.lock");

        assert!(check_running(&lock_path).is_none());

        let _lock = SupervisorLock::acquire(&lock_path).unwrap();

        let meta = check_running(&lock_path);
        assert!(meta.is_some());
        assert_eq!(meta.unwrap().pid, std::process::id());
    }
}
