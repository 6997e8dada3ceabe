//! Error types for tsmon-core.
//!
//! The taxonomy follows the failure classes of the ingest pipeline:
//! transport/parse problems are handled locally (logged and skipped) and
//! never surface here; everything that does surface is either a storage
//! failure, a client-process failure, or a supervisor-level fault that the
//! retry loop must see.

use std::io;

use thiserror::Error;

/// Result alias used throughout tsmon-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Entity store failure (SQLite, writer thread, schema).
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Scripting-client process failure (launch, jar resolution, I/O).
    #[error(transparent)]
    Client(#[from] ClientError),

    /// A team server id that does not exist in the entity store.
    #[error("unknown team server: {0}")]
    UnknownTeamServer(i64),

    /// Supervisor-level single-flight refusal.
    #[error("poller already running for team server {0}")]
    AlreadyPolling(i64),

    /// Single-instance lock failure.
    #[error(transparent)]
    Lock(#[from] crate::lock::LockError),

    /// Generic I/O error outside storage/client scopes.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors from the SQLite entity store.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database-level failure (open, query, transaction).
    #[error("database error: {0}")]
    Database(String),

    /// The writer thread is gone or its response channel closed.
    #[error("storage writer unavailable: {0}")]
    WriterUnavailable(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// Errors from the external scripting-client boundary.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The JVM binary was not found in PATH.
    #[error("java binary not found in PATH")]
    JvmNotFound,

    /// The client jar could not be located in any known install layout.
    #[error("client jar not found (searched {0})")]
    JarNotFound(String),

    /// The jar's parent directory does not exist (bad working directory).
    #[error("no such jar directory: {0}")]
    BadJarDirectory(String),

    /// Failed to render or write the dump script.
    #[error("dump script error: {0}")]
    Script(String),

    /// Process spawn or stream I/O failure.
    #[error("client process error: {0}")]
    Process(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_wraps_into_error() {
        let err: Error = StorageError::Database("locked".to_string()).into();
        assert!(matches!(err, Error::Storage(_)));
        assert_eq!(err.to_string(), "database error: locked");
    }

    #[test]
    fn jar_not_found_message_names_search_path() {
        let err = ClientError::JarNotFound("/opt/cobaltstrike".to_string());
        assert!(err.to_string().contains("/opt/cobaltstrike"));
    }
}
