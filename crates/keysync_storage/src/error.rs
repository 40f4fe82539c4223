//! Error types for storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Another process holds the store's directory lock.
    #[error("store at {path:?} is locked by another process")]
    Locked {
        /// Directory that could not be locked.
        path: PathBuf,
    },

    /// The key cannot be stored by this backend.
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey {
        /// The rejected key.
        key: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The store contents are corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),
}
