//! Error types for the sync engine.

use crate::engine::SyncReport;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Local store error.
    #[error("storage error: {0}")]
    Storage(#[from] keysync_storage::StorageError),

    /// A record or key set could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Encryption or decryption failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The remote side answered with something we could not understand.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A remote call did not finish within the configured timeout.
    #[error("operation timed out")]
    Timeout,

    /// The key has no value at the queried layer.
    #[error("key not found: {key}")]
    NotFound {
        /// The missing key.
        key: String,
    },

    /// The remote value is unchanged since the supplied timestamp.
    #[error("key not modified: {key}")]
    NotModified {
        /// The unchanged key.
        key: String,
    },

    /// The conflict resolver failed or returned an unusable record.
    #[error("conflict resolution failed for {key}: {reason}")]
    ConflictResolution {
        /// The conflicted key.
        key: String,
        /// What went wrong.
        reason: String,
    },

    /// Some records in a local batch could not be persisted.
    #[error("failed to persist {} local record(s): {keys:?}", keys.len())]
    PartialWrite {
        /// Keys whose write failed.
        keys: Vec<String>,
    },

    /// The upload step of a pass failed after pulls and merges were already
    /// applied locally. `report` lists those kept local changes.
    #[error("upload failed: {source}")]
    UploadFailed {
        /// The remote failure.
        source: Box<SyncError>,
        /// What the pass changed locally before the upload.
        report: Box<SyncReport>,
    },

    /// The scheduler has shut down and accepts no more passes.
    #[error("sync scheduler is closed")]
    SchedulerClosed,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if a later pass may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::ConflictResolution { .. } => true,
            SyncError::UploadFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// The partial report of a pass whose upload failed.
    ///
    /// Keys in its [`changed_keys`](SyncReport::changed_keys) were changed
    /// locally and must be reloaded even though the pass failed.
    pub fn partial_report(&self) -> Option<&SyncReport> {
        match self {
            SyncError::UploadFailed { report, .. } => Some(report),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(!SyncError::Codec("bad cbor".into()).is_retryable());
        assert!(!SyncError::SchedulerClosed.is_retryable());

        let upload = SyncError::UploadFailed {
            source: Box::new(SyncError::transport_retryable("reset")),
            report: Box::default(),
        };
        assert!(upload.is_retryable());
        assert!(upload.partial_report().is_some());
        assert!(SyncError::Timeout.partial_report().is_none());
    }

    #[test]
    fn error_display() {
        let err = SyncError::NotFound { key: "k1".into() };
        assert_eq!(err.to_string(), "key not found: k1");

        let err = SyncError::PartialWrite {
            keys: vec!["a".into(), "b".into()],
        };
        assert!(err.to_string().contains("2 local record(s)"));

        let err = SyncError::ConflictResolution {
            key: "k".into(),
            reason: "boom".into(),
        };
        assert!(err.to_string().contains("boom"));
    }
}
