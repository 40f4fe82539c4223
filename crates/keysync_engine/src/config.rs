//! Configuration for the sync engine.

use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum number of keys per remote read request.
    pub read_batch_size: usize,
    /// Maximum number of records per remote write request.
    pub write_batch_size: usize,
    /// Upper bound on a single remote call. `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    /// Interval for automatic passes over unsynced keys.
    pub sync_interval: Option<Duration>,
}

impl SyncConfig {
    /// Creates a configuration with default batch sizes, no timeout and
    /// no automatic sync.
    pub fn new() -> Self {
        Self {
            read_batch_size: 100,
            write_batch_size: 100,
            request_timeout: None,
            sync_interval: None,
        }
    }

    /// Sets the read batch size.
    pub fn with_read_batch_size(mut self, size: usize) -> Self {
        self.read_batch_size = size.max(1);
        self
    }

    /// Sets the write batch size.
    pub fn with_write_batch_size(mut self, size: usize) -> Self {
        self.write_batch_size = size.max(1);
        self
    }

    /// Sets the per-call timeout for remote requests.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Sets the sync interval for automatic sync.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}
