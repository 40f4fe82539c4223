//! Entity records shared by the local and remote sides.
//!
//! A key's local copy carries a `synced` marker: the remote `timestamp`
//! it is known to be reconciled with (`0` = never synced). Comparing
//! `synced` against the local and remote timestamps is all the engine
//! needs to decide between push, pull and merge.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Bounds every synced value type must satisfy.
pub trait EntityValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> EntityValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// The local copy of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRecord<V> {
    /// Entity key.
    pub key: String,
    /// Entity value.
    pub value: V,
    /// Clock value of the last write to this copy.
    pub timestamp: u64,
    /// Write counter, starting at 1.
    pub version: u32,
    /// Remote timestamp this copy is reconciled with; 0 if never synced.
    pub synced: u64,
}

impl<V> LocalRecord<V> {
    /// Creates the first version of a never-synced record.
    pub fn new(key: impl Into<String>, value: V, timestamp: u64) -> Self {
        Self {
            key: key.into(),
            value,
            timestamp,
            version: 1,
            synced: 0,
        }
    }

    /// Returns the next local revision of this record.
    ///
    /// `synced` is carried over unchanged.
    pub fn revised(self, value: V, timestamp: u64) -> Self {
        Self {
            value,
            timestamp,
            version: self.version.saturating_add(1),
            ..self
        }
    }

    /// Builds the local copy that mirrors a pulled remote record.
    pub fn pulled_from(remote: RemoteRecord<V>) -> Self {
        Self {
            key: remote.key,
            value: remote.value,
            timestamp: remote.timestamp,
            version: remote.version,
            synced: remote.timestamp,
        }
    }

    /// Marks this copy as reconciled with the remote `timestamp`.
    pub fn committed(self, timestamp: u64) -> Self {
        Self {
            synced: timestamp,
            ..self
        }
    }

    /// True if this copy is not known to match the remote.
    pub fn is_unsynced(&self) -> bool {
        is_unsynced(self)
    }
}

impl<V: Clone> LocalRecord<V> {
    /// The record as it is uploaded.
    pub fn to_remote(&self) -> RemoteRecord<V> {
        RemoteRecord {
            key: self.key.clone(),
            value: self.value.clone(),
            timestamp: self.timestamp,
            version: self.version,
        }
    }
}

/// The remote copy of an entity, as last accepted by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord<V> {
    /// Entity key.
    pub key: String,
    /// Entity value (plaintext, after decryption).
    pub value: V,
    /// Timestamp of the uploading client's write.
    pub timestamp: u64,
    /// Version of the uploading client's write.
    pub version: u32,
}

/// True for any record not yet known-reconciled.
pub fn is_unsynced<V>(record: &LocalRecord<V>) -> bool {
    record.synced != record.timestamp
}

/// True if both copies carry the same write, so there is nothing to do.
pub fn is_stale<V>(local: &LocalRecord<V>, remote: &RemoteRecord<V>) -> bool {
    local.timestamp == remote.timestamp
}

/// Source of write timestamps.
///
/// Only relative order per key matters; wall-clock milliseconds are fine.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds.
    fn now_millis(&self) -> u64;

    /// A timestamp strictly greater than `previous`, tracking the clock.
    fn next_after(&self, previous: Option<u64>) -> u64 {
        let now = self.now_millis();
        match previous {
            Some(prev) => now.max(prev.saturating_add(1)),
            None => now.max(1),
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading `start`.
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Sets the current reading.
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    /// Moves the clock forward by `millis`.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_is_unsynced() {
        let record = LocalRecord::new("k1", 1u32, 100);
        assert_eq!(record.version, 1);
        assert_eq!(record.synced, 0);
        assert!(record.is_unsynced());
    }

    #[test]
    fn revision_keeps_synced_marker() {
        let record = LocalRecord::new("k1", 1u32, 100).committed(100);
        assert!(!record.is_unsynced());

        let record = record.revised(3, 200);
        assert_eq!(record.version, 2);
        assert_eq!(record.timestamp, 200);
        assert_eq!(record.synced, 100);
        assert!(record.is_unsynced());
    }

    #[test]
    fn pulled_record_is_synced() {
        let remote = RemoteRecord {
            key: "k1".to_string(),
            value: "v".to_string(),
            timestamp: 150,
            version: 4,
        };
        let local = LocalRecord::pulled_from(remote.clone());
        assert_eq!(local.synced, 150);
        assert_eq!(local.version, 4);
        assert!(!is_unsynced(&local));
        assert!(is_stale(&local, &remote));
    }

    #[test]
    fn next_after_is_strictly_increasing() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.next_after(None), 100);
        assert_eq!(clock.next_after(Some(50)), 100);
        // Clock stalled or went backwards
        assert_eq!(clock.next_after(Some(100)), 101);
        assert_eq!(clock.next_after(Some(500)), 501);

        clock.advance(1000);
        assert_eq!(clock.next_after(Some(500)), 1100);
    }

    #[test]
    fn zero_clock_never_yields_zero() {
        let clock = ManualClock::new(0);
        assert_eq!(clock.next_after(None), 1);
    }

    #[test]
    fn system_clock_is_nonzero() {
        assert!(SystemClock.now_millis() > 0);
    }
}
