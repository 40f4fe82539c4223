//! Transport layer abstraction for the remote key/value service.
//!
//! Everything here deals in sealed (encrypted) payloads; decryption and
//! decoding happen one level up in the remote ledger.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// A conditional read of one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteQuery {
    /// Key to read.
    pub key: String,
    /// Answer `NotModified` if the remote timestamp equals this value.
    pub if_none_match: Option<u64>,
}

impl RemoteQuery {
    /// An unconditional read.
    pub fn any(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            if_none_match: None,
        }
    }

    /// A read that short-circuits when the remote still holds `timestamp`.
    pub fn if_none_match(key: impl Into<String>, timestamp: u64) -> Self {
        Self {
            key: key.into(),
            if_none_match: Some(timestamp),
        }
    }
}

/// A record as stored remotely: payload encrypted, metadata in the clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedRecord {
    /// Entity key.
    pub key: String,
    /// Encrypted CBOR of the value.
    pub payload: Vec<u8>,
    /// Timestamp of the write.
    pub timestamp: u64,
    /// Version of the write.
    pub version: u32,
}

/// Per-key answer to a [`RemoteQuery`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawRead {
    /// The current remote record.
    Found(SealedRecord),
    /// Remote timestamp equals the supplied `if_none_match`.
    NotModified,
    /// The key has no remote value.
    NotFound,
}

/// Outcome of one uploaded record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOutcome {
    /// The record is now the remote value.
    Stored,
    /// The remote refused the record.
    Rejected(String),
}

/// Per-key result of a batch write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteStatus {
    /// Entity key.
    pub key: String,
    /// What happened to it.
    pub outcome: WriteOutcome,
}

impl WriteStatus {
    /// Returns true if the record was stored.
    pub fn is_stored(&self) -> bool {
        matches!(self.outcome, WriteOutcome::Stored)
    }
}

/// A remote transport talks to the key/value service.
///
/// Any failure of a call is a failure of the whole batch; there is no
/// partial-success contract at this layer. Writes are last-writer-wins.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Reads a batch of keys, one answer per query, in query order.
    async fn read_batch(&self, queries: &[RemoteQuery]) -> SyncResult<Vec<RawRead>>;

    /// Uploads records, one status per record.
    async fn write_batch(&self, records: &[SealedRecord]) -> SyncResult<Vec<WriteStatus>>;

    /// Deletes keys. Absent keys are not an error.
    async fn remove_batch(&self, keys: &[String]) -> SyncResult<()>;
}

#[async_trait]
impl<T: RemoteTransport + ?Sized> RemoteTransport for Arc<T> {
    async fn read_batch(&self, queries: &[RemoteQuery]) -> SyncResult<Vec<RawRead>> {
        (**self).read_batch(queries).await
    }

    async fn write_batch(&self, records: &[SealedRecord]) -> SyncResult<Vec<WriteStatus>> {
        (**self).write_batch(records).await
    }

    async fn remove_batch(&self, keys: &[String]) -> SyncResult<()> {
        (**self).remove_batch(keys).await
    }
}

/// Answers a query against the current remote record.
pub fn answer_query(query: &RemoteQuery, current: Option<&SealedRecord>) -> RawRead {
    match current {
        None => RawRead::NotFound,
        Some(record) if query.if_none_match == Some(record.timestamp) => RawRead::NotModified,
        Some(record) => RawRead::Found(record.clone()),
    }
}

/// Request counters kept by [`MemoryTransport`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportCounters {
    /// `read_batch` calls.
    pub reads: u64,
    /// `write_batch` calls.
    pub writes: u64,
    /// `remove_batch` calls.
    pub removes: u64,
}

/// An in-process remote shared by any number of simulated devices.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    records: RwLock<BTreeMap<String, SealedRecord>>,
    offline: AtomicBool,
    lose_write_acks: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
    removes: AtomicU64,
}

impl MemoryTransport {
    /// Creates an empty, online remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates losing (or regaining) the network.
    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    /// When set, writes are applied but the caller receives an error, as
    /// when a connection drops after the server committed.
    pub fn set_lose_write_acks(&self, lose: bool) {
        self.lose_write_acks.store(lose, Ordering::SeqCst);
    }

    /// Returns the stored record for `key`.
    pub fn get(&self, key: &str) -> Option<SealedRecord> {
        self.records.read().get(key).cloned()
    }

    /// Stores a record directly, bypassing the transport API.
    pub fn seed(&self, record: SealedRecord) {
        self.records.write().insert(record.key.clone(), record);
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Requests served so far.
    pub fn counters(&self) -> TransportCounters {
        TransportCounters {
            reads: self.reads.load(Ordering::SeqCst),
            writes: self.writes.load(Ordering::SeqCst),
            removes: self.removes.load(Ordering::SeqCst),
        }
    }

    fn check_online(&self) -> SyncResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(SyncError::transport_retryable("remote unreachable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteTransport for MemoryTransport {
    async fn read_batch(&self, queries: &[RemoteQuery]) -> SyncResult<Vec<RawRead>> {
        self.check_online()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        let records = self.records.read();
        Ok(queries
            .iter()
            .map(|q| answer_query(q, records.get(&q.key)))
            .collect())
    }

    async fn write_batch(&self, records: &[SealedRecord]) -> SyncResult<Vec<WriteStatus>> {
        self.check_online()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        {
            let mut stored = self.records.write();
            for record in records {
                stored.insert(record.key.clone(), record.clone());
            }
        }
        if self.lose_write_acks.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("connection reset after write"));
        }
        Ok(records
            .iter()
            .map(|r| WriteStatus {
                key: r.key.clone(),
                outcome: WriteOutcome::Stored,
            })
            .collect())
    }

    async fn remove_batch(&self, keys: &[String]) -> SyncResult<()> {
        self.check_online()?;
        self.removes.fetch_add(1, Ordering::SeqCst);
        let mut stored = self.records.write();
        for key in keys {
            stored.remove(key);
        }
        Ok(())
    }
}
