//! A remote kept in a shared directory.
//!
//! Sealed records are stored CBOR-encoded in a [`DirStore`], so any folder
//! several devices can reach (a network share, a synced drive) can act as
//! the remote.

use async_trait::async_trait;
use keysync_engine::{
    answer_query, from_cbor, to_cbor, RawRead, RemoteQuery, RemoteTransport, SealedRecord,
    SyncResult, WriteOutcome, WriteStatus,
};
use keysync_storage::{DirStore, LocalStore};
use rand::RngCore;
use std::path::Path;

const RECORD_PREFIX: &str = "kv/";
const SALT_KEY: &str = "meta/salt";
const SALT_SIZE: usize = 16;

/// Directory-backed remote transport.
#[derive(Debug)]
pub struct DirTransport {
    store: DirStore,
}

impl DirTransport {
    /// Opens (or creates) the remote directory at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or is locked by
    /// another process.
    pub fn open(path: &Path) -> SyncResult<Self> {
        Ok(Self {
            store: DirStore::open(path)?,
        })
    }

    /// The key-derivation salt shared by every device using this remote,
    /// created on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the salt cannot be read or written.
    pub fn salt(&self) -> SyncResult<Vec<u8>> {
        if let Some(salt) = self.store.get(SALT_KEY)? {
            return Ok(salt);
        }
        let mut salt = vec![0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        self.store.set(SALT_KEY, &salt)?;
        tracing::info!(path = %self.store.path().display(), "created remote salt");
        Ok(salt)
    }

    fn load(&self, key: &str) -> SyncResult<Option<SealedRecord>> {
        match self.store.get(&format!("{RECORD_PREFIX}{key}"))? {
            Some(bytes) => Ok(Some(from_cbor(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RemoteTransport for DirTransport {
    async fn read_batch(&self, queries: &[RemoteQuery]) -> SyncResult<Vec<RawRead>> {
        queries
            .iter()
            .map(|q| -> SyncResult<RawRead> { Ok(answer_query(q, self.load(&q.key)?.as_ref())) })
            .collect()
    }

    async fn write_batch(&self, records: &[SealedRecord]) -> SyncResult<Vec<WriteStatus>> {
        let mut statuses = Vec::with_capacity(records.len());
        for record in records {
            let outcome = to_cbor(record)
                .and_then(|bytes| {
                    self.store
                        .set(&format!("{RECORD_PREFIX}{}", record.key), &bytes)
                        .map_err(Into::into)
                })
                .map_or_else(|e| WriteOutcome::Rejected(e.to_string()), |()| WriteOutcome::Stored);
            statuses.push(WriteStatus {
                key: record.key.clone(),
                outcome,
            });
        }
        Ok(statuses)
    }

    async fn remove_batch(&self, keys: &[String]) -> SyncResult<()> {
        for key in keys {
            self.store.delete(&format!("{RECORD_PREFIX}{key}"))?;
        }
        Ok(())
    }
}
