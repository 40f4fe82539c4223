//! The local ledger: records plus sync bookkeeping over a [`LocalStore`].
//!
//! ## Layout
//!
//! ```text
//! r/<key>      # CBOR LocalRecord<V>
//! m/unsynced   # CBOR set of keys whose record is unsynced
//! m/removed    # CBOR set of keys deleted locally, remote delete pending
//! ```
//!
//! The two key sets are owned by the ledger alone; the engine reads them
//! but never edits them directly.

use crate::codec::{from_cbor, to_cbor};
use crate::error::{SyncError, SyncResult};
use crate::record::{Clock, EntityValue, LocalRecord};
use keysync_storage::LocalStore;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::Arc;

const RECORD_PREFIX: &str = "r/";
const UNSYNCED_KEY: &str = "m/unsynced";
const REMOVED_KEY: &str = "m/removed";

fn record_key(key: &str) -> String {
    format!("{RECORD_PREFIX}{key}")
}

/// Outcome of [`LocalLedger::write_batch_if_unchanged`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionalWrite {
    /// Keys written.
    pub written: Vec<String>,
    /// Keys whose stored record changed meanwhile; left untouched.
    pub skipped: Vec<String>,
    /// Keys whose write failed.
    pub failed: Vec<String>,
}

/// Synchronous record storage with unsynced and pending-removal tracking.
pub struct LocalLedger<V> {
    store: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
    unsynced: RwLock<BTreeSet<String>>,
    pending_removal: RwLock<BTreeSet<String>>,
    /// Serializes read-modify-write sequences against the store.
    write_lock: Mutex<()>,
    _value: PhantomData<fn() -> V>,
}

impl<V: EntityValue> LocalLedger<V> {
    /// Opens a ledger over `store`, loading its key sets.
    ///
    /// A store without a persisted unsynced set (first open, or written by
    /// an older build) has it rebuilt by scanning every record once.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or a key set is corrupt.
    pub fn open(store: Arc<dyn LocalStore>, clock: Arc<dyn Clock>) -> SyncResult<Self> {
        let pending_removal = match store.get(REMOVED_KEY)? {
            Some(bytes) => from_cbor(&bytes)?,
            None => BTreeSet::new(),
        };

        let ledger = Self {
            store,
            clock,
            unsynced: RwLock::new(BTreeSet::new()),
            pending_removal: RwLock::new(pending_removal),
            write_lock: Mutex::new(()),
            _value: PhantomData,
        };

        match ledger.store.get(UNSYNCED_KEY)? {
            Some(bytes) => *ledger.unsynced.write() = from_cbor(&bytes)?,
            None => ledger.rebuild_unsynced()?,
        }

        Ok(ledger)
    }

    /// Recomputes the unsynced set from the stored records.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed or written.
    pub fn rebuild_unsynced(&self) -> SyncResult<()> {
        let _guard = self.write_lock.lock();
        let rebuilt: BTreeSet<String> = self
            .scan()?
            .into_iter()
            .filter(|r| r.is_unsynced())
            .map(|r| r.key)
            .collect();
        tracing::debug!(count = rebuilt.len(), "rebuilt unsynced key set");
        *self.unsynced.write() = rebuilt;
        self.save_unsynced()
    }

    /// The clock that stamps application writes.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Reads the record for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or the record does not decode.
    pub fn read(&self, key: &str) -> SyncResult<Option<LocalRecord<V>>> {
        match self.store.get(&record_key(key))? {
            Some(bytes) => Ok(Some(from_cbor(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Reads several records. A key that cannot be read is reported as
    /// missing and logged; it never fails the batch.
    pub fn read_batch<S: AsRef<str>>(&self, keys: &[S]) -> Vec<Option<LocalRecord<V>>> {
        keys.iter()
            .map(|key| {
                let key = key.as_ref();
                self.read(key).unwrap_or_else(|e| {
                    tracing::warn!(key, error = %e, "unreadable local record");
                    None
                })
            })
            .collect()
    }

    /// Persists a single record.
    ///
    /// # Errors
    ///
    /// See [`write_batch`](Self::write_batch).
    pub fn write(&self, record: LocalRecord<V>) -> SyncResult<()> {
        self.write_batch(vec![record])
    }

    /// Persists records and updates the unsynced set.
    ///
    /// Every record is attempted; keys that failed are reported together in
    /// [`SyncError::PartialWrite`].
    ///
    /// # Errors
    ///
    /// Returns `PartialWrite` if any record failed, or a storage error if the
    /// unsynced set itself could not be saved.
    pub fn write_batch(&self, records: Vec<LocalRecord<V>>) -> SyncResult<()> {
        let _guard = self.write_lock.lock();
        self.write_locked(records)
    }

    /// Writes each record only if the stored copy still has the expected
    /// timestamp (`None` = expected absent).
    ///
    /// Used by the engine so a pull or merge computed before a remote round
    /// trip never clobbers an application write that landed meanwhile.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the unsynced set could not be saved.
    /// Per-record failures are reported in [`ConditionalWrite::failed`].
    pub fn write_batch_if_unchanged(
        &self,
        records: Vec<(LocalRecord<V>, Option<u64>)>,
    ) -> SyncResult<ConditionalWrite> {
        let _guard = self.write_lock.lock();
        let mut outcome = ConditionalWrite::default();
        let mut accepted = Vec::with_capacity(records.len());
        for (record, expected) in records {
            let current = self.read(&record.key).ok().flatten().map(|r| r.timestamp);
            if current == expected {
                accepted.push(record);
            } else {
                tracing::debug!(key = %record.key, ?expected, ?current, "local record moved on, skipping");
                outcome.skipped.push(record.key);
            }
        }

        let keys: Vec<String> = accepted.iter().map(|r| r.key.clone()).collect();
        match self.write_locked(accepted) {
            Ok(()) => {}
            Err(SyncError::PartialWrite { keys }) => outcome.failed = keys,
            Err(e) => return Err(e),
        }
        outcome.written = keys
            .into_iter()
            .filter(|k| !outcome.failed.contains(k))
            .collect();
        Ok(outcome)
    }

    /// Marks keys as reconciled with the given uploaded timestamps.
    ///
    /// Each record is re-read and written back with `synced` set to the
    /// uploaded timestamp. A record that was written again since the upload
    /// keeps its newer value and stays unsynced. Returns the keys committed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the unsynced set could not be saved.
    pub fn commit_synced(&self, uploaded: &[(String, u64)]) -> SyncResult<Vec<String>> {
        let _guard = self.write_lock.lock();
        let mut committed = Vec::with_capacity(uploaded.len());
        for (key, timestamp) in uploaded {
            match self.read(key) {
                Ok(Some(record)) => committed.push(record.committed(*timestamp)),
                Ok(None) => tracing::debug!(key, "record removed before commit"),
                Err(e) => tracing::warn!(key, error = %e, "cannot commit unreadable record"),
            }
        }
        let keys: Vec<String> = committed.iter().map(|r| r.key.clone()).collect();
        match self.write_locked(committed) {
            Ok(()) => Ok(keys),
            // Records that failed to persist stay unsynced and are retried.
            Err(SyncError::PartialWrite { keys: failed }) => {
                Ok(keys.into_iter().filter(|k| !failed.contains(k)).collect())
            }
            Err(e) => Err(e),
        }
    }

    /// Applies application writes: new keys start at version 1, existing
    /// keys get `version + 1` and a fresh timestamp. Returns the stored
    /// records.
    ///
    /// Writing a key that is pending removal revives it: the key leaves the
    /// pending set and its remote copy is reconciled instead of deleted.
    ///
    /// # Errors
    ///
    /// As for [`write_batch`](Self::write_batch).
    pub fn stamp_batch(&self, entries: Vec<(String, V)>) -> SyncResult<Vec<LocalRecord<V>>> {
        let _guard = self.write_lock.lock();
        let mut records: Vec<LocalRecord<V>> = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            // A key repeated within the batch builds on its earlier entry.
            let previous = match records.iter().position(|r| r.key == key) {
                Some(index) => Some(records.remove(index)),
                None => self.read(&key).ok().flatten(),
            };
            let timestamp = self
                .clock
                .next_after(previous.as_ref().map(|r| r.timestamp));
            let record = match previous {
                Some(previous) => previous.revised(value, timestamp),
                None => LocalRecord::new(key, value, timestamp),
            };
            records.push(record);
        }
        self.write_locked(records.clone())?;

        let revived = {
            let mut pending = self.pending_removal.write();
            records
                .iter()
                .fold(false, |acc, r| pending.remove(&r.key) || acc)
        };
        if revived {
            tracing::debug!("rewritten keys left the pending-removal set");
            self.save_pending_removal()?;
        }
        Ok(records)
    }

    /// Deletes records locally and remembers them until the remote delete
    /// is confirmed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or the pending-removal set cannot be
    /// written.
    pub fn mark_removed_pending<S: AsRef<str>>(&self, keys: &[S]) -> SyncResult<()> {
        let _guard = self.write_lock.lock();
        {
            let mut pending = self.pending_removal.write();
            for key in keys {
                pending.insert(key.as_ref().to_string());
            }
        }
        // The intent is durable before any record disappears.
        self.save_pending_removal()?;
        self.delete_locked(keys)
    }

    /// Forgets keys whose remote copy is gone.
    ///
    /// # Errors
    ///
    /// Returns an error if the pending-removal set cannot be written.
    pub fn confirm_removed<S: AsRef<str>>(&self, keys: &[S]) -> SyncResult<()> {
        let _guard = self.write_lock.lock();
        {
            let mut pending = self.pending_removal.write();
            for key in keys {
                pending.remove(key.as_ref());
            }
        }
        self.save_pending_removal()
    }

    /// Deletes records locally without any sync bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub fn force_remove<S: AsRef<str>>(&self, keys: &[S]) -> SyncResult<()> {
        let _guard = self.write_lock.lock();
        self.delete_locked(keys)
    }

    /// Keys whose record is not known-reconciled.
    pub fn unsynced_keys(&self) -> Vec<String> {
        self.unsynced.read().iter().cloned().collect()
    }

    /// Keys deleted locally whose remote delete is not yet confirmed.
    pub fn pending_removal_keys(&self) -> Vec<String> {
        self.pending_removal.read().iter().cloned().collect()
    }

    /// True if `key` is waiting for its remote delete.
    pub fn is_pending_removal(&self, key: &str) -> bool {
        self.pending_removal.read().contains(key)
    }

    /// Every readable record in the ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed.
    pub fn all_records(&self) -> SyncResult<Vec<LocalRecord<V>>> {
        self.scan()
    }

    fn scan(&self) -> SyncResult<Vec<LocalRecord<V>>> {
        let keys: Vec<String> = self
            .store
            .list_prefix(RECORD_PREFIX)?
            .into_iter()
            .map(|k| k[RECORD_PREFIX.len()..].to_string())
            .collect();
        Ok(self.read_batch(&keys).into_iter().flatten().collect())
    }

    fn write_locked(&self, records: Vec<LocalRecord<V>>) -> SyncResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut failed = Vec::new();
        let mut changed = false;
        for record in records {
            let stored = to_cbor(&record).and_then(|bytes| {
                self.store
                    .set(&record_key(&record.key), &bytes)
                    .map_err(SyncError::from)
            });
            if let Err(e) = stored {
                tracing::warn!(key = %record.key, error = %e, "failed to persist local record");
                failed.push(record.key);
                continue;
            }

            let mut unsynced = self.unsynced.write();
            changed |= if record.is_unsynced() {
                unsynced.insert(record.key)
            } else {
                unsynced.remove(&record.key)
            };
        }

        if changed {
            self.save_unsynced()?;
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(SyncError::PartialWrite { keys: failed })
        }
    }

    fn delete_locked<S: AsRef<str>>(&self, keys: &[S]) -> SyncResult<()> {
        for key in keys {
            self.store.delete(&record_key(key.as_ref()))?;
        }
        let changed = {
            let mut unsynced = self.unsynced.write();
            keys.iter()
                .fold(false, |acc, key| unsynced.remove(key.as_ref()) || acc)
        };
        if changed {
            self.save_unsynced()?;
        }
        Ok(())
    }

    fn save_unsynced(&self) -> SyncResult<()> {
        let bytes = to_cbor(&*self.unsynced.read())?;
        self.store.set(UNSYNCED_KEY, &bytes)?;
        Ok(())
    }

    fn save_pending_removal(&self) -> SyncResult<()> {
        let bytes = to_cbor(&*self.pending_removal.read())?;
        self.store.set(REMOVED_KEY, &bytes)?;
        Ok(())
    }
}

impl<V> std::fmt::Debug for LocalLedger<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalLedger")
            .field("unsynced", &self.unsynced.read().len())
            .field("pending_removal", &self.pending_removal.read().len())
            .finish()
    }
}
