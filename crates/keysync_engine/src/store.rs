//! The application-facing sync store.

use crate::config::SyncConfig;
use crate::crypto::Cipher;
use crate::engine::{SyncEngine, SyncStats};
use crate::error::SyncResult;
use crate::local::LocalLedger;
use crate::record::{Clock, EntityValue, LocalRecord, SystemClock};
use crate::remote::RemoteLedger;
use crate::resolve::{ConflictResolver, PreferHigherVersion};
use crate::scheduler::{PendingSync, SyncScheduler};
use crate::transport::RemoteTransport;
use keysync_storage::LocalStore;
use std::sync::Arc;
use std::time::Duration;

/// Local-first key/value store kept in sync with a remote.
///
/// Writes and reads are served locally and never wait on the network.
/// Reconciliation runs on the scheduler's worker; [`trigger`](Self::trigger)
/// returns the keys the pass changed locally.
pub struct SyncStore<V, T> {
    ledger: Arc<LocalLedger<V>>,
    engine: Arc<SyncEngine<V, T>>,
    scheduler: SyncScheduler<V, T>,
}

impl<V: EntityValue, T: RemoteTransport + 'static> SyncStore<V, T> {
    /// Opens a store with the default configuration and
    /// [`PreferHigherVersion`] conflict resolution.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store cannot be read.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn open(store: Arc<dyn LocalStore>, transport: T, cipher: Arc<dyn Cipher>) -> SyncResult<Self> {
        Self::open_with_config(
            store,
            transport,
            cipher,
            SyncConfig::default(),
            Arc::new(PreferHigherVersion),
        )
    }

    /// Opens a store with custom configuration and conflict resolution.
    ///
    /// Automatic sync starts if `config.sync_interval` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store cannot be read.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn open_with_config(
        store: Arc<dyn LocalStore>,
        transport: T,
        cipher: Arc<dyn Cipher>,
        config: SyncConfig,
        resolver: Arc<dyn ConflictResolver<V>>,
    ) -> SyncResult<Self> {
        Self::open_with_clock(store, transport, cipher, config, resolver, Arc::new(SystemClock))
    }

    /// Opens a store that stamps writes with `clock`.
    ///
    /// This is a lower-level constructor for tests and simulations.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store cannot be read.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn open_with_clock(
        store: Arc<dyn LocalStore>,
        transport: T,
        cipher: Arc<dyn Cipher>,
        config: SyncConfig,
        resolver: Arc<dyn ConflictResolver<V>>,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<Self> {
        let interval = config.sync_interval;
        let ledger = Arc::new(LocalLedger::open(store, clock)?);
        let remote = RemoteLedger::new(transport, cipher, config);
        let engine = Arc::new(SyncEngine::new(Arc::clone(&ledger), remote, resolver));
        let scheduler = SyncScheduler::new(Arc::clone(&engine));
        if let Some(interval) = interval {
            scheduler.start_auto_sync(interval)?;
        }

        tracing::debug!(
            unsynced = ledger.unsynced_keys().len(),
            pending_removal = ledger.pending_removal_keys().len(),
            "sync store opened"
        );
        Ok(Self {
            ledger,
            engine,
            scheduler,
        })
    }

    /// Writes entities locally. Each becomes unsynced until a pass uploads
    /// it. Returns the stored records.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::PartialWrite`](crate::SyncError::PartialWrite)
    /// naming the entities that could not be stored.
    pub fn write_batch<K: Into<String>>(&self, entities: Vec<(K, V)>) -> SyncResult<Vec<LocalRecord<V>>> {
        self.ledger
            .stamp_batch(entities.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Reads the local value of `key`, or `default` if there is none.
    pub fn read_local(&self, key: &str, default: V) -> V {
        match self.ledger.read(key) {
            Ok(Some(record)) => record.value,
            Ok(None) => default,
            Err(e) => {
                tracing::warn!(key, error = %e, "unreadable local record");
                default
            }
        }
    }

    /// Reads `key` locally, falling back to the remote for entities not
    /// cached on this device yet. A remote hit is stored locally as synced.
    ///
    /// # Errors
    ///
    /// Returns remote errors; a missing key is `Ok(None)`.
    pub async fn try_read_local_then_remote(&self, key: &str) -> SyncResult<Option<V>> {
        if let Some(record) = self.ledger.read(key)? {
            return Ok(Some(record.value));
        }
        if self.ledger.is_pending_removal(key) {
            return Ok(None);
        }

        let Some(remote) = self.engine.remote().read(key).await? else {
            return Ok(None);
        };
        let value = remote.value.clone();
        let outcome = self
            .ledger
            .write_batch_if_unchanged(vec![(LocalRecord::pulled_from(remote), None)])?;
        if !outcome.skipped.is_empty() {
            // A local write landed while the remote read was in flight.
            if let Some(record) = self.ledger.read(key)? {
                return Ok(Some(record.value));
            }
        }
        Ok(Some(value))
    }

    /// Enqueues a pass over `keys`.
    pub fn trigger<I, S>(&self, keys: I) -> PendingSync
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scheduler.trigger(keys)
    }

    /// Enqueues a pass over every unsynced key.
    pub fn trigger_unsynced(&self) -> PendingSync {
        self.scheduler.trigger_unsynced()
    }

    /// Deletes entities locally now and remotely on the enqueued pass.
    ///
    /// Removals that cannot reach the remote are retried by every later
    /// pass, across restarts.
    ///
    /// # Errors
    ///
    /// Returns an error if the local removal fails; nothing is enqueued then.
    pub fn remove_batch<S: AsRef<str>>(&self, keys: &[S]) -> SyncResult<PendingSync> {
        self.ledger.mark_removed_pending(keys)?;
        Ok(self.scheduler.trigger(Vec::<String>::new()))
    }

    /// Deletes entities locally only. The remote copy, if any, is left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store cannot be written.
    pub fn force_remove<S: AsRef<str>>(&self, keys: &[S]) -> SyncResult<()> {
        self.ledger.force_remove(keys)
    }

    /// Keys with local changes not yet uploaded.
    pub fn unsynced_keys(&self) -> Vec<String> {
        self.ledger.unsynced_keys()
    }

    /// Keys deleted locally whose remote delete is still pending.
    pub fn pending_removal_keys(&self) -> Vec<String> {
        self.ledger.pending_removal_keys()
    }

    /// Sync statistics since open.
    pub fn stats(&self) -> SyncStats {
        self.engine.stats()
    }

    /// Starts automatic passes over unsynced keys.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SchedulerClosed`](crate::SyncError::SchedulerClosed)
    /// after [`close`](Self::close).
    pub fn start_auto_sync(&self, interval: Duration) -> SyncResult<()> {
        self.scheduler.start_auto_sync(interval)
    }

    /// Stops automatic passes.
    pub fn stop_auto_sync(&self) {
        self.scheduler.stop_auto_sync();
    }

    /// The local ledger.
    pub fn ledger(&self) -> &Arc<LocalLedger<V>> {
        &self.ledger
    }

    /// The remote ledger.
    pub fn remote(&self) -> &RemoteLedger<V, T> {
        self.engine.remote()
    }

    /// Finishes queued passes and stops the scheduler.
    pub async fn close(&self) {
        self.scheduler.shutdown().await;
    }
}

impl<V, T> std::fmt::Debug for SyncStore<V, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStore")
            .field("ledger", &self.ledger)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
