//! Integration tests: several devices syncing through one remote.

use keysync_engine::{
    AesGcmCipher, ConflictResolver, EncryptionKey, EntityValue, HttpTransport, LocalRecord,
    LoopbackClient, ManualClock, MemoryTransport, PreferHigherVersion, RemoteRecord,
    RemoteTransport, SyncConfig, SyncError, SyncStore,
};
use keysync_storage::{DirStore, InMemoryStore, LocalStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Counter {
    count: u32,
}

fn counter(count: u32) -> Counter {
    Counter { count }
}

/// One simulated device: a store plus the clock that stamps its writes.
struct Device<V, T> {
    store: SyncStore<V, T>,
    clock: Arc<ManualClock>,
}

fn open_device<V, T>(
    local: Arc<dyn LocalStore>,
    transport: T,
    key: &EncryptionKey,
    resolver: Arc<dyn ConflictResolver<V>>,
    now: u64,
) -> Device<V, T>
where
    V: EntityValue,
    T: RemoteTransport + 'static,
{
    let clock = Arc::new(ManualClock::new(now));
    let store = SyncStore::open_with_clock(
        local,
        transport,
        Arc::new(AesGcmCipher::new(key)),
        SyncConfig::default(),
        resolver,
        clock.clone(),
    )
    .unwrap();
    Device { store, clock }
}

fn memory_device<V: EntityValue>(
    remote: &Arc<MemoryTransport>,
    key: &EncryptionKey,
    now: u64,
) -> Device<V, Arc<MemoryTransport>> {
    open_device(
        Arc::new(InMemoryStore::new()),
        Arc::clone(remote),
        key,
        Arc::new(PreferHigherVersion),
        now,
    )
}

fn dir_device(
    path: &Path,
    remote: &Arc<MemoryTransport>,
    key: &EncryptionKey,
    now: u64,
) -> Device<Counter, Arc<MemoryTransport>> {
    open_device(
        Arc::new(DirStore::open(path).unwrap()),
        Arc::clone(remote),
        key,
        Arc::new(PreferHigherVersion),
        now,
    )
}

#[tokio::test]
async fn concurrent_edits_resolve_to_higher_version() {
    let remote = Arc::new(MemoryTransport::new());
    let key = EncryptionKey::generate();
    let a = memory_device::<Counter>(&remote, &key, 100);
    let b = memory_device::<Counter>(&remote, &key, 150);

    // Device A creates k1 and pushes it
    let written = a.store.write_batch(vec![("k1", counter(1))]).unwrap();
    assert_eq!((written[0].timestamp, written[0].version, written[0].synced), (100, 1, 0));
    let report = a.store.trigger(["k1"]).await.unwrap();
    assert_eq!(report.pushed, vec!["k1"]);
    let local = a.store.ledger().read("k1").unwrap().unwrap();
    assert_eq!(local.synced, 100);

    // Device B starts from the same remote state, edits and syncs first
    assert_eq!(
        b.store.try_read_local_then_remote("k1").await.unwrap(),
        Some(counter(1))
    );
    b.store.write_batch(vec![("k1", counter(2))]).unwrap();
    assert_eq!(b.store.trigger(["k1"]).await.unwrap().pushed, vec!["k1"]);
    assert_eq!(remote.get("k1").unwrap().timestamp, 150);

    // Device A edits again before syncing: both sides moved since synced=100
    a.clock.set(200);
    let edited = a.store.write_batch(vec![("k1", counter(3))]).unwrap();
    assert_eq!((edited[0].timestamp, edited[0].version, edited[0].synced), (200, 2, 100));

    let report = a.store.trigger(["k1"]).await.unwrap();
    assert_eq!(report.merged, vec!["k1"]);
    assert_eq!(report.changed_keys(), vec!["k1"]);
    assert!(report.pushed.is_empty());

    let merged = a.store.ledger().read("k1").unwrap().unwrap();
    assert_eq!(merged.value, counter(3));
    assert_eq!(merged.version, 3);
    assert!(merged.timestamp > 200);
    assert_eq!(merged.synced, merged.timestamp);

    let uploaded = a.store.remote().read("k1").await.unwrap().unwrap();
    assert_eq!(uploaded.value, counter(3));
    assert_eq!(uploaded.version, 3);
    assert_eq!(uploaded.timestamp, merged.timestamp);

    // B was only behind, so it pulls the merge
    let report = b.store.trigger(["k1"]).await.unwrap();
    assert_eq!(report.pulled, vec!["k1"]);
    assert_eq!(b.store.read_local("k1", counter(0)), counter(3));

    let stats = a.store.stats();
    assert_eq!(stats.conflicts_encountered, 1);
    assert_eq!(stats.keys_merged, 1);
}

#[tokio::test]
async fn repeated_pass_is_a_noop() {
    let remote = Arc::new(MemoryTransport::new());
    let key = EncryptionKey::generate();
    let a = memory_device::<Counter>(&remote, &key, 10);
    let b = memory_device::<Counter>(&remote, &key, 20);

    a.store
        .write_batch(vec![("x", counter(1)), ("y", counter(2))])
        .unwrap();
    a.store.trigger(["x", "y"]).await.unwrap();
    b.store.try_read_local_then_remote("x").await.unwrap();
    b.store.write_batch(vec![("x", counter(5))]).unwrap();
    b.store.trigger(["x"]).await.unwrap();
    a.store.trigger(["x", "y"]).await.unwrap();

    let counters = remote.counters();
    for device in [&a, &b] {
        let report = device.store.trigger(["x", "y"]).await.unwrap();
        assert!(report.pulled.is_empty());
        assert!(report.merged.is_empty());
        assert!(report.pushed.is_empty());
        assert!(report.is_clean());
    }
    assert_eq!(remote.counters().writes, counters.writes);
    assert_eq!(a.store.read_local("x", counter(0)), counter(5));
}

#[tokio::test]
async fn unsynced_write_survives_restart_and_is_pushed() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MemoryTransport::new());
    let key = EncryptionKey::generate();

    {
        let device = dir_device(dir.path(), &remote, &key, 100);
        device.store.write_batch(vec![("k", counter(7))]).unwrap();
        remote.set_online(false);
        assert!(device.store.trigger(["k"]).await.is_err());
        device.store.close().await;
    }

    remote.set_online(true);
    let device = dir_device(dir.path(), &remote, &key, 500);
    assert_eq!(device.store.unsynced_keys(), vec!["k"]);

    let report = device.store.trigger_unsynced().await.unwrap();
    assert_eq!(report.pushed, vec!["k"]);
    assert!(device.store.unsynced_keys().is_empty());

    let stored = device.store.remote().read("k").await.unwrap().unwrap();
    assert_eq!(stored.value, counter(7));
    assert_eq!(stored.timestamp, 100);
}

#[tokio::test]
async fn lost_upload_ack_never_changes_the_value() {
    let remote = Arc::new(MemoryTransport::new());
    let key = EncryptionKey::generate();
    let device = memory_device::<Counter>(&remote, &key, 100);

    device.store.write_batch(vec![("k", counter(1))]).unwrap();
    remote.set_lose_write_acks(true);
    assert!(device.store.trigger(["k"]).await.is_err());
    assert_eq!(device.store.unsynced_keys(), vec!["k"]);

    remote.set_lose_write_acks(false);
    let writes = remote.counters().writes;
    let report = device.store.trigger_unsynced().await.unwrap();
    assert_eq!(report.unchanged, vec!["k"]);
    assert!(device.store.unsynced_keys().is_empty());
    assert_eq!(remote.counters().writes, writes);
    assert_eq!(
        device.store.remote().read("k").await.unwrap().unwrap().value,
        counter(1)
    );
}

#[tokio::test]
async fn merge_kept_locally_when_upload_fails() {
    let remote = Arc::new(MemoryTransport::new());
    let key = EncryptionKey::generate();
    let a = memory_device::<Counter>(&remote, &key, 100);
    let b = memory_device::<Counter>(&remote, &key, 150);

    a.store.write_batch(vec![("k", counter(1))]).unwrap();
    a.store.trigger(["k"]).await.unwrap();
    b.store.try_read_local_then_remote("k").await.unwrap();
    b.store.write_batch(vec![("k", counter(2))]).unwrap();
    b.store.trigger(["k"]).await.unwrap();

    a.clock.set(300);
    a.store.write_batch(vec![("k", counter(3))]).unwrap();
    a.store
        .write_batch(vec![("k", counter(4))])
        .unwrap();

    // Merge is applied locally, the upload lands but its ack is lost
    remote.set_lose_write_acks(true);
    let err = a.store.trigger(["k"]).await.unwrap_err();
    assert_eq!(err.partial_report().unwrap().merged, vec!["k"]);
    let merged = a.store.ledger().read("k").unwrap().unwrap();
    assert_eq!(merged.value, counter(4));
    assert!(merged.is_unsynced());

    // Next pass recognises its own upload instead of merging again
    remote.set_lose_write_acks(false);
    let report = a.store.trigger(["k"]).await.unwrap();
    assert_eq!(report.unchanged, vec!["k"]);
    let settled = a.store.ledger().read("k").unwrap().unwrap();
    assert_eq!(settled.version, merged.version);
    assert_eq!(settled.synced, settled.timestamp);
}

#[tokio::test]
async fn failed_upload_still_reports_pulled_keys() {
    let remote = Arc::new(MemoryTransport::new());
    let key = EncryptionKey::generate();
    let a = memory_device::<Counter>(&remote, &key, 100);
    let b = memory_device::<Counter>(&remote, &key, 100);

    b.store.write_batch(vec![("p", counter(1))]).unwrap();
    b.store.trigger(["p"]).await.unwrap();
    a.store.try_read_local_then_remote("p").await.unwrap();

    b.clock.set(150);
    b.store.write_batch(vec![("p", counter(2))]).unwrap();
    b.store.trigger(["p"]).await.unwrap();
    a.store.write_batch(vec![("q", counter(5))]).unwrap();

    // The pass pulls p, then the upload of q loses its ack
    remote.set_lose_write_acks(true);
    let err = a.store.trigger(["p", "q"]).await.unwrap_err();
    assert!(matches!(err, SyncError::UploadFailed { .. }));
    assert!(err.is_retryable());
    let report = err.partial_report().unwrap();
    assert_eq!(report.pulled, vec!["p"]);
    assert_eq!(report.changed_keys(), vec!["p"]);
    assert_eq!(a.store.read_local("p", counter(0)), counter(2));
    assert_eq!(a.store.stats().keys_pulled, 1);

    // The pull is not repeated, only q is settled
    remote.set_lose_write_acks(false);
    let report = a.store.trigger(["p", "q"]).await.unwrap();
    assert!(report.changed_keys().is_empty());
    assert!(a.store.unsynced_keys().is_empty());
}

#[tokio::test]
async fn rewriting_a_removed_key_merges_with_remote_edits() {
    let remote = Arc::new(MemoryTransport::new());
    let key = EncryptionKey::generate();
    let a = memory_device::<Counter>(&remote, &key, 100);
    let b = memory_device::<Counter>(&remote, &key, 100);

    a.store.write_batch(vec![("k", counter(1))]).unwrap();
    a.store.trigger(["k"]).await.unwrap();
    b.store.try_read_local_then_remote("k").await.unwrap();

    b.clock.set(200);
    b.store.write_batch(vec![("k", counter(42))]).unwrap();
    b.store.trigger(["k"]).await.unwrap();

    // A removes k while offline, then writes it again
    remote.set_online(false);
    let report = a.store.remove_batch(&["k"]).unwrap().await.unwrap();
    assert!(report.removed.is_empty());
    assert_eq!(a.store.pending_removal_keys(), vec!["k"]);

    a.clock.set(300);
    a.store.write_batch(vec![("k", counter(7))]).unwrap();
    assert!(a.store.pending_removal_keys().is_empty());

    remote.set_online(true);
    let report = a.store.trigger(["k"]).await.unwrap();
    assert!(report.removed.is_empty());
    assert_eq!(report.merged, vec!["k"]);
    assert_eq!(a.store.stats().conflicts_encountered, 1);

    // B's edit carried the higher version and survives the merge
    assert_eq!(a.store.read_local("k", counter(0)), counter(42));
    let report = b.store.trigger(["k"]).await.unwrap();
    assert_eq!(report.pulled, vec!["k"]);
    assert_eq!(b.store.read_local("k", counter(0)), counter(42));
    assert!(remote.get("k").is_some());
}

#[tokio::test]
async fn overlapping_triggers_do_not_interleave() {
    let remote = Arc::new(MemoryTransport::new());
    let key = EncryptionKey::generate();
    let device = memory_device::<Counter>(&remote, &key, 100);
    let keys: Vec<String> = (0..20).map(|i| format!("k{i:02}")).collect();
    device
        .store
        .write_batch(keys.iter().map(|k| (k.clone(), counter(1))).collect())
        .unwrap();

    let (first, second, third) = tokio::join!(
        device.store.trigger(keys.clone()),
        device.store.trigger(keys.clone()),
        device.store.trigger_unsynced(),
    );
    let (first, second, third) = (first.unwrap(), second.unwrap(), third.unwrap());

    assert_eq!(first.pushed.len(), 20);
    assert_eq!(second.unchanged.len(), 20);
    assert!(second.pushed.is_empty());
    assert!(third.pushed.is_empty() && third.unchanged.is_empty());
    assert_eq!(remote.counters().writes, 1);
}

#[tokio::test]
async fn pending_removal_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MemoryTransport::new());
    let key = EncryptionKey::generate();

    {
        let device = dir_device(dir.path(), &remote, &key, 100);
        device
            .store
            .write_batch(vec![("keep", counter(1)), ("drop", counter(2))])
            .unwrap();
        device.store.trigger(["keep", "drop"]).await.unwrap();
        assert_eq!(remote.len(), 2);

        remote.set_online(false);
        let report = device.store.remove_batch(&["drop"]).unwrap().await.unwrap();
        assert!(report.removed.is_empty());
        device.store.close().await;
    }

    remote.set_online(true);
    let device = dir_device(dir.path(), &remote, &key, 200);
    assert_eq!(device.store.pending_removal_keys(), vec!["drop"]);
    assert_eq!(device.store.read_local("drop", counter(0)), counter(0));

    let report = device.store.trigger(["keep", "drop"]).await.unwrap();
    assert_eq!(report.removed, vec!["drop"]);
    assert_eq!(report.unchanged, vec!["keep"]);
    assert!(remote.get("drop").is_none());
    assert!(device.store.pending_removal_keys().is_empty());
}

#[tokio::test]
async fn device_still_holding_a_deleted_key_restores_it() {
    let remote = Arc::new(MemoryTransport::new());
    let key = EncryptionKey::generate();
    let a = memory_device::<Counter>(&remote, &key, 100);
    let b = memory_device::<Counter>(&remote, &key, 100);

    a.store.write_batch(vec![("k", counter(1))]).unwrap();
    a.store.trigger(["k"]).await.unwrap();
    b.store.try_read_local_then_remote("k").await.unwrap();

    a.store.remove_batch(&["k"]).unwrap().await.unwrap();
    assert!(remote.is_empty());

    let report = b.store.trigger(["k"]).await.unwrap();
    assert_eq!(report.pushed, vec!["k"]);
    assert_eq!(remote.len(), 1);
}

#[tokio::test]
async fn wrong_key_fails_per_key_only() {
    let remote = Arc::new(MemoryTransport::new());
    let a = memory_device::<Counter>(&remote, &EncryptionKey::generate(), 100);
    let b = memory_device::<Counter>(&remote, &EncryptionKey::generate(), 100);

    a.store.write_batch(vec![("shared", counter(1))]).unwrap();
    a.store.trigger(["shared"]).await.unwrap();

    b.store
        .write_batch(vec![("shared", counter(2)), ("own", counter(3))])
        .unwrap();
    let report = b.store.trigger(["shared", "own"]).await.unwrap();
    assert_eq!(report.pushed, vec!["own"]);
    assert_eq!(report.failed.len(), 1);
    assert!(matches!(&report.failed[0], (k, SyncError::Crypto(_)) if k == "shared"));
    assert!(b.store.unsynced_keys().contains(&"shared".to_string()));
    assert_eq!(b.store.stats().key_failures, 1);
}

#[tokio::test]
async fn field_level_resolver_unions_sets() {
    type Tags = BTreeSet<String>;

    fn union(local: &LocalRecord<Tags>, remote: &RemoteRecord<Tags>) -> Result<LocalRecord<Tags>, String> {
        Ok(LocalRecord {
            value: local.value.union(&remote.value).cloned().collect(),
            ..local.clone()
        })
    }

    fn tags(list: &[&str]) -> Tags {
        list.iter().map(|s| s.to_string()).collect()
    }

    let remote = Arc::new(MemoryTransport::new());
    let key = EncryptionKey::generate();
    let open = |now| {
        open_device::<Tags, _>(
            Arc::new(InMemoryStore::new()),
            Arc::clone(&remote),
            &key,
            Arc::new(union),
            now,
        )
    };
    let a = open(100);
    let b = open(200);

    a.store.write_batch(vec![("doc", tags(&["red"]))]).unwrap();
    a.store.trigger(["doc"]).await.unwrap();
    b.store.try_read_local_then_remote("doc").await.unwrap();

    a.clock.set(300);
    a.store.write_batch(vec![("doc", tags(&["red", "blue"]))]).unwrap();
    b.clock.set(310);
    b.store.write_batch(vec![("doc", tags(&["red", "green"]))]).unwrap();

    a.store.trigger(["doc"]).await.unwrap();
    let report = b.store.trigger(["doc"]).await.unwrap();
    assert_eq!(report.merged, vec!["doc"]);
    a.store.trigger(["doc"]).await.unwrap();

    let expected = tags(&["blue", "green", "red"]);
    assert_eq!(a.store.read_local("doc", Tags::new()), expected);
    assert_eq!(b.store.read_local("doc", Tags::new()), expected);

    // Merged version dominates both inputs even though the resolver kept it
    let record = b.store.ledger().read("doc").unwrap().unwrap();
    assert_eq!(record.version, 3);
}

#[tokio::test]
async fn devices_sync_over_http_loopback() {
    let backend = Arc::new(MemoryTransport::new());
    let key = EncryptionKey::generate();
    let http = |now| {
        open_device::<Counter, _>(
            Arc::new(InMemoryStore::new()),
            HttpTransport::new("http://kv.local/", LoopbackClient::new(Arc::clone(&backend))),
            &key,
            Arc::new(PreferHigherVersion),
            now,
        )
    };
    let a = http(100);
    let b = http(100);

    a.store.write_batch(vec![("k", counter(9))]).unwrap();
    assert_eq!(a.store.trigger(["k"]).await.unwrap().pushed, vec!["k"]);
    assert_eq!(backend.len(), 1);

    assert_eq!(
        b.store.try_read_local_then_remote("k").await.unwrap(),
        Some(counter(9))
    );

    a.store.remove_batch(&["k"]).unwrap().await.unwrap();
    assert!(backend.is_empty());
}
