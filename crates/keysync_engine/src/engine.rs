//! The reconciliation engine.
//!
//! One pass reads the local records for a set of keys, asks the remote for
//! anything newer than each key's `synced` marker, and classifies every key
//! with [`plan`]:
//!
//! | # | Local vs remote | Action |
//! |---|---|---|
//! | 1 | local missing | [`Action::Skip`] |
//! | 2 | `NotModified`, local synced | [`Action::NoOp`] |
//! | 3 | `NotModified`, local unsynced | [`Action::Push`] |
//! | 4 | `NotFound` | [`Action::Push`] |
//! | 5 | same timestamp | [`Action::NoOp`] |
//! | 6 | `synced == remote.timestamp` | [`Action::Push`] |
//! | 7 | `synced == local.timestamp` | [`Action::Pull`] |
//! | 8 | otherwise | [`Action::Merge`] |
//!
//! Pulled and merged records are written locally before anything is
//! uploaded, so a crash mid-pass leaves local data ahead of the remote and
//! the next pass pushes it again.

use crate::error::{SyncError, SyncResult};
use crate::local::LocalLedger;
use crate::record::{is_stale, is_unsynced, EntityValue, LocalRecord, RemoteRecord};
use crate::remote::{Fetched, RemoteLedger};
use crate::resolve::{merged_version, ConflictResolver};
use crate::transport::{RemoteQuery, RemoteTransport, WriteOutcome};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What a pass does with one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// No local record; the key is not synced.
    Skip,
    /// Both sides already agree.
    NoOp,
    /// Upload the local record.
    Push,
    /// Replace the local record with the remote one.
    Pull,
    /// Both sides changed; resolve, write locally, then upload.
    Merge,
}

/// Classifies one key. Rows are evaluated in order; the first match wins.
pub fn plan<V>(local: Option<&LocalRecord<V>>, remote: &Fetched<V>) -> Action {
    let Some(local) = local else {
        return Action::Skip;
    };
    match remote {
        Fetched::NotModified if !is_unsynced(local) => Action::NoOp,
        Fetched::NotModified => Action::Push,
        Fetched::NotFound => Action::Push,
        Fetched::Found(remote) if is_stale(local, remote) => Action::NoOp,
        Fetched::Found(remote) if local.synced == remote.timestamp => Action::Push,
        Fetched::Found(_) if !is_unsynced(local) => Action::Pull,
        Fetched::Found(_) => Action::Merge,
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Keys whose local value was replaced by the remote one.
    pub pulled: Vec<String>,
    /// Keys whose local value was replaced by a resolver merge.
    pub merged: Vec<String>,
    /// Keys uploaded and committed unchanged.
    pub pushed: Vec<String>,
    /// Keys that needed nothing.
    pub unchanged: Vec<String>,
    /// Keys that failed this pass and stay unsynced.
    pub failed: Vec<(String, SyncError)>,
    /// Keys whose remote delete was confirmed.
    pub removed: Vec<String>,
    /// Wall time of the pass.
    pub duration: Duration,
}

impl SyncReport {
    /// Keys whose local value changed, in key order.
    ///
    /// In-memory state derived from these keys should be reloaded.
    pub fn changed_keys(&self) -> Vec<String> {
        let changed: BTreeSet<&String> = self.pulled.iter().chain(&self.merged).collect();
        changed.into_iter().cloned().collect()
    }

    /// Returns true if no key failed.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Statistics accumulated across passes.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Passes that ran to completion.
    pub passes_completed: u64,
    /// Passes aborted by a remote failure.
    pub passes_failed: u64,
    /// Keys pulled.
    pub keys_pulled: u64,
    /// Keys pushed.
    pub keys_pushed: u64,
    /// Keys merged.
    pub keys_merged: u64,
    /// Conflicts detected, whether or not the merge succeeded.
    pub conflicts_encountered: u64,
    /// Per-key failures.
    pub key_failures: u64,
    /// Keys removed remotely.
    pub keys_removed: u64,
    /// End of the last completed pass.
    pub last_sync_time: Option<Instant>,
    /// Message of the last failure.
    pub last_error: Option<String>,
}

/// Work collected while classifying a batch.
struct Classified<V> {
    local_writes: Vec<(LocalRecord<V>, Option<u64>)>,
    pulls: BTreeSet<String>,
    merges: BTreeSet<String>,
    pushes: Vec<LocalRecord<V>>,
    /// Already identical remotely; only the `synced` marker is behind.
    settled: Vec<(String, u64)>,
}

impl<V> Default for Classified<V> {
    fn default() -> Self {
        Self {
            local_writes: Vec::new(),
            pulls: BTreeSet::new(),
            merges: BTreeSet::new(),
            pushes: Vec::new(),
            settled: Vec::new(),
        }
    }
}

/// Reconciles local records with the remote ledger.
pub struct SyncEngine<V, T> {
    local: Arc<LocalLedger<V>>,
    remote: RemoteLedger<V, T>,
    resolver: Arc<dyn ConflictResolver<V>>,
    stats: RwLock<SyncStats>,
}

impl<V: EntityValue, T: RemoteTransport> SyncEngine<V, T> {
    /// Creates an engine.
    pub fn new(
        local: Arc<LocalLedger<V>>,
        remote: RemoteLedger<V, T>,
        resolver: Arc<dyn ConflictResolver<V>>,
    ) -> Self {
        Self {
            local,
            remote,
            resolver,
            stats: RwLock::new(SyncStats::default()),
        }
    }

    /// The local ledger.
    pub fn local(&self) -> &Arc<LocalLedger<V>> {
        &self.local
    }

    /// The remote ledger.
    pub fn remote(&self) -> &RemoteLedger<V, T> {
        &self.remote
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Runs one reconciliation pass over `keys`.
    ///
    /// Pending remote deletes are flushed first. Keys still waiting for their
    /// remote delete are not reconciled.
    ///
    /// # Errors
    ///
    /// Returns the remote error if the batch read fails. If the upload fails,
    /// returns [`SyncError::UploadFailed`] carrying the report of the pulls
    /// and merges already applied locally; they are kept.
    pub async fn reconcile(&self, keys: &[String]) -> SyncResult<SyncReport> {
        let start = Instant::now();
        let mut report = SyncReport {
            removed: self.flush_removals().await,
            ..SyncReport::default()
        };

        let mut seen = BTreeSet::new();
        let keys: Vec<&String> = keys
            .iter()
            .filter(|k| seen.insert(k.as_str()) && !self.local.is_pending_removal(k))
            .collect();

        // A key must exist locally to be synced.
        let present: Vec<LocalRecord<V>> = self.local.read_batch(&keys).into_iter().flatten().collect();

        // Ask only for what changed since each key's synced marker.
        let queries: Vec<RemoteQuery> = present
            .iter()
            .map(|r| match r.synced {
                0 => RemoteQuery::any(&r.key),
                synced => RemoteQuery::if_none_match(&r.key, synced),
            })
            .collect();
        let answers = match self.remote.try_read_batch(&queries).await {
            Ok(answers) => answers,
            Err(e) => return Err(self.pass_failed(e)),
        };

        let mut work = Classified::default();
        let mut conflicts = 0;
        for (local, answer) in present.into_iter().zip(answers) {
            let answer = match answer {
                Ok(answer) => answer,
                Err(e) => {
                    tracing::warn!(key = %local.key, error = %e, "unreadable remote record");
                    report.failed.push((local.key, e));
                    continue;
                }
            };

            let action = plan(Some(&local), &answer);
            tracing::debug!(key = %local.key, ?action, "classified");
            match (action, answer) {
                (Action::Skip, _) => {}
                (Action::NoOp, Fetched::Found(remote)) if local.is_unsynced() => {
                    work.settled.push((local.key.clone(), remote.timestamp));
                    report.unchanged.push(local.key);
                }
                (Action::NoOp, _) => report.unchanged.push(local.key),
                (Action::Push, _) => work.pushes.push(local),
                (Action::Pull, Fetched::Found(remote)) => {
                    let expected = Some(local.timestamp);
                    work.pulls.insert(local.key);
                    work.local_writes.push((LocalRecord::pulled_from(remote), expected));
                }
                (Action::Merge, Fetched::Found(remote)) => {
                    conflicts += 1;
                    match self.merge(&local, &remote) {
                        Ok(merged) => {
                            work.merges.insert(local.key);
                            work.local_writes.push((merged, Some(local.timestamp)));
                        }
                        Err(e) => {
                            tracing::warn!(key = %local.key, error = %e, "conflict left unresolved");
                            report.failed.push((local.key, e));
                        }
                    }
                }
                (Action::Pull | Action::Merge, _) => {
                    report.failed.push((
                        local.key.clone(),
                        SyncError::Protocol(format!("no remote record to apply for {}", local.key)),
                    ));
                }
            }
        }

        // Local effects land before any upload.
        let mut uploads = work.pushes;
        let merged_records: BTreeMap<String, LocalRecord<V>> = work
            .local_writes
            .iter()
            .filter(|(r, _)| work.merges.contains(&r.key))
            .map(|(r, _)| (r.key.clone(), r.clone()))
            .collect();
        let applied = match self.local.write_batch_if_unchanged(work.local_writes) {
            Ok(applied) => applied,
            Err(e) => return Err(self.pass_failed(e)),
        };
        for key in applied.failed {
            report.failed.push((
                key.clone(),
                SyncError::PartialWrite {
                    keys: vec![key],
                },
            ));
        }
        for key in applied.written {
            if work.pulls.contains(&key) {
                report.pulled.push(key);
            } else if let Some(merged) = merged_records.get(&key) {
                uploads.push(merged.clone());
                report.merged.push(key);
            }
        }
        self.settle(&work.settled);

        // Upload, then commit what the remote stored.
        if !uploads.is_empty() {
            let records: Vec<RemoteRecord<V>> = uploads.iter().map(LocalRecord::to_remote).collect();
            let statuses = match self.remote.write_batch(&records).await {
                Ok(statuses) => statuses,
                Err(e) => {
                    report.duration = start.elapsed();
                    self.record_keys(&report, conflicts);
                    return Err(SyncError::UploadFailed {
                        source: Box::new(self.pass_failed(e)),
                        report: Box::new(report),
                    });
                }
            };

            let uploaded: BTreeMap<&str, u64> =
                records.iter().map(|r| (r.key.as_str(), r.timestamp)).collect();
            let mut stored = Vec::with_capacity(statuses.len());
            for status in statuses {
                match status.outcome {
                    WriteOutcome::Stored => match uploaded.get(status.key.as_str()) {
                        Some(timestamp) => stored.push((status.key, *timestamp)),
                        None => tracing::warn!(key = %status.key, "acknowledged a key never sent"),
                    },
                    WriteOutcome::Rejected(reason) => {
                        tracing::warn!(key = %status.key, %reason, "remote rejected record");
                        report
                            .failed
                            .push((status.key, SyncError::transport_fatal(reason)));
                    }
                }
            }

            match self.local.commit_synced(&stored) {
                Ok(committed) => report.pushed.extend(
                    committed
                        .into_iter()
                        .filter(|k| !work.merges.contains(k)),
                ),
                Err(e) => tracing::warn!(error = %e, "failed to commit uploaded records"),
            }
        }

        report.duration = start.elapsed();
        self.record_keys(&report, conflicts);
        self.pass_completed(&report);
        Ok(report)
    }

    /// Resolves a conflict and normalizes the merged record.
    ///
    /// Unlike a plain local write, the merged record's `synced` moves to the
    /// remote timestamp it absorbed, so a failed upload is re-pushed rather
    /// than merged again.
    fn merge(&self, local: &LocalRecord<V>, remote: &RemoteRecord<V>) -> SyncResult<LocalRecord<V>> {
        let merged = self
            .resolver
            .resolve(local, remote)
            .map_err(|reason| SyncError::ConflictResolution {
                key: local.key.clone(),
                reason,
            })?;
        if merged.key != local.key {
            return Err(SyncError::ConflictResolution {
                key: local.key.clone(),
                reason: format!("resolver returned a record for {}", merged.key),
            });
        }

        let newest = local.timestamp.max(remote.timestamp);
        Ok(LocalRecord {
            version: merged_version(local.version, remote.version, merged.version),
            timestamp: self.local.clock().next_after(Some(newest)),
            // The merge has seen the remote write.
            synced: remote.timestamp,
            ..merged
        })
    }

    /// Marks records identical to the remote as synced.
    fn settle(&self, settled: &[(String, u64)]) {
        if settled.is_empty() {
            return;
        }
        if let Err(e) = self.local.commit_synced(settled) {
            tracing::warn!(error = %e, "failed to mark records synced");
        }
    }

    /// Sends pending remote deletes and confirms them locally.
    async fn flush_removals(&self) -> Vec<String> {
        let pending = self.local.pending_removal_keys();
        if pending.is_empty() {
            return pending;
        }

        if let Err(e) = self.remote.remove_batch(&pending).await {
            tracing::warn!(count = pending.len(), error = %e, "remote delete failed, will retry");
            return Vec::new();
        }
        match self.local.confirm_removed(&pending) {
            Ok(()) => {
                tracing::debug!(count = pending.len(), "remote deletes confirmed");
                pending
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to confirm remote deletes");
                Vec::new()
            }
        }
    }

    fn record_keys(&self, report: &SyncReport, conflicts: u64) {
        let mut stats = self.stats.write();
        stats.keys_pulled += report.pulled.len() as u64;
        stats.keys_pushed += report.pushed.len() as u64;
        stats.keys_merged += report.merged.len() as u64;
        stats.keys_removed += report.removed.len() as u64;
        stats.key_failures += report.failed.len() as u64;
        stats.conflicts_encountered += conflicts;
        if let Some((_, e)) = report.failed.last() {
            stats.last_error = Some(e.to_string());
        }
    }

    fn pass_completed(&self, report: &SyncReport) {
        tracing::info!(
            pulled = report.pulled.len(),
            merged = report.merged.len(),
            pushed = report.pushed.len(),
            unchanged = report.unchanged.len(),
            failed = report.failed.len(),
            removed = report.removed.len(),
            duration_ms = report.duration.as_millis() as u64,
            "sync pass complete"
        );
        let mut stats = self.stats.write();
        stats.passes_completed += 1;
        stats.last_sync_time = Some(Instant::now());
    }

    fn pass_failed(&self, error: SyncError) -> SyncError {
        tracing::warn!(error = %error, "sync pass aborted");
        let mut stats = self.stats.write();
        stats.passes_failed += 1;
        stats.last_error = Some(error.to_string());
        error
    }
}

impl<V, T> std::fmt::Debug for SyncEngine<V, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("stats", &*self.stats.read())
            .finish_non_exhaustive()
    }
}
