//! Conflict resolution for keys changed on both sides.

use crate::record::{LocalRecord, RemoteRecord};

/// Merges a local and a remote record that diverged since their last
/// reconciliation point.
///
/// The returned record replaces the local copy and is uploaded. Its key must
/// match the inputs; the engine raises its version above both inputs if the
/// resolver did not.
pub trait ConflictResolver<V>: Send + Sync {
    /// Produces the merged record, or a reason the merge is impossible.
    fn resolve(&self, local: &LocalRecord<V>, remote: &RemoteRecord<V>)
        -> Result<LocalRecord<V>, String>;
}

impl<V, F> ConflictResolver<V> for F
where
    F: Fn(&LocalRecord<V>, &RemoteRecord<V>) -> Result<LocalRecord<V>, String> + Send + Sync,
{
    fn resolve(
        &self,
        local: &LocalRecord<V>,
        remote: &RemoteRecord<V>,
    ) -> Result<LocalRecord<V>, String> {
        self(local, remote)
    }
}

/// Whole-record fallback: the higher `version` wins, a tie keeps local.
///
/// Domain types with sets or maps should merge field by field instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferHigherVersion;

impl<V: Clone> ConflictResolver<V> for PreferHigherVersion {
    fn resolve(
        &self,
        local: &LocalRecord<V>,
        remote: &RemoteRecord<V>,
    ) -> Result<LocalRecord<V>, String> {
        let value = if remote.version > local.version {
            remote.value.clone()
        } else {
            local.value.clone()
        };
        Ok(LocalRecord {
            key: local.key.clone(),
            value,
            timestamp: local.timestamp,
            version: local.version.max(remote.version).saturating_add(1),
            synced: local.synced,
        })
    }
}

/// Version a merged record must carry to dominate both inputs.
pub(crate) fn merged_version(local: u32, remote: u32, proposed: u32) -> u32 {
    let floor = local.max(remote).saturating_add(1);
    proposed.max(floor)
}
