//! In-memory key/value store for testing.

use crate::backend::LocalStore;
use crate::error::StorageResult;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// An in-memory key/value store.
///
/// This store keeps everything in a sorted map and is suitable for:
/// - Unit tests
/// - Integration tests that simulate several devices
/// - Ephemeral devices that don't need persistence
///
/// # Thread Safety
///
/// This store is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use keysync_storage::{LocalStore, InMemoryStore};
///
/// let store = InMemoryStore::new();
/// store.set("a", b"1").unwrap();
/// store.set("b", b"2").unwrap();
/// assert_eq!(store.list_keys().unwrap(), vec!["a", "b"]);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `entries`.
    ///
    /// Useful for testing recovery scenarios.
    #[must_use]
    pub fn with_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Vec<u8>)>,
        K: Into<String>,
    {
        Self {
            entries: RwLock::new(entries.into_iter().map(|(k, v)| (k.into(), v)).collect()),
        }
    }

    /// Returns a copy of everything in the store.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.entries.read().clone()
    }

    /// Returns the number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the store holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl LocalStore for InMemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn list_keys(&self) -> StorageResult<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }

    fn list_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .entries
            .read()
            .range(prefix.to_string()..)
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn flush(&self) -> StorageResult<()> {
        // Nothing is buffered
        Ok(())
    }
}
