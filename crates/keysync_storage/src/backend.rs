//! Local store trait definition.

use crate::error::StorageResult;

/// A synchronous key/value store.
///
/// Stores hold opaque bytes under string keys. The sync ledger layers
/// records, key sets and namespaces on top; the store never interprets
/// what it holds.
///
/// # Invariants
///
/// - `get` returns exactly the bytes most recently passed to `set` for that key
/// - `delete` of an absent key succeeds
/// - `list_keys` returns every present key, sorted
/// - Stores must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryStore`] - For testing
/// - [`super::DirStore`] - For persistent storage
pub trait LocalStore: Send + Sync {
    /// Returns the value stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying medium cannot be read.
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not representable by the store or an
    /// I/O error occurs.
    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Removes `key` from the store.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs. A missing key is not an error.
    fn delete(&self, key: &str) -> StorageResult<()>;

    /// Lists every key currently present, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns an error if the key listing cannot be produced.
    fn list_keys(&self) -> StorageResult<Vec<String>>;

    /// Lists the keys that start with `prefix`, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns an error if the key listing cannot be produced.
    fn list_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .list_keys()?
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    /// Ensures every completed `set`/`delete` is durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&self) -> StorageResult<()>;
}

impl<S: LocalStore + ?Sized> LocalStore for std::sync::Arc<S> {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        (**self).set(key, value)
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        (**self).delete(key)
    }

    fn list_keys(&self) -> StorageResult<Vec<String>> {
        (**self).list_keys()
    }

    fn list_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        (**self).list_prefix(prefix)
    }

    fn flush(&self) -> StorageResult<()> {
        (**self).flush()
    }
}
