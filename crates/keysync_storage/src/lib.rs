//! # keysync storage
//!
//! The local key/value store that a keysync ledger persists into.
//!
//! Stores are **opaque byte stores** keyed by strings. They do not know
//! about records, versions, or sync bookkeeping; the ledger in
//! `keysync_engine` owns all interpretation of the bytes.
//!
//! ## Design Principles
//!
//! - All operations are synchronous and expected to be cheap
//! - Values written with `set` survive process restarts (for durable stores)
//! - Deleting an absent key is not an error
//! - Stores must be `Send + Sync` so a ledger can be shared across tasks
//!
//! ## Available Stores
//!
//! - [`InMemoryStore`] - For testing and ephemeral devices
//! - [`DirStore`] - One file per key inside a locked directory
//!
//! ## Example
//!
//! ```rust
//! use keysync_storage::{LocalStore, InMemoryStore};
//!
//! let store = InMemoryStore::new();
//! store.set("greeting", b"hello").unwrap();
//! assert_eq!(store.get("greeting").unwrap(), Some(b"hello".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod dir;
mod error;
mod memory;

pub use backend::LocalStore;
pub use dir::{DirStore, MAX_KEY_LEN};
pub use error::{StorageError, StorageResult};
pub use memory::InMemoryStore;
