//! # KeySync Engine
//!
//! Offline-first key/value sync for multi-device applications.
//!
//! This crate provides:
//! - Local ledger with unsynced and pending-removal key tracking
//! - Remote ledger with per-value AES-256-GCM encryption
//! - Decision-table reconciliation with pluggable conflict resolution
//! - Serialized sync scheduling with optional automatic passes
//! - HTTP transport abstraction
//!
//! ## Architecture
//!
//! Every key carries a `synced` marker: the remote timestamp its local copy
//! was last reconciled with. A pass:
//! 1. Reads the local records and asks the remote only for keys that moved
//!    past their marker
//! 2. Classifies each key as push, pull, merge or nothing
//! 3. Writes pulls and merges locally
//! 4. Uploads pushes and merges, then commits the new markers
//!
//! ## Key Invariants
//!
//! - Reads and writes never wait on the network
//! - Local effects are applied before the matching upload
//! - A key is synced only after the remote acknowledged its exact timestamp
//! - One pass at a time per store
//! - The remote only ever sees ciphertext

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod config;
mod crypto;
mod engine;
mod error;
mod http;
mod local;
mod record;
mod remote;
mod resolve;
mod scheduler;
mod store;
mod transport;

pub use codec::{from_cbor, to_cbor};
pub use config::SyncConfig;
pub use crypto::{AesGcmCipher, Cipher, EncryptionKey, PlaintextCipher, KEY_SIZE};
pub use engine::{plan, Action, SyncEngine, SyncReport, SyncStats};
pub use error::{SyncError, SyncResult};
pub use http::{
    serve_kv, HttpClient, HttpTransport, LoopbackClient, ReadRequest, ReadResponse,
    RemoveRequest, WriteRequest, WriteResponse,
};
pub use local::{ConditionalWrite, LocalLedger};
pub use record::{
    is_stale, is_unsynced, Clock, EntityValue, LocalRecord, ManualClock, RemoteRecord, SystemClock,
};
pub use remote::{Fetched, RemoteLedger};
pub use resolve::{ConflictResolver, PreferHigherVersion};
pub use scheduler::{PendingSync, SyncScheduler};
pub use store::SyncStore;
pub use transport::{
    answer_query, MemoryTransport, RawRead, RemoteQuery, RemoteTransport, SealedRecord,
    TransportCounters, WriteOutcome, WriteStatus,
};
