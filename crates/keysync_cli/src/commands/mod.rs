//! CLI command implementations.

pub mod get;
pub mod put;
pub mod remove;
pub mod status;
pub mod sync;

use crate::dir_transport::DirTransport;
use keysync_engine::{AesGcmCipher, Cipher, EncryptionKey, PlaintextCipher, SyncStore};
use keysync_storage::DirStore;
use std::path::Path;
use std::sync::Arc;

/// The store every command works on.
pub type CliStore = SyncStore<serde_json::Value, DirTransport>;

/// Result type shared by the commands.
pub type CommandResult = Result<(), Box<dyn std::error::Error>>;

/// Opens the local store at `local` against the remote directory `remote`.
pub fn open_store(
    local: &Path,
    remote: &Path,
    passphrase: Option<&str>,
) -> Result<CliStore, Box<dyn std::error::Error>> {
    let transport = DirTransport::open(remote)?;
    let cipher: Arc<dyn Cipher> = match passphrase {
        Some(passphrase) => {
            let key = EncryptionKey::derive_from_passphrase(passphrase.as_bytes(), &transport.salt()?)?;
            Arc::new(AesGcmCipher::new(&key))
        }
        None => {
            tracing::warn!("no passphrase given, remote values are not encrypted");
            Arc::new(PlaintextCipher)
        }
    };

    let store = DirStore::open(local)?;
    Ok(SyncStore::open(Arc::new(store), transport, cipher)?)
}
