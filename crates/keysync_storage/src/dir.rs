//! Directory-backed key/value store.
//!
//! Layout:
//!
//! ```text
//! <root>/
//! ├─ LOCK              # Advisory lock for single-owner access
//! └─ data/
//!    ├─ <hex(key)>     # One file per key
//!    └─ <hex(key)>.tmp # In-flight write, renamed into place
//! ```
//!
//! Writes go to a temp file that is fsynced and then renamed over the
//! target, so a crash leaves either the old value or the new one.

use crate::backend::LocalStore;
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const DATA_DIR: &str = "data";
const TEMP_SUFFIX: &str = ".tmp";

/// Longest key, in bytes, that a [`DirStore`] accepts.
///
/// File names are the hex encoding of the key plus [`TEMP_SUFFIX`] while a
/// write is in flight, and must fit the common 255-byte file name limit.
pub const MAX_KEY_LEN: usize = 120;

/// A persistent store keeping one file per key inside a directory.
///
/// The directory is held under an exclusive advisory lock for the lifetime
/// of the store, so two processes cannot own the same ledger.
///
/// Keys are limited to [`MAX_KEY_LEN`] bytes; longer keys are rejected
/// with [`StorageError::InvalidKey`].
///
/// # Example
///
/// ```no_run
/// use keysync_storage::{DirStore, LocalStore};
/// use std::path::Path;
///
/// let store = DirStore::open(Path::new("device-a")).unwrap();
/// store.set("note:1", b"payload").unwrap();
/// ```
#[derive(Debug)]
pub struct DirStore {
    root: PathBuf,
    data: PathBuf,
    /// Serializes writers within this process.
    write_guard: Mutex<()>,
    _lock_file: File,
}

impl DirStore {
    /// Opens or creates a store rooted at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another process owns the
    /// directory, or an I/O error if it cannot be created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let data = path.join(DATA_DIR);
        fs::create_dir_all(&data)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked {
                path: path.to_path_buf(),
            });
        }

        // Leftovers from writes interrupted by a crash
        for entry in fs::read_dir(&data)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().ends_with(TEMP_SUFFIX) {
                tracing::debug!(file = ?entry.path(), "removing interrupted write");
                fs::remove_file(entry.path())?;
            }
        }

        Ok(Self {
            root: path.to_path_buf(),
            data,
            write_guard: Mutex::new(()),
            _lock_file: lock_file,
        })
    }

    /// Returns the root directory of the store.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    fn file_for(&self, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
                reason: "key must not be empty".into(),
            });
        }
        if key.len() > MAX_KEY_LEN {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
                reason: format!("key is {} bytes, the limit is {MAX_KEY_LEN}", key.len()),
            });
        }
        Ok(self.data.join(hex::encode(key.as_bytes())))
    }
}

impl LocalStore for DirStore {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.file_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let path = self.file_for(key)?;
        let mut temp = path.clone().into_os_string();
        temp.push(TEMP_SUFFIX);
        let temp = PathBuf::from(temp);

        let _guard = self.write_guard.lock();
        {
            let mut file = File::create(&temp)?;
            file.write_all(value)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &path)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.file_for(key)?;
        let _guard = self.write_guard.lock();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_keys(&self) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.data)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            let decoded = hex::decode(name.as_bytes())
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok());
            match decoded {
                Some(key) => keys.push(key),
                None => tracing::warn!(file = %name, "ignoring foreign file in store"),
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn flush(&self) -> StorageResult<()> {
        // Every set is already fsynced; sync the directory entry too.
        #[cfg(unix)]
        File::open(&self.data)?.sync_all()?;
        Ok(())
    }
}
