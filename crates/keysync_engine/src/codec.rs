//! CBOR encoding for records, values and key sets.

use crate::error::{SyncError, SyncResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes `value` as CBOR.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> SyncResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).map_err(|e| SyncError::Codec(e.to_string()))?;
    Ok(out)
}

/// Decodes a CBOR-encoded `T`.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> SyncResult<T> {
    ciborium::from_reader(bytes).map_err(|e| SyncError::Codec(e.to_string()))
}
