//! Value encryption for everything that crosses the remote boundary.
//!
//! The engine only sees the [`Cipher`] capability; key material stays
//! inside the cipher.
//!
//! ## Security Model
//!
//! - AES-256-GCM authenticated encryption
//! - Fresh random 96-bit nonce per message
//! - The entity key is bound as associated data, so a ciphertext copied
//!   under another key fails to decrypt
//! - Keys are zeroized on drop and redacted from `Debug`

use crate::error::{SyncError, SyncResult};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Encrypt/decrypt capability handed to the remote ledger.
pub trait Cipher: Send + Sync {
    /// Encrypts `plaintext`, authenticating `context` alongside it.
    fn encrypt(&self, plaintext: &[u8], context: &[u8]) -> SyncResult<Vec<u8>>;

    /// Decrypts a message produced by [`encrypt`](Self::encrypt) with the
    /// same `context`.
    fn decrypt(&self, ciphertext: &[u8], context: &[u8]) -> SyncResult<Vec<u8>>;
}

/// Symmetric data-encryption key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Generates a new random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not exactly 32 bytes long.
    pub fn from_bytes(bytes: &[u8]) -> SyncResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(SyncError::Crypto(format!(
                "invalid key size: expected {KEY_SIZE}, got {}",
                bytes.len()
            )));
        }
        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Derives a key from a passphrase with HKDF-SHA256.
    ///
    /// HKDF is not a password hash; the passphrase should already carry
    /// enough entropy (e.g. one produced by a key-exchange step).
    ///
    /// # Errors
    ///
    /// Returns an error if HKDF expansion fails.
    pub fn derive_from_passphrase(passphrase: &[u8], salt: &[u8]) -> SyncResult<Self> {
        use hkdf::Hkdf;
        use sha2::Sha256;

        let hk = Hkdf::<Sha256>::new(Some(salt), passphrase);
        let mut bytes = [0u8; KEY_SIZE];
        hk.expand(b"keysync-value-key-v1", &mut bytes)
            .map_err(|_| SyncError::Crypto("HKDF expand failed".into()))?;
        Ok(Self { bytes })
    }

    /// Returns the raw key bytes. Never log or persist the result.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// AES-256-GCM cipher.
///
/// Output layout: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    /// Creates a cipher for `key`.
    #[must_use]
    pub fn new(key: &EncryptionKey) -> Self {
        let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));
        Self { cipher }
    }
}

impl Cipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8], context: &[u8]) -> SyncResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: context,
                },
            )
            .map_err(|_| SyncError::Crypto("encryption error".into()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend(sealed);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8], context: &[u8]) -> SyncResult<Vec<u8>> {
        if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
            return Err(SyncError::Crypto("ciphertext too short".into()));
        }

        let nonce = Nonce::from_slice(&ciphertext[..NONCE_SIZE]);
        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &ciphertext[NONCE_SIZE..],
                    aad: context,
                },
            )
            .map_err(|_| SyncError::Crypto("decryption error".into()))
    }
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCipher")
            .field("cipher", &"Aes256Gcm")
            .finish()
    }
}

/// Pass-through cipher for tests and deployments without encryption.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextCipher;

impl Cipher for PlaintextCipher {
    fn encrypt(&self, plaintext: &[u8], _context: &[u8]) -> SyncResult<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8], _context: &[u8]) -> SyncResult<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}
