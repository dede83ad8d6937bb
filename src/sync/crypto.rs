//! Crypto Manager - End-to-End Encryption for Task Sync
//!
//! Implements the zero-knowledge encryption layer for cross-device sync.
//! - User passphrase → PBKDF2-HMAC-SHA256 (600,000 iterations) → 256-bit key
//! - AES-256-GCM encryption with a fresh random nonce per call
//! - SHA-256 checksums for integrity verification
//! - Zeroize for secure memory cleanup
//!
//! Security Properties:
//! - Server never sees plaintext task data
//! - Identical plaintexts never produce identical ciphertext or nonce
//! - Tampering with ciphertext or nonce fails authentication
//! - Key material is wiped on logout and on drop

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::digest::{digest, SHA256};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::num::NonZeroU32;
use std::sync::RwLock;
use zeroize::Zeroize;

/// AES-256-GCM nonce length (96 bits)
pub const NONCE_LEN: usize = 12;

/// Derived key length (256 bits)
pub const KEY_LEN: usize = 32;

/// Per-account salt length
pub const SALT_LEN: usize = 32;

/// PBKDF2 work factor. OWASP-recommended floor for HMAC-SHA256.
pub const PBKDF2_ITERATIONS: NonZeroU32 = match NonZeroU32::new(600_000) {
    Some(n) => n,
    None => panic!("iteration count must be non-zero"),
};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Encryption key not initialized")]
    NotInitialized,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Wrong key, tampered ciphertext, tampered nonce, or a swapped
    /// ciphertext/nonce pair. Intentionally carries no detail.
    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("RNG failure: {0}")]
    Rng(String),

    #[error("Compression failed: {0}")]
    Compression(String),
}

// ============================================================================
// Data Types
// ============================================================================

/// The only form in which task content leaves the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    /// Ciphertext with the 16-byte authentication tag appended
    pub ciphertext: Vec<u8>,
    /// The random nonce used for this encryption
    pub nonce: [u8; NONCE_LEN],
}

/// Wrapper for key material that zeroizes on drop
struct SecureKey([u8; KEY_LEN]);

impl Drop for SecureKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl AsRef<[u8]> for SecureKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

struct KeyState {
    key: SecureKey,
    salt: [u8; SALT_LEN],
}

// ============================================================================
// Crypto Manager
// ============================================================================

/// Holds the session encryption key derived from the user's passphrase.
///
/// The key is either fully initialized or every encrypt/decrypt call fails
/// fast with [`CryptoError::NotInitialized`]; there is no partial state.
/// `clear()` must be called on logout; it wipes the key and forgets the
/// salt.
pub struct CryptoManager {
    state: RwLock<Option<KeyState>>,
}

impl CryptoManager {
    /// Create a manager with no key material.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(None),
        }
    }

    /// Derive the session key from a passphrase and the stored per-account
    /// salt.
    ///
    /// PBKDF2-HMAC-SHA256 with 600,000 iterations; CPU-bound (hundreds of
    /// milliseconds), so async callers should run it on a blocking thread.
    /// Re-derivation with the same inputs is idempotent.
    pub fn derive_key(&self, passphrase: &str, salt: &[u8; SALT_LEN]) -> Result<(), CryptoError> {
        if passphrase.is_empty() {
            return Err(CryptoError::KeyDerivation(
                "Passphrase cannot be empty".to_string(),
            ));
        }

        let mut key = [0u8; KEY_LEN];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            PBKDF2_ITERATIONS,
            salt,
            passphrase.as_bytes(),
            &mut key,
        );

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        *state = Some(KeyState {
            key: SecureKey(key),
            salt: *salt,
        });
        Ok(())
    }

    /// Whether a key has been derived this session.
    pub fn is_initialized(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// The salt the current key was derived with, if initialized.
    pub fn salt(&self) -> Option<[u8; SALT_LEN]> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| s.salt)
    }

    /// Wipe the key and forget the salt. Called on logout.
    ///
    /// All subsequent encrypt/decrypt calls fail until the key is
    /// re-derived.
    pub fn clear(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        // SecureKey zeroizes on drop
        *state = None;
    }

    /// Encrypt a plaintext with AES-256-GCM.
    ///
    /// A fresh random nonce is generated per call, so encrypting the same
    /// plaintext twice never yields the same ciphertext or nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedBlob, CryptoError> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let key_state = state.as_ref().ok_or(CryptoError::NotInitialized)?;

        let rng = SystemRandom::new();
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rng.fill(&mut nonce_bytes)
            .map_err(|e| CryptoError::Rng(format!("{:?}", e)))?;

        let unbound = UnboundKey::new(&AES_256_GCM, key_state.key.as_ref())
            .map_err(|e| CryptoError::EncryptionFailed(format!("{:?}", e)))?;
        let key = LessSafeKey::new(unbound);

        let mut in_out = plaintext.to_vec();
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);
        key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|e| CryptoError::EncryptionFailed(format!("{:?}", e)))?;

        Ok(EncryptedBlob {
            ciphertext: in_out,
            nonce: nonce_bytes,
        })
    }

    /// Decrypt a ciphertext with AES-256-GCM.
    ///
    /// Fails with [`CryptoError::DecryptionFailed`] if the authentication
    /// tag does not verify; no partial plaintext is ever returned.
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        nonce: &[u8; NONCE_LEN],
    ) -> Result<Vec<u8>, CryptoError> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let key_state = state.as_ref().ok_or(CryptoError::NotInitialized)?;

        let unbound = UnboundKey::new(&AES_256_GCM, key_state.key.as_ref())
            .map_err(|_| CryptoError::DecryptionFailed)?;
        let key = LessSafeKey::new(unbound);

        let nonce = Nonce::try_assume_unique_for_key(nonce)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        Ok(plaintext.to_vec())
    }
}

impl Default for CryptoManager {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Compute SHA-256 checksum of data (returns hex string)
pub fn compute_sha256(data: &[u8]) -> String {
    let digest_value = digest(&SHA256, data);
    hex::encode(digest_value.as_ref())
}

/// Generate a cryptographically secure random salt.
///
/// Generated once per account and persisted in the sync config.
pub fn generate_salt() -> Result<[u8; SALT_LEN], CryptoError> {
    let rng = SystemRandom::new();
    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt)
        .map_err(|e| CryptoError::Rng(format!("{:?}", e)))?;
    Ok(salt)
}

/// Gzip-compress data for transport.
///
/// Applied to ciphertext only (compress-after-encrypt), never to
/// plaintext.
pub fn gzip_compress(data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| CryptoError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CryptoError::Compression(e.to_string()))
}

/// Gzip-decompress data received from transport.
pub fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CryptoError::Compression(e.to_string()))?;
    Ok(out)
}

// ============================================================================
// Tests
// ============================================================================
