//! End-to-end payload encryption for opsync.
//!
//! This module provides:
//! - Argon2id key derivation from the account password
//! - XChaCha20-Poly1305 encryption with 192-bit nonces
//! - Payload sealing/opening for [`Operation`]s
//!
//! # Security Notes
//!
//! - XChaCha20 uses 192-bit nonces (24 bytes), safe for random generation
//! - Argon2id parameters are fixed: every device of an account must derive
//!   the same key from the same password
//! - The salt binds the key to the account (SHA-256 of a domain tag and the
//!   user id), so equal passwords on different accounts yield different keys
//! - Subkeys are derived via HKDF-SHA256 for cryptographic separation
//!
//! Sealed payloads are `base64(nonce || ciphertext)` over the MessagePack
//! encoding of the JSON payload, carried as a JSON string.

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use opsync_types::{Operation, UserId};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Nonce size for XChaCha20-Poly1305 (192 bits = 24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Key size for XChaCha20-Poly1305 (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

/// Crypto errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (wrong key or tampered data).
    #[error("decryption failed: authentication error")]
    DecryptionFailed,

    /// Sealed payload is not valid base64 or is too short.
    #[error("malformed encrypted payload: {0}")]
    MalformedPayload(String),

    /// Payload could not be (de)serialized.
    #[error("payload encoding failed: {0}")]
    Encoding(String),

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),
}

/// Argon2id parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Argon2Params {
    memory_mib: u32,
    iterations: u32,
    parallelism: u32,
}

impl Argon2Params {
    /// Create explicit parameters.
    pub fn new(memory_mib: u32, iterations: u32, parallelism: u32) -> Self {
        Self {
            memory_mib,
            iterations,
            parallelism,
        }
    }

    /// Get memory in MiB.
    pub fn memory_mib(&self) -> u32 {
        self.memory_mib
    }

    /// Get iteration count.
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Convert to argon2 Params.
    fn to_argon2_params(self) -> Result<Params, CryptoError> {
        Params::new(
            self.memory_mib * 1024, // Convert MiB to KiB
            self.iterations,
            self.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))
    }
}

impl Default for Argon2Params {
    /// 19 MiB, 2 iterations, 1 lane.
    fn default() -> Self {
        Self::new(19, 2, 1)
    }
}

/// Salt for `user_id`: SHA-256 of a domain tag and the id.
fn account_salt(user_id: &UserId) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"opsync-password-salt-v1");
    hasher.update(user_id.as_str().as_bytes());
    hasher.finalize().into()
}

/// Payload key derived from an account password.
///
/// Holds the payload encryption subkey and a non-secret key id used to tell
/// whether two devices are on the same password.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PayloadKey {
    encryption_key: [u8; KEY_SIZE],
    key_id: [u8; 8],
}

impl PayloadKey {
    /// Derive the key for `user_id` from `password` with default parameters.
    pub fn from_password(password: &str, user_id: &UserId) -> Result<Self, CryptoError> {
        Self::from_password_with_params(password, user_id, Argon2Params::default())
    }

    /// Derive with explicit Argon2 parameters.
    pub fn from_password_with_params(
        password: &str,
        user_id: &UserId,
        params: Argon2Params,
    ) -> Result<Self, CryptoError> {
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.to_argon2_params()?);

        let mut master = [0u8; KEY_SIZE];
        argon2
            .hash_password_into(password.as_bytes(), &account_salt(user_id), &mut master)
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

        let key = Self::from_master(&master);
        master.zeroize();
        key
    }

    /// Create a random key (for testing).
    pub fn random() -> Self {
        let mut master = [0u8; KEY_SIZE];
        getrandom::getrandom(&mut master).expect("getrandom failed");
        let key = Self::from_master(&master).expect("hkdf expand failed");
        master.zeroize();
        key
    }

    fn from_master(master: &[u8; KEY_SIZE]) -> Result<Self, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(b"opsync-payload-key-v1"), master);

        let mut encryption_key = [0u8; KEY_SIZE];
        let mut key_id = [0u8; 8];
        hkdf.expand(b"payload-encryption", &mut encryption_key)
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
        hkdf.expand(b"key-id", &mut key_id)
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

        Ok(Self {
            encryption_key,
            key_id,
        })
    }

    /// Hex key id; equal on every device that derived the same key.
    pub fn key_id(&self) -> String {
        hex::encode(self.key_id)
    }

    /// Hex export of the key material, for storage in a 0600 file.
    pub fn to_hex(&self) -> String {
        let mut bytes = [0u8; KEY_SIZE + 8];
        bytes[..KEY_SIZE].copy_from_slice(&self.encryption_key);
        bytes[KEY_SIZE..].copy_from_slice(&self.key_id);
        let encoded = hex::encode(bytes);
        bytes.zeroize();
        encoded
    }

    /// Load a key written by [`Self::to_hex`].
    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let mut bytes = hex::decode(encoded.trim())
            .map_err(|e| CryptoError::MalformedPayload(format!("key: {e}")))?;
        if bytes.len() != KEY_SIZE + 8 {
            bytes.zeroize();
            return Err(CryptoError::MalformedPayload(format!(
                "key: expected {} bytes",
                KEY_SIZE + 8
            )));
        }

        let mut encryption_key = [0u8; KEY_SIZE];
        let mut key_id = [0u8; 8];
        encryption_key.copy_from_slice(&bytes[..KEY_SIZE]);
        key_id.copy_from_slice(&bytes[KEY_SIZE..]);
        bytes.zeroize();

        Ok(Self {
            encryption_key,
            key_id,
        })
    }

    /// Encrypt data using XChaCha20-Poly1305.
    ///
    /// Returns `nonce || ciphertext`. The nonce is 192 bits (24 bytes),
    /// safe for random generation without coordination.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce_bytes)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        let nonce = XNonce::from_slice(&nonce_bytes);

        let cipher = XChaCha20Poly1305::new_from_slice(&self.encryption_key)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed("aead encrypt failed".into()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt `nonce || ciphertext`.
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_SIZE {
            return Err(CryptoError::MalformedPayload(format!(
                "{} bytes is shorter than a nonce",
                sealed.len()
            )));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);

        let cipher = XChaCha20Poly1305::new_from_slice(&self.encryption_key)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Encrypt a JSON payload into a base64 JSON string.
    pub fn seal_payload(&self, payload: &Value) -> Result<Value, CryptoError> {
        let bytes = rmp_serde::to_vec(payload).map_err(|e| CryptoError::Encoding(e.to_string()))?;
        let sealed = self.encrypt(&bytes)?;
        Ok(Value::String(STANDARD.encode(sealed)))
    }

    /// Decrypt a payload produced by [`Self::seal_payload`].
    pub fn open_payload(&self, sealed: &Value) -> Result<Value, CryptoError> {
        let encoded = sealed
            .as_str()
            .ok_or_else(|| CryptoError::MalformedPayload("expected a base64 string".into()))?;
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::MalformedPayload(e.to_string()))?;
        let plaintext = self.decrypt(&bytes)?;
        rmp_serde::from_slice(&plaintext).map_err(|e| CryptoError::Encoding(e.to_string()))
    }

    /// Return a copy of `op` with its payload encrypted.
    ///
    /// Already-encrypted operations are returned unchanged.
    pub fn seal_operation(&self, op: &Operation) -> Result<Operation, CryptoError> {
        if op.is_payload_encrypted {
            return Ok(op.clone());
        }
        let mut sealed = op.clone();
        sealed.payload = self.seal_payload(&op.payload)?;
        sealed.is_payload_encrypted = true;
        Ok(sealed)
    }

    /// Return a copy of `op` with its payload decrypted.
    ///
    /// Plaintext operations are returned unchanged.
    pub fn open_operation(&self, op: &Operation) -> Result<Operation, CryptoError> {
        if !op.is_payload_encrypted {
            return Ok(op.clone());
        }
        let mut opened = op.clone();
        opened.payload = self.open_payload(&op.payload)?;
        opened.is_payload_encrypted = false;
        Ok(opened)
    }
}

// Don't leak keys in debug output
impl std::fmt::Debug for PayloadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PayloadKey {{ encryption_key: [REDACTED], key_id: {} }}",
            self.key_id()
        )
    }
}
