//! Authenticated encryption of the persisted state blob.
//!
//! The state file must be unreadable and unforgeable without the daemon's
//! passphrase: any bit-flip, truncation, or wrong-passphrase decryption
//! attempt has to fail loudly so the keeper can enter the locked state.
//! AES-256-GCM provides both properties; the key is derived from the
//! passphrase with a domain-separated SHA-256.
//!
//! # Blob layout
//!
//! ```text
//! +----------------+---------------------------+
//! | nonce (12 B)   | ciphertext + GCM tag (16 B) |
//! +----------------+---------------------------+
//! ```
//!
//! The nonce is freshly sampled per encryption, so two encryptions of the
//! same plaintext produce different blobs. There is no outer header; the
//! domain prefix of the key derivation is versioned instead, leaving room
//! for a future KDF upgrade without changing the blob framing.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

/// Length of the random nonce prefixed to every blob.
pub const NONCE_LEN: usize = 12;

/// Length of the GCM authentication tag appended to the ciphertext.
pub const TAG_LEN: usize = 16;

/// Domain separator mixed into the key derivation.
///
/// Versioned so that a future KDF change yields unrelated keys and every
/// old blob is rejected as an auth failure rather than misparsed.
const KEY_DOMAIN: &[u8] = b"timefence.state_key.v1";

/// Errors raised by [`PassphraseCipher::decrypt`].
///
/// All variants collapse to a single integrity violation at the keeper
/// layer; the distinction exists for logging and tests.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// Input shorter than the nonce prefix.
    #[error("ciphertext too short: {actual} bytes, need at least {min}")]
    TooShort {
        /// Length of the rejected input.
        actual: usize,
        /// Minimum length a well-formed blob can have.
        min: usize,
    },

    /// Nonce prefix present but the body cannot hold a GCM tag.
    #[error("malformed ciphertext body: {body_len} bytes after nonce")]
    MalformedCiphertext {
        /// Length of the body after the nonce prefix.
        body_len: usize,
    },

    /// Tag verification failed: bit-flip, truncation, or wrong passphrase.
    #[error("authentication failed")]
    AuthFailure,

    /// The AEAD backend rejected the plaintext.
    #[error("encryption failed")]
    EncryptFailure,
}

/// Symmetric cipher keyed by a caller-supplied passphrase.
///
/// The derived key lives in process memory only and is zeroized on drop.
/// The cipher is stateless with respect to the payloads it processes.
pub struct PassphraseCipher {
    key: Zeroizing<[u8; 32]>,
}

impl PassphraseCipher {
    /// Derives the 256-bit key from the passphrase.
    ///
    /// The derivation is deterministic: the same passphrase always yields
    /// the same key, and different passphrases yield independent keys.
    #[must_use]
    pub fn new(passphrase: &SecretString) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_DOMAIN);
        hasher.update(passphrase.expose_secret().as_bytes());
        let key: [u8; 32] = hasher.finalize().into();
        Self {
            key: Zeroizing::new(key),
        }
    }

    /// Encrypts `plaintext` into a `nonce || ciphertext+tag` blob.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::EncryptFailure`] if the AEAD backend rejects
    /// the payload (only possible for pathological plaintext sizes).
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_ref()));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CipherError::EncryptFailure)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypts a `nonce || ciphertext+tag` blob back to the plaintext.
    ///
    /// # Errors
    ///
    /// - [`CipherError::TooShort`] if the input cannot hold the nonce.
    /// - [`CipherError::MalformedCiphertext`] if the body after the nonce
    ///   cannot hold the authentication tag.
    /// - [`CipherError::AuthFailure`] on any bit-flip, truncation of the
    ///   body, or decryption under a different passphrase.
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CipherError> {
        if blob.len() < NONCE_LEN {
            return Err(CipherError::TooShort {
                actual: blob.len(),
                min: NONCE_LEN,
            });
        }
        let (nonce_bytes, body) = blob.split_at(NONCE_LEN);
        if body.len() < TAG_LEN {
            return Err(CipherError::MalformedCiphertext {
                body_len: body.len(),
            });
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_ref()));
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), body)
            .map_err(|_| CipherError::AuthFailure)
    }
}

impl std::fmt::Debug for PassphraseCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("PassphraseCipher").finish_non_exhaustive()
    }
}
