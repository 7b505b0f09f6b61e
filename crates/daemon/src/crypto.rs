//! Per-direction AEAD state for an established session.
//!
//! Keys come out of the external key agreement; this module only applies
//! them. The outer header is the associated data and the nonce is the
//! per-direction salt followed by the big-endian message counter, so a
//! counter never produces the same nonce twice within a session.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use thiserror::Error;

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 4;
const NONCE_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("message failed authentication")]
    AuthFail,
    #[error("message could not be sealed")]
    SealFail,
}

/// One direction of a session: an AEAD key plus its nonce salt.
pub struct CipherState {
    cipher: ChaCha20Poly1305,
    salt: [u8; SALT_LEN],
}

impl CipherState {
    pub fn new(key: &[u8; KEY_LEN], salt: [u8; SALT_LEN]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            salt,
        }
    }

    fn nonce(&self, counter: u64) -> Nonce {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..SALT_LEN].copy_from_slice(&self.salt);
        nonce[SALT_LEN..].copy_from_slice(&counter.to_be_bytes());
        Nonce::from(nonce)
    }

    /// Open a ciphertext produced under `counter`, authenticating `aad`.
    pub fn open(&self, counter: u64, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .decrypt(
                &self.nonce(counter),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::AuthFail)
    }

    /// Seal a plaintext under `counter`, authenticating `aad`.
    pub fn seal(&self, counter: u64, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .encrypt(
                &self.nonce(counter),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::SealFail)
    }
}
