//! Sealed bearer tokens.
//!
//! A token is `header || AES-256-GCM(payload)` encoded as base64url without
//! padding. The plaintext header is bound to the ciphertext as associated
//! data, which also pins the payload kind.

mod header;
pub mod payload;

use aes_gcm::Aes256Gcm;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Key, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use header::{ALG_AES_256_GCM, HEADER_SIZE, TAG_SIZE, TokenHeader};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;

pub use payload::{ObjectGrant, SealedPayload, SessionClaims};

#[derive(Debug, Error, Eq, PartialEq)]
pub enum TokenError {
    #[error("Invalid token format")]
    InvalidToken,

    #[error("Token kind mismatch: expected {expected}, got {actual}")]
    KindMismatch { expected: u8, actual: u8 },

    #[error("AEAD decryption failed")]
    AeadFail,

    #[error("Encryption failed")]
    SealFail,

    #[error("Key not found: {0}")]
    KeyNotFound(u8),

    #[error("Key ID {0} already exists")]
    DuplicateKey(u8),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

/// Signing keys indexed by key id, with one current key for sealing.
///
/// Tokens sealed under any key still in the ring keep opening after the
/// current key changes.
#[derive(Clone, Debug)]
pub struct KeyRing {
    keys: Arc<RwLock<HashMap<u8, [u8; 32]>>>,
    current_kid: Arc<AtomicU8>,
}

impl KeyRing {
    /// Create a key ring with one randomly generated key
    pub fn new() -> Self {
        let mut key = [0u8; 32];
        use rand::RngCore;
        rand::thread_rng().fill_bytes(&mut key);

        Self::with_key(1, key)
    }

    /// Create a key ring from configured keys, falling back to a random key
    pub fn from_config(config_keys: Vec<(u8, [u8; 32])>) -> Self {
        let Some(first_kid) = config_keys.iter().map(|(kid, _)| *kid).min() else {
            return Self::new();
        };

        Self {
            keys: Arc::new(RwLock::new(HashMap::from_iter(config_keys))),
            current_kid: Arc::new(AtomicU8::new(first_kid)),
        }
    }

    pub fn with_key(kid: u8, key: [u8; 32]) -> Self {
        Self {
            keys: Arc::new(RwLock::new(HashMap::from([(kid, key)]))),
            current_kid: Arc::new(AtomicU8::new(kid)),
        }
    }

    pub fn add_key(&self, kid: u8, key: [u8; 32]) -> Result<(), TokenError> {
        let mut keys = self.keys.write();
        if keys.contains_key(&kid) {
            return Err(TokenError::DuplicateKey(kid));
        }
        keys.insert(kid, key);
        Ok(())
    }

    /// Set the key id used for sealing new tokens
    pub fn set_current_kid(&self, kid: u8) -> Result<(), TokenError> {
        if !self.keys.read().contains_key(&kid) {
            return Err(TokenError::KeyNotFound(kid));
        }
        self.current_kid.store(kid, Ordering::Relaxed);
        Ok(())
    }

    pub fn seal<P: SealedPayload>(&self, payload: &P) -> Result<String, TokenError> {
        let kid = self.current_kid.load(Ordering::Relaxed);
        let key = *self
            .keys
            .read()
            .get(&kid)
            .ok_or(TokenError::KeyNotFound(kid))?;

        let header = TokenHeader::new(kid, ALG_AES_256_GCM, P::KIND);
        let header_bytes = header.to_bytes();
        let payload_bytes = payload.encode()?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&header.nonce),
                aes_gcm::aead::Payload {
                    msg: &payload_bytes,
                    aad: &header_bytes,
                },
            )
            .map_err(|_| TokenError::SealFail)?;

        let mut token_bytes = header_bytes;
        token_bytes.extend_from_slice(&ciphertext);

        Ok(URL_SAFE_NO_PAD.encode(token_bytes))
    }

    /// Authenticate and decode a token. Expiry is left to the caller, who
    /// owns the clock.
    pub fn open<P: SealedPayload>(&self, token: &str) -> Result<P, TokenError> {
        let token_bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| TokenError::InvalidToken)?;

        if token_bytes.len() < HEADER_SIZE + TAG_SIZE {
            return Err(TokenError::InvalidToken);
        }

        let header = TokenHeader::from_bytes(&token_bytes[..HEADER_SIZE])?;
        if header.alg != ALG_AES_256_GCM {
            return Err(TokenError::InvalidHeader(format!(
                "Unsupported algorithm: {}",
                header.alg
            )));
        }
        if header.kind != P::KIND {
            return Err(TokenError::KindMismatch {
                expected: P::KIND,
                actual: header.kind,
            });
        }

        let key = *self
            .keys
            .read()
            .get(&header.kid)
            .ok_or(TokenError::KeyNotFound(header.kid))?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let payload_bytes = cipher
            .decrypt(
                Nonce::from_slice(&header.nonce),
                aes_gcm::aead::Payload {
                    msg: &token_bytes[HEADER_SIZE..],
                    aad: &token_bytes[..HEADER_SIZE],
                },
            )
            .map_err(|_| TokenError::AeadFail)?;

        P::decode(&payload_bytes)
    }
}

impl Default for KeyRing {
    fn default() -> Self {
        Self::new()
    }
}
