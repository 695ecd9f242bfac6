// Cryptography module: payload protection and key agreement

pub mod codec;
pub mod exchange;

pub use codec::{decrypt, encrypt, export_key, import_key, open, seal, SymmetricKey, KEY_LEN, NONCE_LEN};
pub use exchange::{derive_shared_secret, SharedSecret};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The OS random source or an AEAD primitive could not be used.
    #[error("Crypto backend unavailable: {0}")]
    Backend(String),
    /// Malformed or low-order peer key material.
    #[error("Key agreement failed: {0}")]
    KeyAgreement(String),
    /// Authentication failed. Wrong key and tampering are indistinguishable.
    #[error("Decryption failed")]
    Decryption,
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}
