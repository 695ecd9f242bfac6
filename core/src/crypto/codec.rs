// Payload codec: ChaCha20-Poly1305 with a random 96-bit nonce
//
// Frame layout:  nonce[12] || ciphertext || tag[16]
// Wire encoding: base64 (standard alphabet, padded) of the frame
//
// The nonce goes first so a reader can split the frame without knowing the
// ciphertext length.

use super::CryptoError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Nonce length in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Symmetric key length in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// Poly1305 authentication tag length.
const TAG_LEN: usize = 16;

/// A 256-bit symmetric key. Wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a random key from the OS random source.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; KEY_LEN];
        rand::rngs::OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CryptoError::Backend(e.to_string()))?;
        let key = Self(bytes);
        bytes.zeroize();
        Ok(key)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305, CryptoError> {
        ChaCha20Poly1305::new_from_slice(&self.0).map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Encrypt raw bytes into a `nonce || ciphertext+tag` frame.
pub fn seal(plaintext: &[u8], key: &SymmetricKey) -> Result<Vec<u8>, CryptoError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng
        .try_fill_bytes(&mut nonce_bytes)
        .map_err(|e| CryptoError::Backend(e.to_string()))?;

    let ciphertext = key
        .cipher()?
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CryptoError::Backend("AEAD encryption failed".to_string()))?;

    let mut frame = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    frame.extend_from_slice(&nonce_bytes);
    frame.extend_from_slice(&ciphertext);
    Ok(frame)
}

/// Decrypt a `nonce || ciphertext+tag` frame. All-or-nothing.
pub fn open(frame: &[u8], key: &SymmetricKey) -> Result<Vec<u8>, CryptoError> {
    if frame.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Decryption);
    }

    let (nonce, ciphertext) = frame.split_at(NONCE_LEN);
    key.cipher()?
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decryption)
}

/// Encrypt UTF-8 text into the base64 wire frame.
pub fn encrypt(plaintext: &str, key: &SymmetricKey) -> Result<String, CryptoError> {
    Ok(STANDARD.encode(seal(plaintext.as_bytes(), key)?))
}

/// Decrypt a base64 wire frame back into UTF-8 text.
pub fn decrypt(frame: &str, key: &SymmetricKey) -> Result<String, CryptoError> {
    let raw = STANDARD.decode(frame).map_err(|_| CryptoError::Decryption)?;
    let plaintext = open(&raw, key)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::Decryption)
}

/// Serialize a symmetric key for transport (base64 of the raw bytes).
pub fn export_key(key: &SymmetricKey) -> String {
    STANDARD.encode(key.as_bytes())
}

/// Inverse of [`export_key`].
pub fn import_key(encoded: &str) -> Result<SymmetricKey, CryptoError> {
    let mut raw = STANDARD
        .decode(encoded)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let bytes: [u8; KEY_LEN] = raw.as_slice().try_into().map_err(|_| {
        CryptoError::InvalidKey(format!("expected {} bytes, got {}", KEY_LEN, raw.len()))
    })?;
    raw.zeroize();
    Ok(SymmetricKey::from_bytes(bytes))
}
