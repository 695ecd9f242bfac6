// Local key material

use super::PeerId;
use crate::crypto::CryptoError;
use ed25519_dalek::{Signer, SigningKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

/// What a key pair is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    /// X25519 key agreement
    Ecdh,
    /// Ed25519 signatures
    Signing,
}

impl KeyKind {
    /// Label used when publishing to the directory.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Ecdh => "ecdh",
            KeyKind::Signing => "signing",
        }
    }
}

/// A key pair owned by the local identity.
#[derive(Clone)]
pub struct KeyMaterial {
    pub owner: PeerId,
    pub kind: KeyKind,
    pub public_key: Vec<u8>,
    private_key: Zeroizing<Vec<u8>>,
}

impl KeyMaterial {
    /// Generate a new random key pair of the given kind.
    pub fn generate(owner: PeerId, kind: KeyKind) -> Result<Self, CryptoError> {
        let mut secret = [0u8; 32];
        rand::rngs::OsRng
            .try_fill_bytes(&mut secret)
            .map_err(|e| CryptoError::Backend(e.to_string()))?;

        let material = Self::from_secret(owner, kind, &secret);
        secret.zeroize();
        Ok(material)
    }

    /// Rebuild a key pair from its 32-byte secret.
    pub fn from_secret(owner: PeerId, kind: KeyKind, secret: &[u8; 32]) -> Self {
        let public_key = match kind {
            KeyKind::Ecdh => X25519PublicKey::from(&StaticSecret::from(*secret))
                .to_bytes()
                .to_vec(),
            KeyKind::Signing => SigningKey::from_bytes(secret).verifying_key().to_bytes().to_vec(),
        };

        Self {
            owner,
            kind,
            public_key,
            private_key: Zeroizing::new(secret.to_vec()),
        }
    }

    pub fn private_key(&self) -> &[u8] {
        &self.private_key
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key)
    }

    /// Sign data. Only valid for signing keys.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.kind != KeyKind::Signing {
            return Err(CryptoError::InvalidKey(
                "agreement keys cannot sign".to_string(),
            ));
        }
        let secret: [u8; 32] = self
            .private_key
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("signing key must be 32 bytes".to_string()))?;
        let signing_key = SigningKey::from_bytes(&secret);
        Ok(signing_key.sign(data).to_bytes().to_vec())
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("owner", &self.owner)
            .field("kind", &self.kind)
            .field("public_key", &hex::encode(&self.public_key))
            .finish_non_exhaustive()
    }
}

/// Human-comparable fingerprint: SHA-256 of the raw public key bytes,
/// lowercase hex, in groups of four separated by single spaces.
pub fn fingerprint(public_key: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(public_key));
    let mut out = String::with_capacity(digest.len() + digest.len() / 4);
    for (i, ch) in digest.chars().enumerate() {
        if i > 0 && i % 4 == 0 {
            out.push(' ');
        }
        out.push(ch);
    }
    out
}
