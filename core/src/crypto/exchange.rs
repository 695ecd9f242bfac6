// Key agreement: X25519 Diffie-Hellman followed by a BLAKE3 KDF

use super::{CryptoError, SymmetricKey, KEY_LEN};
use crate::identity::PeerId;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Domain separation for conversation keys.
const KDF_CONTEXT: &str = "tandem v1 conversation key";

/// Symmetric key shared with exactly one peer.
#[derive(Clone, Debug)]
pub struct SharedSecret {
    peer: PeerId,
    key: SymmetricKey,
}

impl SharedSecret {
    pub fn new(peer: PeerId, key: SymmetricKey) -> Self {
        Self { peer, key }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn key(&self) -> &SymmetricKey {
        &self.key
    }
}

/// Derive the conversation key from our private agreement key and the
/// peer's public agreement key. Both sides arrive at the same key.
pub fn derive_shared_secret(
    peer: PeerId,
    local_private: &[u8],
    peer_public: &[u8],
) -> Result<SharedSecret, CryptoError> {
    let mut secret_bytes: [u8; KEY_LEN] = local_private.try_into().map_err(|_| {
        CryptoError::KeyAgreement(format!(
            "local private key must be {} bytes, got {}",
            KEY_LEN,
            local_private.len()
        ))
    })?;
    let public_bytes: [u8; KEY_LEN] = peer_public.try_into().map_err(|_| {
        CryptoError::KeyAgreement(format!(
            "peer public key must be {} bytes, got {}",
            KEY_LEN,
            peer_public.len()
        ))
    })?;

    let secret = StaticSecret::from(secret_bytes);
    secret_bytes.zeroize();

    let shared = secret.diffie_hellman(&X25519PublicKey::from(public_bytes));
    if !shared.was_contributory() {
        return Err(CryptoError::KeyAgreement(
            "peer public key is a low-order point".to_string(),
        ));
    }

    let key = blake3::derive_key(KDF_CONTEXT, shared.as_bytes());
    Ok(SharedSecret::new(peer, SymmetricKey::from_bytes(key)))
}
