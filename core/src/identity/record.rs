// Published peer key records and their signatures

use super::{keys::fingerprint, PeerId};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

/// A peer's published agreement key, as served by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerKeyRecord {
    pub peer: PeerId,
    pub public_key: Vec<u8>,
    /// Trust-anchor signature over `public_key`.
    pub signature: Vec<u8>,
    /// Milliseconds since the Unix epoch.
    pub issued_at: u64,
    /// Set locally once the user has compared fingerprints out of band.
    #[serde(default)]
    pub verified: bool,
}

impl PeerKeyRecord {
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key)
    }
}

/// Sign a public key with the trust anchor.
pub fn sign_public_key(anchor: &SigningKey, public_key: &[u8]) -> Vec<u8> {
    anchor.sign(public_key).to_bytes().to_vec()
}

/// Check the anchor's signature over the record's public key bytes.
///
/// Never errors: malformed anchors or signatures simply don't verify.
pub fn verify_record(record: &PeerKeyRecord, anchor: &[u8]) -> bool {
    let Ok(anchor_bytes) = <[u8; 32]>::try_from(anchor) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&anchor_bytes) else {
        return false;
    };
    let Ok(signature_bytes) = <[u8; 64]>::try_from(record.signature.as_slice()) else {
        return false;
    };

    verifying_key
        .verify_strict(&record.public_key, &Signature::from_bytes(&signature_bytes))
        .is_ok()
}
