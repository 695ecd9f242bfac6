// Identity & key exchange: local key pairs, peer key records, trust

mod keys;
mod record;

pub use keys::{fingerprint, KeyKind, KeyMaterial};
pub use record::{sign_public_key, verify_record, PeerKeyRecord};

use crate::crypto::{derive_shared_secret, CryptoError, SharedSecret};
use crate::directory::{Directory, DirectoryError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Numeric user identifier assigned by the relay server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PeerId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("No published key for peer {0}")]
    NotFound(PeerId),
    #[error("Local {0:?} key pair has not been generated")]
    MissingLocalKey(KeyKind),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// How far a peer's key is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Trust {
    /// The directory's anchor signed this key.
    pub signature_valid: bool,
    /// The user compared fingerprints out of band.
    pub manually_verified: bool,
}

/// Result of re-fetching a peer's key from the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRefresh {
    Unchanged,
    /// The peer published a different key. Manual verification was cleared.
    Rotated,
}

/// Owns local key pairs and caches peer keys fetched from the directory.
pub struct KeyExchangeManager {
    local: PeerId,
    directory: Arc<dyn Directory>,
    local_keys: RwLock<HashMap<KeyKind, Arc<KeyMaterial>>>,
    peer_keys: RwLock<HashMap<PeerId, PeerKeyRecord>>,
    trust_anchor: RwLock<Option<Vec<u8>>>,
}

impl KeyExchangeManager {
    pub fn new(local: PeerId, directory: Arc<dyn Directory>) -> Self {
        Self {
            local,
            directory,
            local_keys: RwLock::new(HashMap::new()),
            peer_keys: RwLock::new(HashMap::new()),
            trust_anchor: RwLock::new(None),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local
    }

    /// Generate a fresh key pair, replacing any previous pair of the same kind.
    ///
    /// Derivations already in progress keep the pair they started with.
    pub fn generate_key_pair(&self, kind: KeyKind) -> Result<Arc<KeyMaterial>, KeyError> {
        let material = Arc::new(KeyMaterial::generate(self.local, kind)?);
        self.local_keys.write().insert(kind, Arc::clone(&material));
        info!("🔑 Generated {} key pair ({})", kind.as_str(), material.fingerprint());
        Ok(material)
    }

    pub fn local_key(&self, kind: KeyKind) -> Option<Arc<KeyMaterial>> {
        self.local_keys.read().get(&kind).cloned()
    }

    /// Publish the local public key of `kind` to the directory.
    pub async fn publish_key(&self, kind: KeyKind) -> Result<PeerKeyRecord, KeyError> {
        let material = self.local_key(kind).ok_or(KeyError::MissingLocalKey(kind))?;
        let record = self
            .directory
            .publish_public_key(self.local, kind, &material.public_key)
            .await?;
        debug!("Published {} key for {}", kind.as_str(), self.local);
        Ok(record)
    }

    /// Peer key record, served from cache when present.
    pub async fn fetch_peer_key(&self, peer: PeerId) -> Result<PeerKeyRecord, KeyError> {
        if let Some(record) = self.cached_peer_key(peer) {
            return Ok(record);
        }
        self.refresh_peer_key(peer).await?;
        self.cached_peer_key(peer).ok_or(KeyError::NotFound(peer))
    }

    /// Re-fetch a peer's key from the directory and replace the cached copy.
    pub async fn refresh_peer_key(&self, peer: PeerId) -> Result<KeyRefresh, KeyError> {
        let mut fetched = self
            .directory
            .get_peer_key(peer)
            .await?
            .ok_or(KeyError::NotFound(peer))?;

        let mut peer_keys = self.peer_keys.write();
        let outcome = match peer_keys.get(&peer) {
            Some(cached) if cached.public_key == fetched.public_key => {
                fetched.verified = cached.verified;
                KeyRefresh::Unchanged
            }
            Some(cached) => {
                if cached.verified {
                    warn!("Peer {} rotated their key; manual verification cleared", peer);
                } else {
                    info!("Peer {} rotated their key", peer);
                }
                fetched.verified = false;
                KeyRefresh::Rotated
            }
            None => KeyRefresh::Unchanged,
        };
        peer_keys.insert(peer, fetched);
        Ok(outcome)
    }

    pub fn cached_peer_key(&self, peer: PeerId) -> Option<PeerKeyRecord> {
        self.peer_keys.read().get(&peer).cloned()
    }

    /// Forget a peer's cached key (contact removal).
    pub fn forget_peer(&self, peer: PeerId) -> bool {
        self.peer_keys.write().remove(&peer).is_some()
    }

    /// The directory's anchor key, fetched once and cached.
    pub async fn fetch_trust_anchor(&self) -> Result<Vec<u8>, KeyError> {
        if let Some(anchor) = self.trust_anchor.read().clone() {
            return Ok(anchor);
        }
        let anchor = self.directory.get_trust_anchor_key().await?;
        *self.trust_anchor.write() = Some(anchor.clone());
        Ok(anchor)
    }

    /// Whether `anchor` signed the record's public key. Never errors.
    pub fn verify_signature(&self, record: &PeerKeyRecord, anchor: &[u8]) -> bool {
        verify_record(record, anchor)
    }

    /// Record that the user confirmed the peer's fingerprint out of band.
    pub fn mark_manually_verified(&self, peer: PeerId) -> Result<(), KeyError> {
        let mut peer_keys = self.peer_keys.write();
        let record = peer_keys.get_mut(&peer).ok_or(KeyError::NotFound(peer))?;
        record.verified = true;
        info!("✓ Peer {} manually verified", peer);
        Ok(())
    }

    /// Current trust level for a cached peer key.
    pub fn trust(&self, peer: PeerId) -> Option<Trust> {
        let record = self.cached_peer_key(peer)?;
        let anchor = self.trust_anchor.read().clone();
        Some(Trust {
            signature_valid: anchor
                .map(|anchor| verify_record(&record, &anchor))
                .unwrap_or(false),
            manually_verified: record.verified,
        })
    }

    /// Derive the conversation key with a peer from our agreement key.
    pub fn derive_shared_secret(&self, record: &PeerKeyRecord) -> Result<SharedSecret, KeyError> {
        let material = self
            .local_key(KeyKind::Ecdh)
            .ok_or(KeyError::MissingLocalKey(KeyKind::Ecdh))?;
        Ok(derive_shared_secret(
            record.peer,
            material.private_key(),
            &record.public_key,
        )?)
    }
}
