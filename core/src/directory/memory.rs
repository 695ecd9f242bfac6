// In-memory directory and backlog

use super::{BacklogMessage, Directory, DirectoryError, OfflineBacklog};
use crate::identity::{sign_public_key, KeyKind, PeerId, PeerKeyRecord};
use crate::message::now_millis;
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use parking_lot::RwLock;
use rand::RngCore;
use std::collections::{HashMap, HashSet};
use zeroize::Zeroize;

/// Directory that signs published keys with its own anchor.
pub struct MemoryDirectory {
    anchor: SigningKey,
    keys: RwLock<HashMap<PeerId, PeerKeyRecord>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        let mut secret = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        let anchor = SigningKey::from_bytes(&secret);
        secret.zeroize();
        Self::with_anchor(anchor)
    }

    pub fn with_anchor(anchor: SigningKey) -> Self {
        Self {
            anchor,
            keys: RwLock::new(HashMap::new()),
        }
    }

    pub fn anchor_public(&self) -> [u8; 32] {
        self.anchor.verifying_key().to_bytes()
    }

    /// Store a record as-is, bypassing the anchor signature.
    pub fn insert_record(&self, record: PeerKeyRecord) {
        self.keys.write().insert(record.peer, record);
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn publish_public_key(
        &self,
        owner: PeerId,
        kind: KeyKind,
        public_key: &[u8],
    ) -> Result<PeerKeyRecord, DirectoryError> {
        let record = PeerKeyRecord {
            peer: owner,
            public_key: public_key.to_vec(),
            signature: sign_public_key(&self.anchor, public_key),
            issued_at: now_millis(),
            verified: false,
        };

        // Only agreement keys are served to other peers.
        if kind == KeyKind::Ecdh {
            self.keys.write().insert(owner, record.clone());
        }
        Ok(record)
    }

    async fn get_peer_key(&self, peer: PeerId) -> Result<Option<PeerKeyRecord>, DirectoryError> {
        Ok(self.keys.read().get(&peer).cloned())
    }

    async fn get_trust_anchor_key(&self) -> Result<Vec<u8>, DirectoryError> {
        Ok(self.anchor_public().to_vec())
    }
}

/// Offline backlog for a single user.
#[derive(Default)]
pub struct MemoryBacklog {
    messages: RwLock<Vec<BacklogMessage>>,
    read: RwLock<HashSet<u64>>,
}

impl MemoryBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: BacklogMessage) {
        self.messages.write().push(message);
    }

    pub fn is_read(&self, message_id: u64) -> bool {
        self.read.read().contains(&message_id)
    }
}

#[async_trait]
impl OfflineBacklog for MemoryBacklog {
    async fn fetch_offline_messages(&self) -> Result<Vec<BacklogMessage>, DirectoryError> {
        let read = self.read.read();
        Ok(self
            .messages
            .read()
            .iter()
            .filter(|m| !read.contains(&m.id))
            .cloned()
            .collect())
    }

    async fn mark_read(&self, message_id: u64) -> Result<(), DirectoryError> {
        if !self.messages.read().iter().any(|m| m.id == message_id) {
            return Err(DirectoryError::Rejected(format!(
                "unknown message {}",
                message_id
            )));
        }
        self.read.write().insert(message_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::verify_record;

    #[tokio::test]
    async fn test_publish_then_fetch_is_signed() {
        let directory = MemoryDirectory::new();
        directory
            .publish_public_key(PeerId(42), KeyKind::Ecdh, &[5u8; 32])
            .await
            .unwrap();

        let record = directory.get_peer_key(PeerId(42)).await.unwrap().unwrap();
        let anchor = directory.get_trust_anchor_key().await.unwrap();
        assert!(verify_record(&record, &anchor));
    }

    #[tokio::test]
    async fn test_unknown_peer_is_none() {
        let directory = MemoryDirectory::new();
        assert!(directory.get_peer_key(PeerId(9)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_signing_keys_not_served() {
        let directory = MemoryDirectory::new();
        directory
            .publish_public_key(PeerId(1), KeyKind::Signing, &[5u8; 32])
            .await
            .unwrap();
        assert!(directory.is_empty());
    }

    #[tokio::test]
    async fn test_backlog_mark_read_hides_message() {
        let backlog = MemoryBacklog::new();
        backlog.push(BacklogMessage {
            id: 10,
            sender: PeerId(2),
            content: "frame".to_string(),
            timestamp: 1,
        });

        assert_eq!(backlog.fetch_offline_messages().await.unwrap().len(), 1);
        backlog.mark_read(10).await.unwrap();
        assert!(backlog.is_read(10));
        assert!(backlog.fetch_offline_messages().await.unwrap().is_empty());
        assert!(backlog.mark_read(99).await.is_err());
    }
}
