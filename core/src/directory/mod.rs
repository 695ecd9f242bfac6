// Key directory and offline backlog services
//
// Both live on the relay server. They are traits so the session can run
// against the HTTP API in production and an in-memory stand-in in tests.

pub mod http;
pub mod memory;

pub use http::HttpDirectory;
pub use memory::{MemoryBacklog, MemoryDirectory};

use crate::identity::{KeyKind, PeerId, PeerKeyRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("Directory request failed: {0}")]
    Request(String),
    #[error("Directory rejected request: {0}")]
    Rejected(String),
    #[error("Malformed directory response: {0}")]
    Malformed(String),
}

/// Public-key directory with a server-held signing anchor.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Publish our public key. The returned record carries the anchor's signature.
    async fn publish_public_key(
        &self,
        owner: PeerId,
        kind: KeyKind,
        public_key: &[u8],
    ) -> Result<PeerKeyRecord, DirectoryError>;

    /// Latest published agreement key for a peer, if any.
    async fn get_peer_key(&self, peer: PeerId) -> Result<Option<PeerKeyRecord>, DirectoryError>;

    /// The anchor's Ed25519 verifying key.
    async fn get_trust_anchor_key(&self) -> Result<Vec<u8>, DirectoryError>;
}

/// A message the relay stored while we were offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogMessage {
    pub id: u64,
    pub sender: PeerId,
    /// Encrypted wire frame.
    pub content: String,
    pub timestamp: u64,
}

/// Messages held by the relay for the authenticated user.
#[async_trait]
pub trait OfflineBacklog: Send + Sync {
    async fn fetch_offline_messages(&self) -> Result<Vec<BacklogMessage>, DirectoryError>;

    /// Tell the relay a backlog message has been read.
    async fn mark_read(&self, message_id: u64) -> Result<(), DirectoryError>;
}
