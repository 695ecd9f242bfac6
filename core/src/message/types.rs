// Message types

use crate::identity::PeerId;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Delivery status of a message.
///
/// Only moves forward: Sent -> Delivered -> Read, or Sent -> Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Left this device
    Sent,
    /// Reached the recipient's device
    Delivered,
    /// Seen by the recipient
    Read,
    /// No route could carry it
    Failed,
}

impl MessageStatus {
    /// Whether `next` is a legal forward transition from `self`.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Sent, Delivered) | (Sent, Read) | (Sent, Failed) | (Delivered, Read)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Read | MessageStatus::Failed)
    }
}

/// Identifies a message across both sides of a conversation.
///
/// Relay-assigned ids are not known at send time, so every message can also
/// be named by its sender and send timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "kebab-case")]
pub enum MessageKey {
    Id { id: u64 },
    Composite { sender: PeerId, timestamp: u64 },
}

impl MessageKey {
    pub fn composite(sender: PeerId, timestamp: u64) -> Self {
        MessageKey::Composite { sender, timestamp }
    }
}

/// A message as stored in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Relay-assigned id, once known.
    pub id: Option<u64>,
    pub sender: PeerId,
    pub recipient: PeerId,
    /// Encrypted wire frame when `encrypted`, plain text otherwise.
    pub content: String,
    /// Sender's clock, milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub status: MessageStatus,
    pub encrypted: bool,
}

impl Message {
    /// A message we just sent.
    pub fn outgoing(sender: PeerId, recipient: PeerId, content: String, timestamp: u64) -> Self {
        Self {
            id: None,
            sender,
            recipient,
            content,
            timestamp,
            status: MessageStatus::Sent,
            encrypted: true,
        }
    }

    /// A message that just reached us.
    pub fn incoming(
        id: Option<u64>,
        sender: PeerId,
        recipient: PeerId,
        content: String,
        timestamp: u64,
        encrypted: bool,
    ) -> Self {
        Self {
            id,
            sender,
            recipient,
            content,
            timestamp,
            status: MessageStatus::Delivered,
            encrypted,
        }
    }

    pub fn composite_key(&self) -> MessageKey {
        MessageKey::composite(self.sender, self.timestamp)
    }

    /// Preferred key: the relay id when known.
    pub fn key(&self) -> MessageKey {
        match self.id {
            Some(id) => MessageKey::Id { id },
            None => self.composite_key(),
        }
    }

    /// Two records describe the same message when their ids match, or,
    /// failing that, when sender and timestamp match.
    pub fn is_same_as(&self, other: &Message) -> bool {
        match (self.id, other.id) {
            (Some(a), Some(b)) => a == b,
            _ => self.sender == other.sender && self.timestamp == other.timestamp,
        }
    }

    pub fn matches_key(&self, key: &MessageKey) -> bool {
        match key {
            MessageKey::Id { id } => self.id == Some(*id),
            MessageKey::Composite { sender, timestamp } => {
                self.sender == *sender && self.timestamp == *timestamp
            }
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
