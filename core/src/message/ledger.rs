// Message ledger: per-peer conversations with ordered history,
// monotonic delivery status and the conversation key.
//
// Each conversation sits behind its own lock, so unrelated peers never
// contend. A key index maps message keys to the owning conversation so
// receipts can be applied without scanning every peer.

use super::types::{Message, MessageKey, MessageStatus};
use crate::crypto::SharedSecret;
use crate::identity::PeerId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// One peer's conversation.
#[derive(Debug)]
pub struct Conversation {
    peer: PeerId,
    messages: Vec<Message>,
    secret: Option<SharedSecret>,
    unread: u32,
}

impl Conversation {
    fn new(peer: PeerId) -> Self {
        Self {
            peer,
            messages: Vec::new(),
            secret: None,
            unread: 0,
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Messages in (timestamp, sender) order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn secret(&self) -> Option<&SharedSecret> {
        self.secret.as_ref()
    }

    pub fn unread_count(&self) -> u32 {
        self.unread
    }

    fn find_mut(&mut self, key: &MessageKey) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.matches_key(key))
    }
}

/// What `append` did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    /// Already present. `advanced` is the new status if the copy moved it forward.
    Duplicate { advanced: Option<MessageStatus> },
}

/// A status change applied by the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub peer: PeerId,
    pub key: MessageKey,
    pub status: MessageStatus,
}

pub struct MessageLedger {
    local: PeerId,
    conversations: RwLock<HashMap<PeerId, Arc<Mutex<Conversation>>>>,
    index: RwLock<HashMap<MessageKey, PeerId>>,
}

impl MessageLedger {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            conversations: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
        }
    }

    fn conversation(&self, peer: PeerId) -> Arc<Mutex<Conversation>> {
        if let Some(conversation) = self.conversations.read().get(&peer) {
            return Arc::clone(conversation);
        }
        Arc::clone(
            self.conversations
                .write()
                .entry(peer)
                .or_insert_with(|| Arc::new(Mutex::new(Conversation::new(peer)))),
        )
    }

    fn existing(&self, peer: PeerId) -> Option<Arc<Mutex<Conversation>>> {
        self.conversations.read().get(&peer).cloned()
    }

    fn index_message(&self, peer: PeerId, message: &Message) {
        let mut index = self.index.write();
        index.insert(message.composite_key(), peer);
        if let Some(id) = message.id {
            index.insert(MessageKey::Id { id }, peer);
        }
    }

    /// Insert a message into `peer`'s conversation, keeping (timestamp, sender)
    /// order. A duplicate never creates a second entry; it may advance the
    /// stored status or fill in a relay id the stored copy lacked.
    pub fn append(&self, peer: PeerId, message: Message) -> AppendOutcome {
        let conversation = self.conversation(peer);
        let mut conversation = conversation.lock();

        let duplicate = conversation
            .messages
            .iter_mut()
            .find(|m| m.is_same_as(&message))
            .map(|existing| {
                if existing.id.is_none() && message.id.is_some() {
                    existing.id = message.id;
                }
                let advanced = if existing.status.can_advance_to(message.status) {
                    existing.status = message.status;
                    Some(message.status)
                } else {
                    None
                };
                (existing.clone(), advanced)
            });

        if let Some((snapshot, advanced)) = duplicate {
            drop(conversation);
            self.index_message(peer, &snapshot);
            debug!("Duplicate message {:?} from {}", snapshot.key(), snapshot.sender);
            return AppendOutcome::Duplicate { advanced };
        }

        if message.sender != self.local && message.status == MessageStatus::Delivered {
            conversation.unread += 1;
        }

        let order = (message.timestamp, message.sender);
        let position = conversation
            .messages
            .partition_point(|m| (m.timestamp, m.sender) <= order);
        self.index_message(peer, &message);
        conversation.messages.insert(position, message);
        AppendOutcome::Inserted
    }

    /// Move a message's status forward. Returns `None` for unknown messages and
    /// for transitions that would not move forward.
    pub fn transition(&self, key: MessageKey, status: MessageStatus) -> Option<StatusChange> {
        let peer = *self.index.read().get(&key)?;
        let conversation = self.existing(peer)?;
        let mut conversation = conversation.lock();
        let message = conversation.find_mut(&key)?;

        if !message.status.can_advance_to(status) {
            debug!(
                "Ignoring {:?} -> {:?} for {:?}",
                message.status, status, key
            );
            return None;
        }

        let was_unread = message.sender != self.local && message.status == MessageStatus::Delivered;
        message.status = status;
        let composite = message.composite_key();
        if was_unread && status == MessageStatus::Read {
            conversation.unread = conversation.unread.saturating_sub(1);
        }

        Some(StatusChange {
            peer,
            key: composite,
            status,
        })
    }

    /// Mark every delivered message from `peer` as read and reset the unread
    /// count. Returns the messages that changed.
    pub fn mark_all_read_from(&self, peer: PeerId) -> Vec<Message> {
        let Some(conversation) = self.existing(peer) else {
            return Vec::new();
        };
        let mut conversation = conversation.lock();

        let mut changed = Vec::new();
        for message in conversation.messages.iter_mut() {
            if message.sender == peer && message.status.can_advance_to(MessageStatus::Read) {
                message.status = MessageStatus::Read;
                changed.push(message.clone());
            }
        }
        conversation.unread = 0;
        changed
    }

    /// Attach a relay-assigned id to a message we sent.
    pub fn assign_id(&self, key: MessageKey, id: u64) -> bool {
        let Some(peer) = self.index.read().get(&key).copied() else {
            return false;
        };
        let Some(conversation) = self.existing(peer) else {
            return false;
        };

        let snapshot = {
            let mut conversation = conversation.lock();
            match conversation.find_mut(&key) {
                Some(message) if message.id.is_none() => {
                    message.id = Some(id);
                    message.clone()
                }
                _ => return false,
            }
        };
        self.index_message(peer, &snapshot);
        true
    }

    /// Install or replace the conversation key. Returns true if one was replaced.
    pub fn install_secret(&self, peer: PeerId, secret: SharedSecret) -> bool {
        let conversation = self.conversation(peer);
        let replaced = conversation.lock().secret.replace(secret).is_some();
        replaced
    }

    pub fn secret(&self, peer: PeerId) -> Option<SharedSecret> {
        self.existing(peer)?.lock().secret.clone()
    }

    pub fn clear_secret(&self, peer: PeerId) -> bool {
        self.existing(peer)
            .map(|c| c.lock().secret.take().is_some())
            .unwrap_or(false)
    }

    pub fn get(&self, key: &MessageKey) -> Option<Message> {
        let peer = *self.index.read().get(key)?;
        let conversation = self.existing(peer)?;
        let conversation = conversation.lock();
        let found = conversation.messages.iter().find(|m| m.matches_key(key)).cloned();
        found
    }

    /// Ordered copy of a conversation's messages.
    pub fn messages(&self, peer: PeerId) -> Vec<Message> {
        self.existing(peer)
            .map(|c| c.lock().messages.clone())
            .unwrap_or_default()
    }

    pub fn unread_count(&self, peer: PeerId) -> u32 {
        self.existing(peer).map(|c| c.lock().unread).unwrap_or(0)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.conversations.read().keys().copied().collect();
        peers.sort();
        peers
    }

    /// Drop a conversation and everything it holds.
    pub fn remove_conversation(&self, peer: PeerId) -> bool {
        let removed = self.conversations.write().remove(&peer).is_some();
        if removed {
            self.index.write().retain(|_, owner| *owner != peer);
        }
        removed
    }
}
