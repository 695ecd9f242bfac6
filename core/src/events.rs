// Typed publish/subscribe for state changes
//
// Handlers run synchronously on the publishing task, in registration order.
// The handler list is snapshotted before dispatch, so a handler may
// subscribe or unsubscribe without deadlocking.

use crate::identity::{PeerId, Trust};
use crate::message::{Message, MessageKey, MessageStatus};
use crate::transport::TransportState;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Something that can be published on an [`EventBus`].
pub trait Event: Send + Sync + 'static {
    type Kind: Copy + Eq + Hash + fmt::Debug + Send + Sync;

    fn kind(&self) -> Self::Kind;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub struct EventBus<E: Event> {
    handlers: RwLock<HashMap<E::Kind, Vec<(SubscriptionToken, Handler<E>)>>>,
    next_token: AtomicU64,
}

impl<E: Event> EventBus<E> {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn subscribe<F>(&self, kind: E::Kind, handler: F) -> SubscriptionToken
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push((token, Arc::new(handler)));
        token
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut handlers = self.handlers.write();
        let mut removed = false;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(existing, _)| *existing != token);
            removed |= list.len() != before;
        }
        removed
    }

    pub fn publish(&self, event: E) {
        let snapshot: Vec<Handler<E>> = self
            .handlers
            .read()
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        for handler in snapshot {
            handler(&event);
        }
    }

    pub fn handler_count(&self, kind: E::Kind) -> usize {
        self.handlers.read().get(&kind).map(Vec::len).unwrap_or(0)
    }
}

impl<E: Event> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Why an inbound payload or key could not be trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityWarning {
    /// The directory's anchor did not sign the peer's key.
    SignatureInvalid,
    /// A message failed authentication under the conversation key.
    DecryptionFailed { key: MessageKey },
    /// A plaintext message arrived although a conversation key exists.
    Unencrypted { key: MessageKey },
}

/// State changes surfaced to the application.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    MessageReceived {
        peer: PeerId,
        message: Message,
        /// `None` when no key was available or decryption failed.
        plaintext: Option<String>,
    },
    StatusChanged {
        peer: PeerId,
        key: MessageKey,
        status: MessageStatus,
    },
    TransportChanged {
        peer: PeerId,
        state: TransportState,
    },
    TrustChanged {
        peer: PeerId,
        trust: Trust,
    },
    UnreadReset {
        peer: PeerId,
    },
    IntegrityWarning {
        peer: PeerId,
        warning: IntegrityWarning,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreEventKind {
    MessageReceived,
    StatusChanged,
    TransportChanged,
    TrustChanged,
    UnreadReset,
    IntegrityWarning,
}

impl Event for CoreEvent {
    type Kind = CoreEventKind;

    fn kind(&self) -> CoreEventKind {
        match self {
            CoreEvent::MessageReceived { .. } => CoreEventKind::MessageReceived,
            CoreEvent::StatusChanged { .. } => CoreEventKind::StatusChanged,
            CoreEvent::TransportChanged { .. } => CoreEventKind::TransportChanged,
            CoreEvent::TrustChanged { .. } => CoreEventKind::TrustChanged,
            CoreEvent::UnreadReset { .. } => CoreEventKind::UnreadReset,
            CoreEvent::IntegrityWarning { .. } => CoreEventKind::IntegrityWarning,
        }
    }
}
