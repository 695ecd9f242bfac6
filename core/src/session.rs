// Session: one local user's connection to the messaging network
//
// Wires the key manager, ledger, relay channel, direct transports and
// router together, and exposes the command/event surface the application
// talks to. Inbound packets from either route funnel through a single
// queue, so the ledger sees them in arrival order.

use crate::config::SessionConfig;
use crate::crypto::{decrypt, encrypt, CryptoError};
use crate::directory::{Directory, DirectoryError, OfflineBacklog};
use crate::events::{CoreEvent, EventBus, IntegrityWarning};
use crate::identity::{KeyError, KeyExchangeManager, KeyKind, KeyRefresh, PeerId, PeerKeyRecord, Trust};
use crate::init_logging;
use crate::message::{
    decode_packet, now_millis, AppendOutcome, Message, MessageKey, MessageLedger, MessageStatus,
    PeerPacket,
};
use crate::signaling::protocol::{ErrorNotice, InboundMessage, MessageAck};
use crate::signaling::{kinds, RelayConnector, SignalingChannel, SignalingError};
use crate::transport::{
    DirectEngine, LinkNotice, LinkNoticeKind, NegotiateOutcome, NegotiationError, PeerTransport,
    RouteError, TransportRouter, TransportState,
};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No conversation key with peer {0} yet")]
    KeyNotAvailable(PeerId),
    #[error("Message not found")]
    MessageNotFound,
    #[error("Sending to peer {peer} failed: {source}")]
    SendFailed {
        peer: PeerId,
        #[source]
        source: RouteError,
    },
    #[error("No offline backlog service configured")]
    NoBacklog,
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

// ============================================================================
// SESSION
// ============================================================================

/// External services a session runs against.
pub struct Collaborators {
    pub directory: Arc<dyn Directory>,
    pub connector: Arc<dyn RelayConnector>,
    pub engine: Arc<dyn DirectEngine>,
    pub backlog: Option<Arc<dyn OfflineBacklog>>,
}

/// A packet that reached us by either route.
struct Inbound {
    peer: PeerId,
    packet: PeerPacket,
    /// Relay id, for relayed and backlog messages
    id: Option<u64>,
}

pub struct Session {
    local: PeerId,
    keys: KeyExchangeManager,
    ledger: MessageLedger,
    signaling: Arc<SignalingChannel>,
    peers: Arc<PeerTransport>,
    router: Arc<TransportRouter>,
    events: Arc<EventBus<CoreEvent>>,
    backlog: Option<Arc<dyn OfflineBacklog>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    /// Timestamp of our last outgoing message
    last_sent: Mutex<u64>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    pub fn new(local: PeerId, config: SessionConfig, collaborators: Collaborators) -> Arc<Self> {
        init_logging(&config.log_filter);

        let events = Arc::new(EventBus::new());
        let signaling = SignalingChannel::new(config.signaling.clone(), collaborators.connector);
        let peers = PeerTransport::new(
            local,
            config.negotiation.clone(),
            Arc::clone(&signaling),
            collaborators.engine,
        );
        let router = Arc::new(TransportRouter::new(
            config.router.clone(),
            Arc::clone(&peers),
            Arc::clone(&signaling),
            Arc::clone(&events),
        ));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            local,
            keys: KeyExchangeManager::new(local, collaborators.directory),
            ledger: MessageLedger::new(local),
            signaling,
            peers,
            router,
            events,
            backlog: collaborators.backlog,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            last_sent: Mutex::new(0),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn local_id(&self) -> PeerId {
        self.local
    }

    pub fn events(&self) -> &Arc<EventBus<CoreEvent>> {
        &self.events
    }

    pub fn ledger(&self) -> &MessageLedger {
        &self.ledger
    }

    pub fn keys(&self) -> &KeyExchangeManager {
        &self.keys
    }

    pub fn signaling(&self) -> &Arc<SignalingChannel> {
        &self.signaling
    }

    /// Start background processing and connect to the relay.
    pub async fn start(self: &Arc<Self>, credential: &str) -> Result<(), SessionError> {
        let inbound = self.inbound_rx.lock().take();
        if let Some(inbound) = inbound {
            self.register_handlers();

            let mut tasks = Vec::new();
            if let Some(pump) = self.peers.start() {
                tasks.push(pump);
            }
            tasks.push(self.router.spawn_health_monitor());
            tasks.push(self.spawn_inbound_pump(inbound));
            self.tasks.lock().extend(tasks);
        }

        self.signaling.connect(credential).await?;
        info!("Session for {} started", self.local);
        Ok(())
    }

    fn register_handlers(self: &Arc<Self>) {
        let tx = self.inbound_tx.clone();
        self.signaling.on(kinds::MESSAGE, move |payload| {
            match serde_json::from_value::<InboundMessage>(payload.clone()) {
                Ok(message) => {
                    let _ = tx.send(Inbound {
                        peer: message.sender,
                        packet: message.packet,
                        id: message.id,
                    });
                }
                Err(e) => debug!("Dropping malformed relayed message: {}", e),
            }
        });

        let weak = Arc::downgrade(self);
        self.signaling.on(kinds::MESSAGE_ACK, move |payload| {
            let Ok(ack) = serde_json::from_value::<MessageAck>(payload.clone()) else {
                return;
            };
            if let Some(session) = weak.upgrade() {
                let key = MessageKey::composite(session.local, ack.timestamp);
                if session.ledger.assign_id(key, ack.id) {
                    debug!("Relay assigned id {} to message for {}", ack.id, ack.recipient);
                }
            }
        });

        self.signaling.on(kinds::ERROR, |payload| {
            let notice = serde_json::from_value::<ErrorNotice>(payload.clone()).unwrap_or_else(|_| {
                ErrorNotice {
                    message: payload.to_string(),
                }
            });
            warn!("Relay reported an error: {}", notice.message);
        });

        let tx = self.inbound_tx.clone();
        self.peers.notices().subscribe(LinkNoticeKind::Data, move |notice| {
            let LinkNotice::Data { peer, bytes } = notice else {
                return;
            };
            match decode_packet(bytes) {
                Ok(packet) => {
                    let _ = tx.send(Inbound {
                        peer: *peer,
                        packet,
                        id: None,
                    });
                }
                Err(e) => debug!("Dropping undecodable packet from {}: {}", peer, e),
            }
        });
    }

    fn spawn_inbound_pump(self: &Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Inbound>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(next) = inbound.recv().await {
                let Some(session) = weak.upgrade() else {
                    break;
                };
                session.handle_inbound(next).await;
            }
        })
    }

    /// Stop background work, close direct channels and leave the relay.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        for peer in self.peers.known_peers() {
            self.peers.teardown(peer).await;
        }
        self.signaling.disconnect();
        info!("Session for {} shut down", self.local);
    }

    // ========================================================================
    // KEYS & TRUST
    // ========================================================================

    /// Generate local key pairs and publish the agreement key.
    pub async fn initialize_keys(&self) -> Result<PeerKeyRecord, SessionError> {
        self.keys.generate_key_pair(KeyKind::Ecdh)?;
        self.keys.generate_key_pair(KeyKind::Signing)?;
        Ok(self.keys.publish_key(KeyKind::Ecdh).await?)
    }

    /// Fetch the peer's key, check the directory's signature on it and
    /// install the conversation key.
    ///
    /// A key without a valid signature still yields a conversation key, but
    /// raises an integrity warning and reports `signature_valid: false`.
    pub async fn establish_secret(&self, peer: PeerId) -> Result<Trust, SessionError> {
        self.router.track(peer);
        let record = self.keys.fetch_peer_key(peer).await?;
        self.install_secret_from(&record).await
    }

    /// Re-fetch the peer's key. If it rotated, derive and install the new
    /// conversation key. Returns true on rotation.
    pub async fn refresh_secret(&self, peer: PeerId) -> Result<bool, SessionError> {
        if self.keys.refresh_peer_key(peer).await? == KeyRefresh::Unchanged
            && self.ledger.secret(peer).is_some()
        {
            return Ok(false);
        }
        let record = self
            .keys
            .cached_peer_key(peer)
            .ok_or(KeyError::NotFound(peer))?;
        self.install_secret_from(&record).await?;
        Ok(true)
    }

    async fn install_secret_from(&self, record: &PeerKeyRecord) -> Result<Trust, SessionError> {
        let peer = record.peer;
        let anchor = self.keys.fetch_trust_anchor().await?;
        let signature_valid = self.keys.verify_signature(record, &anchor);
        if !signature_valid {
            warn!("⚠️ Key for {} is not signed by the directory", peer);
            self.events.publish(CoreEvent::IntegrityWarning {
                peer,
                warning: IntegrityWarning::SignatureInvalid,
            });
        }

        let secret = self.keys.derive_shared_secret(record)?;
        if self.ledger.install_secret(peer, secret) {
            debug!("Replaced conversation key with {}", peer);
        }

        let fingerprint: String = record.fingerprint().chars().take(9).collect();
        info!("🔐 Conversation key ready with {} ({}…)", peer, fingerprint);

        let trust = Trust {
            signature_valid,
            manually_verified: record.verified,
        };
        self.events.publish(CoreEvent::TrustChanged { peer, trust });
        Ok(trust)
    }

    /// Record that the user compared fingerprints with `peer`.
    pub fn mark_manually_verified(&self, peer: PeerId) -> Result<Trust, SessionError> {
        self.keys.mark_manually_verified(peer)?;
        let trust = self.keys.trust(peer).ok_or(KeyError::NotFound(peer))?;
        self.events.publish(CoreEvent::TrustChanged { peer, trust });
        Ok(trust)
    }

    pub fn trust(&self, peer: PeerId) -> Option<Trust> {
        self.keys.trust(peer)
    }

    // ========================================================================
    // MESSAGING
    // ========================================================================

    fn next_timestamp(&self) -> u64 {
        let mut last = self.last_sent.lock();
        let timestamp = now_millis().max(*last + 1);
        *last = timestamp;
        timestamp
    }

    /// Encrypt and send a message. The conversation key must already be
    /// established.
    pub async fn send_plaintext(&self, peer: PeerId, text: &str) -> Result<Message, SessionError> {
        let secret = self
            .ledger
            .secret(peer)
            .ok_or(SessionError::KeyNotAvailable(peer))?;
        let content = encrypt(text, secret.key())?;
        let timestamp = self.next_timestamp();

        self.router.track(peer);
        let message = Message::outgoing(self.local, peer, content.clone(), timestamp);
        let key = message.composite_key();
        self.ledger.append(peer, message.clone());

        let packet = PeerPacket::Message {
            content,
            timestamp,
            encrypted: true,
        };
        match self.router.send(peer, &packet).await {
            Ok(route) => {
                debug!("Message {} to {} sent via {:?}", timestamp, peer, route);
                Ok(self.ledger.get(&key).unwrap_or(message))
            }
            Err(source) => {
                warn!("Message to {} failed on every route: {}", peer, source);
                if let Some(change) = self.ledger.transition(key, MessageStatus::Failed) {
                    self.events.publish(CoreEvent::StatusChanged {
                        peer: change.peer,
                        key: change.key,
                        status: change.status,
                    });
                }
                Err(SessionError::SendFailed { peer, source })
            }
        }
    }

    async fn handle_inbound(&self, inbound: Inbound) {
        let Inbound { peer, packet, id } = inbound;
        match packet {
            PeerPacket::Message {
                content,
                timestamp,
                encrypted,
            } => {
                let message = Message::incoming(id, peer, self.local, content, timestamp, encrypted);
                self.receive_message(peer, message).await;
            }
            PeerPacket::Receipt {
                sender,
                timestamp,
                status,
            } => self.apply_receipt(peer, sender, timestamp, status),
        }
    }

    /// Merge an inbound message. Returns true if it was new.
    async fn receive_message(&self, peer: PeerId, message: Message) -> bool {
        if let AppendOutcome::Duplicate { .. } = self.ledger.append(peer, message.clone()) {
            debug!("Duplicate delivery of {:?} from {}", message.key(), peer);
            return false;
        }
        self.router.track(peer);

        let plaintext = self.decrypt_inbound(peer, &message).await;
        let stored = self.ledger.get(&message.composite_key()).unwrap_or(message);
        let timestamp = stored.timestamp;
        self.events.publish(CoreEvent::MessageReceived {
            peer,
            message: stored,
            plaintext,
        });

        self.send_receipt(peer, timestamp, MessageStatus::Delivered).await;
        true
    }

    async fn decrypt_inbound(&self, peer: PeerId, message: &Message) -> Option<String> {
        if !message.encrypted {
            if self.ledger.secret(peer).is_some() {
                warn!("⚠️ Unencrypted message from {} in an encrypted conversation", peer);
                self.events.publish(CoreEvent::IntegrityWarning {
                    peer,
                    warning: IntegrityWarning::Unencrypted { key: message.key() },
                });
            }
            return Some(message.content.clone());
        }

        if self.ledger.secret(peer).is_none() {
            if let Err(e) = self.establish_secret(peer).await {
                debug!("No conversation key with {} yet: {}", peer, e);
                return None;
            }
        }
        let secret = self.ledger.secret(peer)?;
        if let Ok(text) = decrypt(&message.content, secret.key()) {
            return Some(text);
        }

        // The sender may have rotated their key since we derived ours
        if let Ok(true) = self.refresh_secret(peer).await {
            if let Some(secret) = self.ledger.secret(peer) {
                if let Ok(text) = decrypt(&message.content, secret.key()) {
                    return Some(text);
                }
            }
        }

        warn!("⚠️ Message from {} failed authentication", peer);
        self.events.publish(CoreEvent::IntegrityWarning {
            peer,
            warning: IntegrityWarning::DecryptionFailed { key: message.key() },
        });
        None
    }

    fn apply_receipt(&self, peer: PeerId, sender: PeerId, timestamp: u64, status: MessageStatus) {
        // Sent and Failed are local decisions; a receipt only confirms progress
        if !matches!(status, MessageStatus::Delivered | MessageStatus::Read) {
            debug!("Ignoring {:?} receipt from {}", status, peer);
            return;
        }
        if sender != self.local {
            debug!("Receipt from {} names a message we did not send", peer);
            return;
        }
        let key = MessageKey::composite(sender, timestamp);
        match self.ledger.get(&key) {
            Some(message) if message.recipient == peer => {}
            _ => {
                debug!("Receipt from {} for unknown message {}", peer, timestamp);
                return;
            }
        }

        if let Some(change) = self.ledger.transition(key, status) {
            self.events.publish(CoreEvent::StatusChanged {
                peer: change.peer,
                key: change.key,
                status: change.status,
            });
        }
    }

    /// Best effort: receipts that cannot be sent are dropped.
    async fn send_receipt(&self, peer: PeerId, timestamp: u64, status: MessageStatus) {
        let receipt = PeerPacket::Receipt {
            sender: peer,
            timestamp,
            status,
        };
        if let Err(e) = self.router.send(peer, &receipt).await {
            debug!("Could not send {:?} receipt to {}: {}", status, peer, e);
        }
    }

    /// Mark everything delivered from `peer` as read, send read receipts
    /// and tell the backlog service. Returns how many messages changed.
    pub async fn mark_read(&self, peer: PeerId) -> Result<usize, SessionError> {
        let changed = self.ledger.mark_all_read_from(peer);

        for message in &changed {
            self.events.publish(CoreEvent::StatusChanged {
                peer,
                key: message.composite_key(),
                status: MessageStatus::Read,
            });
            self.send_receipt(peer, message.timestamp, MessageStatus::Read).await;

            if let (Some(backlog), Some(id)) = (&self.backlog, message.id) {
                if let Err(e) = backlog.mark_read(id).await {
                    debug!("Backlog could not mark {} read: {}", id, e);
                }
            }
        }

        self.events.publish(CoreEvent::UnreadReset { peer });
        Ok(changed.len())
    }

    /// Pull messages the relay stored while we were offline and merge them
    /// like relayed deliveries. Returns how many were new.
    pub async fn sync_offline_backlog(&self) -> Result<usize, SessionError> {
        let backlog = self.backlog.as_ref().ok_or(SessionError::NoBacklog)?;
        let stored = backlog.fetch_offline_messages().await?;

        let mut inserted = 0;
        for entry in stored {
            let message = Message::incoming(
                Some(entry.id),
                entry.sender,
                self.local,
                entry.content,
                entry.timestamp,
                true,
            );
            if self.receive_message(entry.sender, message).await {
                inserted += 1;
            }
        }
        if inserted > 0 {
            info!("📬 Merged {} offline messages", inserted);
        }
        Ok(inserted)
    }

    /// Decrypt a stored message.
    pub fn open_message(&self, key: &MessageKey) -> Result<String, SessionError> {
        let message = self.ledger.get(key).ok_or(SessionError::MessageNotFound)?;
        if !message.encrypted {
            return Ok(message.content);
        }
        let peer = if message.sender == self.local {
            message.recipient
        } else {
            message.sender
        };
        let secret = self
            .ledger
            .secret(peer)
            .ok_or(SessionError::KeyNotAvailable(peer))?;
        Ok(decrypt(&message.content, secret.key())?)
    }

    pub fn conversation(&self, peer: PeerId) -> Vec<Message> {
        self.ledger.messages(peer)
    }

    pub fn unread_count(&self, peer: PeerId) -> u32 {
        self.ledger.unread_count(peer)
    }

    // ========================================================================
    // TRANSPORT
    // ========================================================================

    /// Try to open a direct channel to `peer`. Messages keep flowing over
    /// the relay meanwhile.
    pub async fn negotiate(&self, peer: PeerId) -> Result<NegotiateOutcome, SessionError> {
        self.router.track(peer);
        let outcome = self.peers.negotiate(peer).await?;
        self.router.recheck_peer(peer);
        Ok(outcome)
    }

    /// Negotiate again after the direct channel ended up Failed.
    pub async fn retry_direct(&self, peer: PeerId) -> Result<NegotiateOutcome, SessionError> {
        self.router.track(peer);
        let outcome = self.peers.retry(peer).await?;
        self.router.recheck_peer(peer);
        Ok(outcome)
    }

    pub async fn teardown(&self, peer: PeerId) {
        self.peers.teardown(peer).await;
        self.router.recheck_peer(peer);
    }

    /// Drop everything held for `peer`: the direct channel, the
    /// conversation with its key, the cached key record and routing state.
    pub async fn forget_peer(&self, peer: PeerId) {
        self.peers.teardown(peer).await;
        self.router.forget(peer);
        self.ledger.remove_conversation(peer);
        self.keys.forget_peer(peer);
        info!("Forgot peer {}", peer);
    }

    pub fn transport_state(&self, peer: PeerId) -> TransportState {
        self.router.state(peer)
    }
}
