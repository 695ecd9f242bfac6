//! Peer transport: direct-channel negotiation, one state machine per peer
//!
//! ```text
//!   Idle ──negotiate──> Negotiating ──channel open──> Direct
//!     ^                    │    ^                       │
//!     │               timeout / error            channel lost
//!     │                    v    │ (auto retry)          v
//!     └──retry()──────── Failed <───────────────────────┘
//! ```
//!
//! All transitions for a peer happen under that peer's lock, so a peer
//! never has two negotiations in flight. Glare (both sides offering at
//! once) is settled by id: the lower id's offer wins.

use super::engine::{DirectEngine, DirectLink, EngineError, LinkEvent, LinkEvents, PeerInput};
use super::TransportState;
use crate::config::NegotiationConfig;
use crate::events::{Event, EventBus};
use crate::identity::PeerId;
use crate::signaling::protocol::InboundSignal;
use crate::signaling::{kinds, SignalEnvelope, SignalKind, SignalingChannel, SignalingError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Remote candidates held per peer before a remote description exists.
const MAX_PENDING_CANDIDATES: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Negotiation timed out")]
    Timeout,
    #[error("Direct channel to peer {0} failed; retry explicitly")]
    Failed(PeerId),
    #[error("Direct channel lost")]
    ChannelLost,
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiateOutcome {
    Started,
    /// A negotiation was already running; no second one was started.
    InFlight,
    AlreadyDirect,
}

/// Lifecycle notices for other components.
#[derive(Debug, Clone)]
pub enum LinkNotice {
    ChannelOpen {
        peer: PeerId,
    },
    ChannelLost {
        peer: PeerId,
    },
    NegotiationFailed {
        peer: PeerId,
        reason: NegotiationError,
        will_retry: bool,
    },
    Data {
        peer: PeerId,
        bytes: Vec<u8>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkNoticeKind {
    ChannelOpen,
    ChannelLost,
    NegotiationFailed,
    Data,
}

impl LinkNotice {
    pub fn peer(&self) -> PeerId {
        match self {
            LinkNotice::ChannelOpen { peer }
            | LinkNotice::ChannelLost { peer }
            | LinkNotice::NegotiationFailed { peer, .. }
            | LinkNotice::Data { peer, .. } => *peer,
        }
    }
}

impl Event for LinkNotice {
    type Kind = LinkNoticeKind;

    fn kind(&self) -> LinkNoticeKind {
        match self {
            LinkNotice::ChannelOpen { .. } => LinkNoticeKind::ChannelOpen,
            LinkNotice::ChannelLost { .. } => LinkNoticeKind::ChannelLost,
            LinkNotice::NegotiationFailed { .. } => LinkNoticeKind::NegotiationFailed,
            LinkNotice::Data { .. } => LinkNoticeKind::Data,
        }
    }
}

enum LinkState {
    Idle,
    Negotiating {
        attempt: u64,
        role: Role,
        link_id: u64,
        link: Arc<dyn DirectLink>,
        /// Remote description applied; candidates can go straight to the link
        ready: bool,
    },
    Direct {
        link_id: u64,
        link: Arc<dyn DirectLink>,
    },
    Failed {
        reason: NegotiationError,
    },
}

impl LinkState {
    fn link_id(&self) -> Option<u64> {
        match self {
            LinkState::Negotiating { link_id, .. } | LinkState::Direct { link_id, .. } => Some(*link_id),
            _ => None,
        }
    }

    fn link(&self) -> Option<&Arc<dyn DirectLink>> {
        match self {
            LinkState::Negotiating { link, .. } | LinkState::Direct { link, .. } => Some(link),
            _ => None,
        }
    }

    fn public(&self) -> TransportState {
        match self {
            LinkState::Idle => TransportState::Idle,
            LinkState::Negotiating { .. } => TransportState::Negotiating,
            LinkState::Direct { .. } => TransportState::Direct,
            LinkState::Failed { .. } => TransportState::Failed,
        }
    }
}

struct PeerSlot {
    state: LinkState,
    pending_candidates: Vec<String>,
    retries_used: u32,
}

impl Default for PeerSlot {
    fn default() -> Self {
        Self {
            state: LinkState::Idle,
            pending_candidates: Vec::new(),
            retries_used: 0,
        }
    }
}

/// Lock-free view of a peer's state for readers outside the state machine.
struct Phase {
    state: TransportState,
    direct: Option<Arc<dyn DirectLink>>,
}

pub struct PeerTransport {
    local: PeerId,
    config: NegotiationConfig,
    signaling: Arc<SignalingChannel>,
    engine: Arc<dyn DirectEngine>,
    slots: Mutex<HashMap<PeerId, Arc<AsyncMutex<PeerSlot>>>>,
    phases: RwLock<HashMap<PeerId, Phase>>,
    notices: EventBus<LinkNotice>,
    inputs_tx: mpsc::UnboundedSender<PeerInput>,
    inputs_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerInput>>>,
    next_link_id: AtomicU64,
    next_attempt: AtomicU64,
}

impl PeerTransport {
    pub fn new(
        local: PeerId,
        config: NegotiationConfig,
        signaling: Arc<SignalingChannel>,
        engine: Arc<dyn DirectEngine>,
    ) -> Arc<Self> {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            local,
            config,
            signaling,
            engine,
            slots: Mutex::new(HashMap::new()),
            phases: RwLock::new(HashMap::new()),
            notices: EventBus::new(),
            inputs_tx,
            inputs_rx: Mutex::new(Some(inputs_rx)),
            next_link_id: AtomicU64::new(1),
            next_attempt: AtomicU64::new(1),
        })
    }

    /// Subscribe to `signal` frames and start processing negotiation input.
    /// Returns `None` if already started.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut inputs = self.inputs_rx.lock().take()?;

        let tx = self.inputs_tx.clone();
        self.signaling.on(kinds::SIGNAL, move |payload| {
            match serde_json::from_value::<InboundSignal>(payload.clone()) {
                Ok(signal) => {
                    let _ = tx.send(PeerInput::Signal(signal.into()));
                }
                Err(e) => debug!("Dropping malformed signal: {}", e),
            }
        });

        let weak = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            while let Some(input) = inputs.recv().await {
                let Some(this) = weak.upgrade() else {
                    break;
                };
                match input {
                    PeerInput::Signal(envelope) => this.handle_signal(envelope).await,
                    PeerInput::Link {
                        peer,
                        link_id,
                        event,
                    } => this.handle_link_event(peer, link_id, event).await,
                }
            }
        }))
    }

    pub fn notices(&self) -> &EventBus<LinkNotice> {
        &self.notices
    }

    pub fn local_id(&self) -> PeerId {
        self.local
    }

    pub fn state(&self, peer: PeerId) -> TransportState {
        self.phases
            .read()
            .get(&peer)
            .map(|p| p.state)
            .unwrap_or(TransportState::Idle)
    }

    pub fn is_direct(&self, peer: PeerId) -> bool {
        self.state(peer) == TransportState::Direct
    }

    /// The open channel to `peer`, if any.
    pub fn direct_link(&self, peer: PeerId) -> Option<Arc<dyn DirectLink>> {
        self.phases.read().get(&peer).and_then(|p| p.direct.clone())
    }

    /// Peers this transport has state for.
    pub fn known_peers(&self) -> Vec<PeerId> {
        self.phases.read().keys().copied().collect()
    }

    fn slot(&self, peer: PeerId) -> Arc<AsyncMutex<PeerSlot>> {
        Arc::clone(self.slots.lock().entry(peer).or_default())
    }

    /// Like `slot`, but never creates one. Late timers and link events for
    /// a peer that was torn down find nothing.
    fn existing_slot(&self, peer: PeerId) -> Option<Arc<AsyncMutex<PeerSlot>>> {
        self.slots.lock().get(&peer).cloned()
    }

    /// Drop an idle peer's slot and phase. A slot someone else still holds
    /// is kept.
    fn prune(&self, peer: PeerId) {
        let mut slots = self.slots.lock();
        if slots.get(&peer).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            slots.remove(&peer);
            self.phases.write().remove(&peer);
        }
    }

    fn set_phase(&self, peer: PeerId, state: &LinkState) {
        let direct = match state {
            LinkState::Direct { link, .. } => Some(Arc::clone(link)),
            _ => None,
        };
        self.phases.write().insert(
            peer,
            Phase {
                state: state.public(),
                direct,
            },
        );
    }

    fn publish_all(&self, notices: Vec<LinkNotice>) {
        for notice in notices {
            self.notices.publish(notice);
        }
    }

    fn link_events(&self, peer: PeerId) -> (u64, LinkEvents) {
        let link_id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        (link_id, LinkEvents::new(peer, link_id, self.inputs_tx.clone()))
    }

    /// Start a direct-channel negotiation unless one is running or open.
    pub async fn negotiate(self: &Arc<Self>, peer: PeerId) -> Result<NegotiateOutcome, NegotiationError> {
        let slot = self.slot(peer);
        let mut guard = slot.lock().await;
        match &guard.state {
            LinkState::Negotiating { .. } => return Ok(NegotiateOutcome::InFlight),
            LinkState::Direct { .. } => return Ok(NegotiateOutcome::AlreadyDirect),
            LinkState::Failed { .. } => return Err(NegotiationError::Failed(peer)),
            LinkState::Idle => {}
        }

        self.start_offer(peer, &mut guard).await?;
        Ok(NegotiateOutcome::Started)
    }

    /// Leave Failed and negotiate again.
    pub async fn retry(self: &Arc<Self>, peer: PeerId) -> Result<NegotiateOutcome, NegotiationError> {
        {
            let slot = self.slot(peer);
            let mut guard = slot.lock().await;
            if let LinkState::Failed { reason } = &guard.state {
                info!("Retrying direct channel to {} (last failure: {})", peer, reason);
                guard.state = LinkState::Idle;
                guard.retries_used = 0;
                self.set_phase(peer, &guard.state);
            }
        }
        self.negotiate(peer).await
    }

    /// Close whatever link exists to `peer` and go back to Idle.
    pub async fn teardown(&self, peer: PeerId) {
        let slot = self.slot(peer);
        let mut guard = slot.lock().await;
        let was_direct = matches!(guard.state, LinkState::Direct { .. });
        if let Some(link) = guard.state.link() {
            link.close();
        }
        guard.state = LinkState::Idle;
        guard.pending_candidates.clear();
        guard.retries_used = 0;
        self.set_phase(peer, &guard.state);
        drop(guard);
        drop(slot);
        self.prune(peer);

        debug!("Tore down transport to {}", peer);
        if was_direct {
            self.notices.publish(LinkNotice::ChannelLost { peer });
        }
    }

    async fn start_offer(self: &Arc<Self>, peer: PeerId, slot: &mut PeerSlot) -> Result<(), NegotiationError> {
        let (link_id, events) = self.link_events(peer);
        let link = self.engine.create_link(peer, events)?;

        let offer = match link.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                link.close();
                return Err(e.into());
            }
        };
        if let Err(e) = self
            .signaling
            .send_signal(&SignalEnvelope::new(peer, SignalKind::Offer, offer))
        {
            link.close();
            return Err(e.into());
        }

        let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        slot.pending_candidates.clear();
        slot.state = LinkState::Negotiating {
            attempt,
            role: Role::Offerer,
            link_id,
            link,
            ready: false,
        };
        self.set_phase(peer, &slot.state);
        self.arm_timeout(peer, attempt);
        debug!("Sent offer to {} (attempt {})", peer, attempt);
        Ok(())
    }

    async fn start_answer(
        self: &Arc<Self>,
        peer: PeerId,
        slot: &mut PeerSlot,
        offer: &str,
    ) -> Result<(), NegotiationError> {
        let (link_id, events) = self.link_events(peer);
        let link = self.engine.create_link(peer, events)?;

        let answer = match link.accept_offer(offer).await {
            Ok(answer) => answer,
            Err(e) => {
                link.close();
                return Err(e.into());
            }
        };
        if let Err(e) = self
            .signaling
            .send_signal(&SignalEnvelope::new(peer, SignalKind::Answer, answer))
        {
            link.close();
            return Err(e.into());
        }

        let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        let pending = std::mem::take(&mut slot.pending_candidates);
        slot.state = LinkState::Negotiating {
            attempt,
            role: Role::Answerer,
            link_id,
            link: Arc::clone(&link),
            ready: true,
        };
        self.set_phase(peer, &slot.state);
        self.arm_timeout(peer, attempt);
        debug!("Answered offer from {} (attempt {})", peer, attempt);

        apply_candidates(&link, pending).await;
        Ok(())
    }

    fn arm_timeout(self: &Arc<Self>, peer: PeerId, attempt: u64) {
        let weak = Arc::downgrade(self);
        let timeout = self.config.timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(this) = weak.upgrade() {
                this.on_timeout(peer, attempt).await;
            }
        });
    }

    async fn on_timeout(self: &Arc<Self>, peer: PeerId, attempt: u64) {
        let Some(slot) = self.existing_slot(peer) else {
            return;
        };
        let mut guard = slot.lock().await;
        let current = matches!(
            guard.state,
            LinkState::Negotiating { attempt: running, .. } if running == attempt
        );
        if !current {
            return;
        }

        warn!("Direct channel negotiation with {} timed out", peer);
        let notices = self.fail(peer, &mut guard, NegotiationError::Timeout).await;
        drop(guard);
        self.publish_all(notices);
    }

    /// Abandon the current link. The offering side retries while the retry
    /// budget lasts; an answerer waits in Failed for the next offer. A lost
    /// direct channel is re-offered from both sides and glare picks one.
    async fn fail(
        self: &Arc<Self>,
        peer: PeerId,
        slot: &mut PeerSlot,
        mut reason: NegotiationError,
    ) -> Vec<LinkNotice> {
        let mut notices = Vec::new();
        let answering = matches!(
            slot.state,
            LinkState::Negotiating {
                role: Role::Answerer,
                ..
            }
        );
        if matches!(slot.state, LinkState::Direct { .. }) {
            notices.push(LinkNotice::ChannelLost { peer });
        }
        if let Some(link) = slot.state.link() {
            link.close();
        }
        slot.state = LinkState::Idle;
        slot.pending_candidates.clear();

        if !answering && slot.retries_used < self.config.auto_retries {
            slot.retries_used += 1;
            notices.push(LinkNotice::NegotiationFailed {
                peer,
                reason: reason.clone(),
                will_retry: true,
            });
            info!("Retrying direct channel to {} after: {}", peer, reason);
            match self.start_offer(peer, slot).await {
                Ok(()) => return notices,
                Err(e) => {
                    warn!("Automatic retry to {} could not start: {}", peer, e);
                    reason = e;
                }
            }
        }

        notices.extend(self.park_failed(peer, slot, reason));
        notices
    }

    fn park_failed(&self, peer: PeerId, slot: &mut PeerSlot, reason: NegotiationError) -> Vec<LinkNotice> {
        warn!("Direct channel to {} failed: {}", peer, reason);
        slot.pending_candidates.clear();
        slot.state = LinkState::Failed {
            reason: reason.clone(),
        };
        self.set_phase(peer, &slot.state);
        vec![LinkNotice::NegotiationFailed {
            peer,
            reason,
            will_retry: false,
        }]
    }

    pub(crate) async fn handle_signal(self: &Arc<Self>, envelope: SignalEnvelope) {
        let peer = envelope.peer;
        let slot = self.slot(peer);
        let mut guard = slot.lock().await;

        let notices = match envelope.kind {
            SignalKind::Offer => self.on_remote_offer(peer, &mut guard, &envelope.body).await,
            SignalKind::Answer => self.on_remote_answer(peer, &mut guard, &envelope.body).await,
            SignalKind::IceCandidate => {
                on_remote_candidate(peer, &mut guard, envelope.body).await;
                Vec::new()
            }
        };

        drop(guard);
        self.publish_all(notices);
    }

    async fn on_remote_offer(self: &Arc<Self>, peer: PeerId, slot: &mut PeerSlot, offer: &str) -> Vec<LinkNotice> {
        let mut notices = Vec::new();

        match &slot.state {
            LinkState::Negotiating {
                role: Role::Offerer, ..
            } if self.local < peer => {
                debug!("Glare with {}: keeping our offer", peer);
                return notices;
            }
            LinkState::Negotiating { role, link, .. } => {
                if *role == Role::Offerer {
                    debug!("Glare with {}: yielding to their offer", peer);
                } else {
                    debug!("New offer from {} replaces the pending one", peer);
                }
                link.close();
            }
            LinkState::Direct { link, .. } => {
                info!("{} renegotiated; replacing the direct channel", peer);
                link.close();
                notices.push(LinkNotice::ChannelLost { peer });
            }
            LinkState::Idle | LinkState::Failed { .. } => {}
        }
        slot.state = LinkState::Idle;

        if let Err(e) = self.start_answer(peer, slot, offer).await {
            warn!("Could not answer offer from {}: {}", peer, e);
            notices.extend(self.park_failed(peer, slot, e));
        }
        notices
    }

    async fn on_remote_answer(self: &Arc<Self>, peer: PeerId, slot: &mut PeerSlot, answer: &str) -> Vec<LinkNotice> {
        let link = match &slot.state {
            LinkState::Negotiating {
                role: Role::Offerer,
                ready: false,
                link,
                ..
            } => Arc::clone(link),
            _ => {
                debug!("Ignoring stale answer from {}", peer);
                return Vec::new();
            }
        };

        if let Err(e) = link.accept_answer(answer).await {
            warn!("Answer from {} rejected: {}", peer, e);
            return self.fail(peer, slot, e.into()).await;
        }

        if let LinkState::Negotiating { ready, .. } = &mut slot.state {
            *ready = true;
        }
        let pending = std::mem::take(&mut slot.pending_candidates);
        apply_candidates(&link, pending).await;
        Vec::new()
    }

    async fn handle_link_event(self: &Arc<Self>, peer: PeerId, link_id: u64, event: LinkEvent) {
        let Some(slot) = self.existing_slot(peer) else {
            debug!("Ignoring event from link {} to forgotten peer {}", link_id, peer);
            return;
        };
        let mut guard = slot.lock().await;
        if guard.state.link_id() != Some(link_id) {
            debug!("Ignoring event from stale link {} to {}", link_id, peer);
            return;
        }

        let notices = match event {
            LinkEvent::LocalCandidate(candidate) => {
                if let Err(e) = self
                    .signaling
                    .send_signal(&SignalEnvelope::new(peer, SignalKind::IceCandidate, candidate))
                {
                    debug!("Could not forward candidate to {}: {}", peer, e);
                }
                Vec::new()
            }
            LinkEvent::ChannelOpen => {
                match std::mem::replace(&mut guard.state, LinkState::Idle) {
                    LinkState::Negotiating { link_id, link, .. } => {
                        guard.state = LinkState::Direct { link_id, link };
                        guard.retries_used = 0;
                        self.set_phase(peer, &guard.state);
                        info!("⚡ Direct channel open with {}", peer);
                        vec![LinkNotice::ChannelOpen { peer }]
                    }
                    other => {
                        guard.state = other;
                        Vec::new()
                    }
                }
            }
            LinkEvent::ChannelClosed => {
                let reason = if matches!(guard.state, LinkState::Direct { .. }) {
                    NegotiationError::ChannelLost
                } else {
                    NegotiationError::Engine(EngineError::Failed(
                        "channel closed during negotiation".to_string(),
                    ))
                };
                self.fail(peer, &mut guard, reason).await
            }
            LinkEvent::Data(bytes) => vec![LinkNotice::Data { peer, bytes }],
        };

        drop(guard);
        self.publish_all(notices);
    }
}

async fn on_remote_candidate(peer: PeerId, slot: &mut PeerSlot, candidate: String) {
    match &slot.state {
        LinkState::Negotiating {
            ready: true, link, ..
        }
        | LinkState::Direct { link, .. } => {
            let link = Arc::clone(link);
            if let Err(e) = link.add_remote_candidate(&candidate).await {
                debug!("Candidate from {} rejected: {}", peer, e);
            }
        }
        _ => {
            if slot.pending_candidates.len() >= MAX_PENDING_CANDIDATES {
                debug!("Dropping candidate from {}: buffer full", peer);
                return;
            }
            slot.pending_candidates.push(candidate);
        }
    }
}

/// Apply buffered candidates in arrival order.
async fn apply_candidates(link: &Arc<dyn DirectLink>, candidates: Vec<String>) {
    for candidate in candidates {
        if let Err(e) = link.add_remote_candidate(&candidate).await {
            debug!("Buffered candidate rejected: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignalingConfig;
    use crate::signaling::MemoryRelay;
    use crate::transport::loopback::LoopbackNetwork;
    use std::time::Duration;

    struct Node {
        transport: Arc<PeerTransport>,
        signaling: Arc<SignalingChannel>,
        notices: Arc<Mutex<Vec<LinkNotice>>>,
    }

    impl Node {
        fn count(&self, kind: LinkNoticeKind) -> usize {
            self.notices.lock().iter().filter(|n| n.kind() == kind).count()
        }
    }

    async fn node(relay: &Arc<MemoryRelay>, network: &Arc<LoopbackNetwork>, id: u64) -> Node {
        let signaling = SignalingChannel::new(
            SignalingConfig::default(),
            Arc::new(relay.connector(PeerId(id))),
        );
        signaling.connect("token").await.unwrap();
        let transport = PeerTransport::new(
            PeerId(id),
            NegotiationConfig::default(),
            Arc::clone(&signaling),
            Arc::new(network.engine(PeerId(id))),
        );
        transport.start();

        let notices = Arc::new(Mutex::new(Vec::new()));
        for kind in [
            LinkNoticeKind::ChannelOpen,
            LinkNoticeKind::ChannelLost,
            LinkNoticeKind::NegotiationFailed,
            LinkNoticeKind::Data,
        ] {
            let sink = Arc::clone(&notices);
            transport
                .notices()
                .subscribe(kind, move |n| sink.lock().push(n.clone()));
        }

        Node {
            transport,
            signaling,
            notices,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiation_reaches_direct_on_both_sides() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let alice = node(&relay, &network, 1).await;
        let bob = node(&relay, &network, 2).await;

        assert_eq!(
            alice.transport.negotiate(PeerId(2)).await.unwrap(),
            NegotiateOutcome::Started
        );
        assert_eq!(alice.transport.state(PeerId(2)), TransportState::Negotiating);
        settle().await;

        assert_eq!(alice.transport.state(PeerId(2)), TransportState::Direct);
        assert_eq!(bob.transport.state(PeerId(1)), TransportState::Direct);
        assert_eq!(alice.count(LinkNoticeKind::ChannelOpen), 1);
        assert_eq!(bob.count(LinkNoticeKind::ChannelOpen), 1);
        assert!(alice.transport.direct_link(PeerId(2)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiate_coalesces() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let alice = node(&relay, &network, 1).await;
        let _bob = node(&relay, &network, 2).await;

        alice.transport.negotiate(PeerId(2)).await.unwrap();
        assert_eq!(
            alice.transport.negotiate(PeerId(2)).await.unwrap(),
            NegotiateOutcome::InFlight
        );
        settle().await;
        assert_eq!(
            alice.transport.negotiate(PeerId(2)).await.unwrap(),
            NegotiateOutcome::AlreadyDirect
        );

        let offers = relay
            .frames_from(PeerId(1))
            .into_iter()
            .filter(|f| f.kind == kinds::SIGNAL && f.payload["type"] == "offer")
            .count();
        assert_eq!(offers, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_retries_once_then_fails() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let alice = node(&relay, &network, 1).await;

        // Nobody answers: peer 2 is not on the relay yet
        alice.transport.negotiate(PeerId(2)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(alice.transport.state(PeerId(2)), TransportState::Negotiating);

        tokio::time::sleep(Duration::from_millis(10_000)).await;
        assert_eq!(alice.transport.state(PeerId(2)), TransportState::Failed);

        let failures: Vec<bool> = alice
            .notices
            .lock()
            .iter()
            .filter_map(|n| match n {
                LinkNotice::NegotiationFailed { will_retry, .. } => Some(*will_retry),
                _ => None,
            })
            .collect();
        assert_eq!(failures, vec![true, false]);

        // Failed sticks until an explicit retry
        assert_eq!(
            alice.transport.negotiate(PeerId(2)).await,
            Err(NegotiationError::Failed(PeerId(2)))
        );

        let _bob = node(&relay, &network, 2).await;
        assert_eq!(
            alice.transport.retry(PeerId(2)).await.unwrap(),
            NegotiateOutcome::Started
        );
        settle().await;
        assert_eq!(alice.transport.state(PeerId(2)), TransportState::Direct);
    }

    #[tokio::test(start_paused = true)]
    async fn test_candidates_buffered_until_offer() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let _alice = node(&relay, &network, 1).await;
        let bob = node(&relay, &network, 2).await;

        // Candidates arrive before the offer
        for n in 0..3 {
            bob.transport
                .handle_signal(SignalEnvelope::new(
                    PeerId(1),
                    SignalKind::IceCandidate,
                    format!("loopback-candidate:1#{}", n),
                ))
                .await;
        }
        assert!(network.applied_candidates(PeerId(2), PeerId(1)).is_empty());

        bob.transport
            .handle_signal(SignalEnvelope::new(PeerId(1), SignalKind::Offer, "loopback-offer:1"))
            .await;

        assert_eq!(
            network.applied_candidates(PeerId(2), PeerId(1)),
            vec![
                "loopback-candidate:1#0",
                "loopback-candidate:1#1",
                "loopback-candidate:1#2"
            ]
        );
        assert_eq!(bob.transport.state(PeerId(1)), TransportState::Negotiating);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_answer_ignored() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let bob = node(&relay, &network, 2).await;

        bob.transport
            .handle_signal(SignalEnvelope::new(PeerId(1), SignalKind::Answer, "loopback-answer:1"))
            .await;
        assert_eq!(bob.transport.state(PeerId(1)), TransportState::Idle);
        assert!(bob.notices.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_loss_recovers_automatically() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let alice = node(&relay, &network, 1).await;
        let bob = node(&relay, &network, 2).await;

        alice.transport.negotiate(PeerId(2)).await.unwrap();
        settle().await;
        assert!(alice.transport.is_direct(PeerId(2)));

        network.sever(PeerId(1), PeerId(2));
        settle().await;

        assert_eq!(alice.count(LinkNoticeKind::ChannelLost), 1);
        assert_eq!(bob.count(LinkNoticeKind::ChannelLost), 1);
        assert!(alice.transport.is_direct(PeerId(2)));
        assert!(bob.transport.is_direct(PeerId(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_arrives_as_notice() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let alice = node(&relay, &network, 1).await;
        let bob = node(&relay, &network, 2).await;

        alice.transport.negotiate(PeerId(2)).await.unwrap();
        settle().await;

        let link = alice.transport.direct_link(PeerId(2)).unwrap();
        link.send(b"hello").await.unwrap();
        settle().await;

        let data: Vec<Vec<u8>> = bob
            .notices
            .lock()
            .iter()
            .filter_map(|n| match n {
                LinkNotice::Data { bytes, .. } => Some(bytes.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(data, vec![b"hello".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_returns_to_idle() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let alice = node(&relay, &network, 1).await;
        let _bob = node(&relay, &network, 2).await;

        alice.transport.negotiate(PeerId(2)).await.unwrap();
        settle().await;
        alice.transport.teardown(PeerId(2)).await;

        assert_eq!(alice.transport.state(PeerId(2)), TransportState::Idle);
        assert!(alice.transport.direct_link(PeerId(2)).is_none());
        assert_eq!(alice.count(LinkNoticeKind::ChannelLost), 1);

        // Nothing is kept for the peer once the channel is gone
        assert!(!alice.transport.slots.lock().contains_key(&PeerId(2)));
        assert!(!alice.transport.phases.read().contains_key(&PeerId(2)));
        assert!(alice.transport.known_peers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_answerer_waits_in_failed_without_offering() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let bob = node(&relay, &network, 2).await;

        // Peer 1 offers and then never completes
        bob.transport
            .handle_signal(SignalEnvelope::new(PeerId(1), SignalKind::Offer, "loopback-offer:1"))
            .await;
        assert_eq!(bob.transport.state(PeerId(1)), TransportState::Negotiating);

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(bob.transport.state(PeerId(1)), TransportState::Failed);

        let failures: Vec<bool> = bob
            .notices
            .lock()
            .iter()
            .filter_map(|n| match n {
                LinkNotice::NegotiationFailed { will_retry, .. } => Some(*will_retry),
                _ => None,
            })
            .collect();
        assert_eq!(failures, vec![false]);

        let offers = relay
            .frames_from(PeerId(2))
            .into_iter()
            .filter(|f| f.kind == kinds::SIGNAL && f.payload["type"] == "offer")
            .count();
        assert_eq!(offers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiate_without_relay_fails_fast() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let alice = node(&relay, &network, 1).await;
        alice.signaling.disconnect();

        assert!(matches!(
            alice.transport.negotiate(PeerId(2)).await,
            Err(NegotiationError::Signaling(SignalingError::Disconnected))
        ));
        assert_eq!(alice.transport.state(PeerId(2)), TransportState::Idle);
    }
}
