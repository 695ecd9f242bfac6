//! In-process direct-channel engine
//!
//! Links created by engines on the same [`LoopbackNetwork`] find each other
//! by (owner, remote) pair. The channel opens on both ends when the offerer
//! applies the answer. Faults can be injected per pair: blocked pairs never
//! open, stalled pairs accept sends that never complete, severed pairs lose
//! an open channel.

use super::engine::{DirectEngine, DirectLink, EngineError, LinkEvent, LinkEvents};
use crate::identity::PeerId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::debug;

const OFFER_PREFIX: &str = "loopback-offer:";
const ANSWER_PREFIX: &str = "loopback-answer:";
const CANDIDATE_PREFIX: &str = "loopback-candidate:";

fn pair(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

pub struct LoopbackNetwork {
    links: Mutex<HashMap<(PeerId, PeerId), Arc<LoopbackLink>>>,
    blocked: Mutex<HashSet<(PeerId, PeerId)>>,
    stalled: Mutex<HashSet<(PeerId, PeerId)>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            links: Mutex::new(HashMap::new()),
            blocked: Mutex::new(HashSet::new()),
            stalled: Mutex::new(HashSet::new()),
        })
    }

    pub fn engine(self: &Arc<Self>, local: PeerId) -> LoopbackEngine {
        LoopbackEngine {
            network: Arc::clone(self),
            local,
        }
    }

    /// Prevent channels between `a` and `b` from opening.
    pub fn set_blocked(&self, a: PeerId, b: PeerId, blocked: bool) {
        let mut set = self.blocked.lock();
        if blocked {
            set.insert(pair(a, b));
        } else {
            set.remove(&pair(a, b));
        }
    }

    /// Make sends between `a` and `b` hang.
    pub fn set_stalled(&self, a: PeerId, b: PeerId, stalled: bool) {
        let mut set = self.stalled.lock();
        if stalled {
            set.insert(pair(a, b));
        } else {
            set.remove(&pair(a, b));
        }
    }

    /// Drop an open channel as if the network path died.
    pub fn sever(&self, a: PeerId, b: PeerId) {
        for key in [(a, b), (b, a)] {
            let link = self.links.lock().get(&key).cloned();
            if let Some(link) = link {
                if link.mark_closed() {
                    link.events.emit(LinkEvent::ChannelClosed);
                }
            }
        }
    }

    pub fn is_open(&self, a: PeerId, b: PeerId) -> bool {
        let link = self.links.lock().get(&(a, b)).cloned();
        link.map(|l| l.state.lock().open).unwrap_or(false)
    }

    /// Remote candidates applied to `owner`'s link toward `remote`, in order.
    pub fn applied_candidates(&self, owner: PeerId, remote: PeerId) -> Vec<String> {
        let link = self.links.lock().get(&(owner, remote)).cloned();
        link.map(|l| l.state.lock().remote_candidates.clone())
            .unwrap_or_default()
    }

    fn counterpart(&self, link: &LoopbackLink) -> Option<Arc<LoopbackLink>> {
        self.links.lock().get(&(link.remote, link.owner)).cloned()
    }

    fn open_pair(&self, offerer: &LoopbackLink) {
        if self.blocked.lock().contains(&pair(offerer.owner, offerer.remote)) {
            debug!("Loopback pair {}-{} is blocked", offerer.owner, offerer.remote);
            return;
        }
        let Some(answerer) = self.counterpart(offerer) else {
            return;
        };

        if !answerer.try_open() {
            return;
        }
        if !offerer.try_open() {
            return;
        }
        answerer.events.emit(LinkEvent::ChannelOpen);
        offerer.events.emit(LinkEvent::ChannelOpen);
    }
}

pub struct LoopbackEngine {
    network: Arc<LoopbackNetwork>,
    local: PeerId,
}

impl DirectEngine for LoopbackEngine {
    fn create_link(&self, peer: PeerId, events: LinkEvents) -> Result<Arc<dyn DirectLink>, EngineError> {
        let link = Arc::new(LoopbackLink {
            owner: self.local,
            remote: peer,
            events,
            network: Arc::downgrade(&self.network),
            state: Mutex::new(LinkPhase::default()),
        });
        self.network
            .links
            .lock()
            .insert((self.local, peer), Arc::clone(&link));
        Ok(link)
    }
}

#[derive(Debug, Default)]
struct LinkPhase {
    open: bool,
    closed: bool,
    remote_candidates: Vec<String>,
}

pub struct LoopbackLink {
    owner: PeerId,
    remote: PeerId,
    events: LinkEvents,
    network: Weak<LoopbackNetwork>,
    state: Mutex<LinkPhase>,
}

impl LoopbackLink {
    fn network(&self) -> Result<Arc<LoopbackNetwork>, EngineError> {
        self.network
            .upgrade()
            .ok_or_else(|| EngineError::Failed("loopback network dropped".to_string()))
    }

    fn try_open(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.open {
            return false;
        }
        state.open = true;
        true
    }

    /// Returns true if the channel was open.
    fn mark_closed(&self) -> bool {
        let mut state = self.state.lock();
        let was_open = state.open;
        state.open = false;
        state.closed = true;
        was_open
    }

    fn expect_from_remote(&self, body: &str, prefix: &str) -> Result<(), EngineError> {
        let sender = body
            .strip_prefix(prefix)
            .and_then(|id| id.parse::<u64>().ok())
            .ok_or_else(|| EngineError::InvalidSignal(body.to_string()))?;
        if PeerId(sender) != self.remote {
            return Err(EngineError::InvalidSignal(format!(
                "expected a body from {}, got one from {}",
                self.remote, sender
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DirectLink for LoopbackLink {
    async fn create_offer(&self) -> Result<String, EngineError> {
        self.events
            .emit(LinkEvent::LocalCandidate(format!("{}{}", CANDIDATE_PREFIX, self.owner)));
        Ok(format!("{}{}", OFFER_PREFIX, self.owner))
    }

    async fn accept_offer(&self, offer: &str) -> Result<String, EngineError> {
        self.expect_from_remote(offer, OFFER_PREFIX)?;
        self.events
            .emit(LinkEvent::LocalCandidate(format!("{}{}", CANDIDATE_PREFIX, self.owner)));
        Ok(format!("{}{}", ANSWER_PREFIX, self.owner))
    }

    async fn accept_answer(&self, answer: &str) -> Result<(), EngineError> {
        self.expect_from_remote(answer, ANSWER_PREFIX)?;
        self.network()?.open_pair(self);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), EngineError> {
        if !candidate.starts_with(CANDIDATE_PREFIX) {
            return Err(EngineError::InvalidSignal(candidate.to_string()));
        }
        self.state.lock().remote_candidates.push(candidate.to_string());
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), EngineError> {
        if !self.state.lock().open {
            return Err(EngineError::NotOpen);
        }
        let network = self.network()?;
        if network.stalled.lock().contains(&pair(self.owner, self.remote)) {
            std::future::pending::<()>().await;
        }

        let counterpart = network.counterpart(self).ok_or(EngineError::NotOpen)?;
        if !counterpart.state.lock().open {
            return Err(EngineError::NotOpen);
        }
        counterpart.events.emit(LinkEvent::Data(data.to_vec()));
        Ok(())
    }

    fn close(&self) {
        let was_open = self.mark_closed();
        let Ok(network) = self.network() else {
            return;
        };

        {
            let mut links = network.links.lock();
            let is_registered = links
                .get(&(self.owner, self.remote))
                .map(|l| std::ptr::eq(Arc::as_ptr(l), self))
                .unwrap_or(false);
            if is_registered {
                links.remove(&(self.owner, self.remote));
            }
        }

        if was_open {
            if let Some(counterpart) = network.counterpart(self) {
                if counterpart.mark_closed() {
                    counterpart.events.emit(LinkEvent::ChannelClosed);
                }
            }
        }
    }
}
