// Transport module: direct channels per peer and path selection

pub mod engine;
pub mod loopback;
pub mod peer;
pub mod router;

pub use engine::{DirectEngine, DirectLink, EngineError, LinkEvent, LinkEvents, NoDirectEngine};
pub use loopback::{LoopbackEngine, LoopbackNetwork};
pub use peer::{LinkNotice, LinkNoticeKind, NegotiateOutcome, NegotiationError, PeerTransport, Role};
pub use router::{Route, RouteError, TransportRouter};

use serde::{Deserialize, Serialize};

/// How a peer is currently reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Idle,
    Negotiating,
    Direct,
    Relayed,
    Failed,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TransportState::Idle => "idle",
            TransportState::Negotiating => "negotiating",
            TransportState::Direct => "direct",
            TransportState::Relayed => "relayed",
            TransportState::Failed => "failed",
        };
        f.write_str(label)
    }
}
