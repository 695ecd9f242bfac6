// Message module: types, peer packets and the conversation ledger

pub mod codec;
pub mod ledger;
pub mod types;

pub use codec::{decode_packet, encode_packet, PacketError, PeerPacket, MAX_PACKET_SIZE};
pub use ledger::{AppendOutcome, Conversation, MessageLedger, StatusChange};
pub use types::{now_millis, Message, MessageKey, MessageStatus};
