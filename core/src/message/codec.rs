// Peer packet codec: what two peers exchange over either route

use super::types::MessageStatus;
use crate::identity::PeerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum encoded packet size: 256 KB
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Maximum encrypted content size: 64 KB
pub const MAX_CONTENT_SIZE: usize = 64 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Packet too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
    #[error("Malformed packet: {0}")]
    Malformed(String),
}

/// Peer-to-peer payload, carried verbatim on the direct channel and inside
/// the relay's `message` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum PeerPacket {
    Message {
        content: String,
        timestamp: u64,
        encrypted: bool,
    },
    /// Status update for a message named by its sender and timestamp.
    Receipt {
        sender: PeerId,
        timestamp: u64,
        status: MessageStatus,
    },
}

pub fn encode_packet(packet: &PeerPacket) -> Result<Vec<u8>, PacketError> {
    if let PeerPacket::Message { content, .. } = packet {
        if content.len() > MAX_CONTENT_SIZE {
            return Err(PacketError::TooLarge {
                size: content.len(),
                max: MAX_CONTENT_SIZE,
            });
        }
    }

    let bytes = serde_json::to_vec(packet).map_err(|e| PacketError::Malformed(e.to_string()))?;
    if bytes.len() > MAX_PACKET_SIZE {
        return Err(PacketError::TooLarge {
            size: bytes.len(),
            max: MAX_PACKET_SIZE,
        });
    }
    Ok(bytes)
}

pub fn decode_packet(bytes: &[u8]) -> Result<PeerPacket, PacketError> {
    if bytes.len() > MAX_PACKET_SIZE {
        return Err(PacketError::TooLarge {
            size: bytes.len(),
            max: MAX_PACKET_SIZE,
        });
    }
    serde_json::from_slice(bytes).map_err(|e| PacketError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_packet_shape() {
        let packet = PeerPacket::Message {
            content: "frame".to_string(),
            timestamp: 10,
            encrypted: true,
        };
        let value: serde_json::Value = serde_json::from_slice(&encode_packet(&packet).unwrap()).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["data"]["content"], "frame");
        assert_eq!(value["data"]["timestamp"], 10);
    }

    #[test]
    fn test_receipt_roundtrip() {
        let packet = PeerPacket::Receipt {
            sender: PeerId(3),
            timestamp: 55,
            status: MessageStatus::Read,
        };
        let bytes = encode_packet(&packet).unwrap();
        assert_eq!(decode_packet(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_content_size_limit() {
        let packet = PeerPacket::Message {
            content: "x".repeat(MAX_CONTENT_SIZE + 1),
            timestamp: 1,
            encrypted: true,
        };
        assert!(matches!(encode_packet(&packet), Err(PacketError::TooLarge { .. })));
    }

    #[test]
    fn test_oversized_input_rejected() {
        let bytes = vec![b' '; MAX_PACKET_SIZE + 1];
        assert!(matches!(decode_packet(&bytes), Err(PacketError::TooLarge { .. })));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(decode_packet(b"not json"), Err(PacketError::Malformed(_))));
        assert!(matches!(
            decode_packet(br#"{"type":"unknown","data":{}}"#),
            Err(PacketError::Malformed(_))
        ));
    }
}
