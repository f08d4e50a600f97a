//! # Packet Envelope and Framing
//!
//! Everything a channel sends over the exchange is a [`Packet`]: addressing,
//! the ordering header (sequence number, new-sequence flag, piggybacked
//! acknowledgment) and a [`PacketBody`].
//!
//! On the wire a packet is a 4-byte big-endian length followed by the JSON
//! encoding of the envelope. The exchange treats the bytes as opaque.

use crate::error::{ChannelError, WireError};
use crate::ids::ChannelId;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Width of the sequence number space.
pub const SEQ_BITS: u32 = 16;

/// Mask applied after every sequence increment.
pub const SEQ_MASK: u32 = (1 << SEQ_BITS) - 1;

/// Half of the sequence space, used to tell "ahead" from "behind".
pub const SEQ_HALF: u32 = 1 << (SEQ_BITS - 1);

const FRAME_HEADER_LEN: usize = 4;

/// Next sequence number after `seq`, wrapping.
pub fn seq_next(seq: u32) -> u32 {
    seq.wrapping_add(1) & SEQ_MASK
}

/// Forward distance from `from` to `to` in the wrapped sequence space.
pub fn seq_distance(from: u32, to: u32) -> u32 {
    to.wrapping_sub(from) & SEQ_MASK
}

/// Whether `seq` lies strictly ahead of `reference` (within half the space).
pub fn seq_ahead(reference: u32, seq: u32) -> bool {
    let d = seq_distance(reference, seq);
    d != 0 && d < SEQ_HALF
}

/// Payload of a packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum PacketBody {
    /// Call that expects exactly one [`PacketBody::Response`]
    Request {
        id: u64,
        verb: String,
        #[serde(default)]
        payload: Value,
    },
    /// Result of an earlier request
    Response {
        id: u64,
        result: Result<Value, WireError>,
    },
    /// One-way message
    Push {
        verb: String,
        #[serde(default)]
        payload: Value,
        /// Excluded from per-packet debug logging
        #[serde(default, skip_serializing_if = "is_false")]
        quiet: bool,
    },
    /// Standalone acknowledgment, carries no sequence number
    Ack,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl PacketBody {
    /// Verb for logging; responses and acks have none.
    pub fn verb(&self) -> &str {
        match self {
            PacketBody::Request { verb, .. } | PacketBody::Push { verb, .. } => verb,
            PacketBody::Response { .. } => "<response>",
            PacketBody::Ack => "<ack>",
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, PacketBody::Request { .. })
    }

    pub fn is_quiet(&self) -> bool {
        matches!(self, PacketBody::Push { quiet: true, .. })
    }
}

/// One framed message between two channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub src: ChannelId,
    pub dst: ChannelId,
    /// Ordering sequence; `None` for packets outside the ordered stream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u32>,
    /// Sender cannot know the receiver's expected sequence; start a new run
    #[serde(default, skip_serializing_if = "is_false")]
    pub new_seq: bool,
    /// Highest in-order sequence the sender has accepted from `dst`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u32>,
    pub body: PacketBody,
}

impl Packet {
    /// Encodes the packet into a length-prefixed frame.
    pub fn encode(&self) -> Result<Vec<u8>, ChannelError> {
        let json = serde_json::to_vec(self)?;
        let len = u32::try_from(json.len())
            .map_err(|_| ChannelError::Serialization("packet too large".to_string()))?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + json.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&json);
        Ok(frame)
    }

    /// Decodes a frame produced by [`Packet::encode`].
    pub fn decode(frame: &[u8]) -> Result<Self, ChannelError> {
        if frame.len() < FRAME_HEADER_LEN {
            return Err(ChannelError::Serialization(format!(
                "frame too short: {} bytes",
                frame.len()
            )));
        }
        let (header, body) = frame.split_at(FRAME_HEADER_LEN);
        let declared = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if declared != body.len() {
            return Err(ChannelError::Serialization(format!(
                "frame length mismatch: declared {declared}, got {}",
                body.len()
            )));
        }
        Ok(serde_json::from_slice(body)?)
    }
}

/// Bounded base64 dump of raw packet bytes for postmortem logs.
pub fn dump_bytes(bytes: &[u8], max_bytes: usize) -> String {
    if bytes.len() <= max_bytes {
        BASE64.encode(bytes)
    } else {
        format!(
            "{}...(+{} bytes)",
            BASE64.encode(&bytes[..max_bytes]),
            bytes.len() - max_bytes
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn id(s: &str) -> ChannelId {
        s.parse().unwrap()
    }

    #[test]
    fn test_sequence_wraps() {
        assert_eq!(seq_next(SEQ_MASK), 0);
        assert_eq!(seq_distance(SEQ_MASK, 1), 2);
        assert!(seq_ahead(SEQ_MASK, 0));
        assert!(!seq_ahead(5, 5));
        assert!(!seq_ahead(5, 4));
    }

    #[test]
    fn test_frame_carries_header_and_error_result() {
        let packet = Packet {
            src: id("room.1"),
            dst: id("master.0"),
            seq: Some(9),
            new_seq: true,
            ack: None,
            body: PacketBody::Response {
                id: 3,
                result: Err(WireError {
                    kind: ErrorKind::NotFound,
                    message: "room.2".into(),
                }),
            },
        };
        let frame = packet.encode().unwrap();
        assert_eq!(&frame[..4], &((frame.len() - 4) as u32).to_be_bytes());
        assert_eq!(Packet::decode(&frame).unwrap(), packet);
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let packet = Packet {
            src: id("room.1"),
            dst: id("room.2"),
            seq: None,
            new_seq: false,
            ack: Some(1),
            body: PacketBody::Push {
                verb: "hello".into(),
                payload: json!({"x": 1}),
                quiet: false,
            },
        };
        let frame = packet.encode().unwrap();
        assert!(Packet::decode(&frame[..frame.len() - 1]).is_err());
        assert!(Packet::decode(&frame[..2]).is_err());
    }

    #[test]
    fn test_dump_is_bounded() {
        let bytes = vec![7u8; 100];
        let dump = dump_bytes(&bytes, 12);
        assert!(dump.ends_with("...(+88 bytes)"));
        assert_eq!(dump_bytes(&bytes[..3], 12), BASE64.encode([7u8, 7, 7]));
    }
}
