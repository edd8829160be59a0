use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::mixer::constants::net::MAX_MESSAGE_SIZE;
use crate::mixer::sequence::SequenceNumber;
use crate::mixer::session::NodeId;

/// Version byte every client packet must lead with
pub const PROTOCOL_VERSION: u8 = 1;

/// Kinds of packets a client sends to the mixer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    /// Per-frame pose update
    AvatarData,
    /// Display metadata update
    AvatarIdentity,
    /// The client is leaving
    KillAvatar,
    /// Start or stop exchanging data with other nodes
    NodeIgnoreRequest,
}

/// Envelope of every client packet.
///
/// `version` is encoded first, so the leading byte of any packet is its
/// protocol version regardless of how the rest of the layout evolves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundPacket {
    pub version: u8,
    pub packet_type: PacketType,
    pub payload: Vec<u8>,
}

impl InboundPacket {
    /// Wrap an encoded payload in a current-version envelope
    pub fn new<T: Serialize>(packet_type: PacketType, payload: &T) -> Result<Self, EncodeError> {
        Ok(Self {
            version: PROTOCOL_VERSION,
            packet_type,
            payload: encode(payload)?,
        })
    }

    /// Read the protocol version without decoding the envelope
    pub fn peek_version(data: &[u8]) -> Option<u8> {
        data.first().copied()
    }
}

/// World-space position a client reports alongside its pose
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Position {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn distance_sq(&self, other: &Position) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Pose update for one frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvatarDataPacket {
    pub sequence: SequenceNumber,
    /// Optional relevance signal used to prioritize nearby avatars
    #[serde(default)]
    pub position: Option<Position>,
    /// Opaque pose/skeleton state, relayed verbatim
    pub data: Bytes,
}

/// Descriptive avatar metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityInfo {
    pub display_name: String,
    pub skeleton_model_url: String,
}

/// Why a node disappeared from a client's view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KillReason {
    NoReason,
    AvatarDisconnected,
    AvatarIgnored,
}

/// A client announcing its own departure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillAvatarPacket {
    pub node_id: NodeId,
    pub reason: KillReason,
}

/// Ignore (or un-ignore) a set of nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIgnoreRequestPacket {
    pub targets: Vec<NodeId>,
    /// `false` lifts a previous ignore
    pub enabled: bool,
    /// Also suppress the requester's data towards each target
    pub bidirectional: bool,
}

/// One other avatar as seen by a listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarRecord {
    pub node_id: NodeId,
    pub sequence: SequenceNumber,
    pub data: Bytes,
    /// Present only when the identity changed since the listener last received it
    pub identity: Option<IdentityInfo>,
}

/// Packets the mixer sends to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MixerPacket {
    /// First packet on a new connection
    Welcome {
        node_id: NodeId,
        protocol_version: u8,
    },
    /// Per-tick view of other avatars
    BulkAvatarData { records: Vec<AvatarRecord> },
    /// Remove a node's avatar from the view
    KillAvatar { node_id: NodeId, reason: KillReason },
    /// The client speaks a protocol version this mixer does not
    VersionMismatch { expected_version: u8 },
}

/// Encode a message using bincode
/// Uses legacy config for fixed-size integers (stable sizes for budget accounting)
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, EncodeError> {
    bincode::serde::encode_to_vec(message, bincode::config::legacy())
        .map_err(|e| EncodeError(e.to_string()))
}

/// Decode a message using bincode
/// Length prefixes are capped at the largest message a client may send
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, DecodeError> {
    let config = bincode::config::legacy().with_limit::<MAX_MESSAGE_SIZE>();
    bincode::serde::decode_from_slice(data, config)
        .map(|(msg, _)| msg)
        .map_err(|e| DecodeError(e.to_string()))
}

/// Exact number of bytes `encode` would produce, without allocating
pub fn encoded_size<T: Serialize>(message: &T) -> Result<usize, EncodeError> {
    bincode::serde::encode_into_std_write(message, &mut std::io::sink(), bincode::config::legacy())
        .map_err(|e| EncodeError(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
#[error("Encode error: {0}")]
pub struct EncodeError(String);

#[derive(Debug, thiserror::Error)]
#[error("Decode error: {0}")]
pub struct DecodeError(String);

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn record(seq: SequenceNumber, len: usize, identity: Option<IdentityInfo>) -> AvatarRecord {
        AvatarRecord {
            node_id: Uuid::new_v4(),
            sequence: seq,
            data: Bytes::from(vec![7u8; len]),
            identity,
        }
    }

    #[test]
    fn test_version_is_leading_byte() {
        let packet = InboundPacket::new(
            PacketType::AvatarData,
            &AvatarDataPacket {
                sequence: 1,
                position: None,
                data: Bytes::from_static(b"pose"),
            },
        )
        .unwrap();
        let encoded = encode(&packet).unwrap();
        assert_eq!(InboundPacket::peek_version(&encoded), Some(PROTOCOL_VERSION));
        assert_eq!(InboundPacket::peek_version(&[]), None);
    }

    #[test]
    fn test_encoded_size_matches_encode() {
        let rec = record(9, 33, Some(IdentityInfo {
            display_name: "Ada".to_string(),
            skeleton_model_url: "https://models.example/ada.fst".to_string(),
        }));
        assert_eq!(encoded_size(&rec).unwrap(), encode(&rec).unwrap().len());
    }

    #[test]
    fn test_bulk_payload_is_overhead_plus_records() {
        let overhead = encoded_size(&MixerPacket::BulkAvatarData { records: Vec::new() }).unwrap();
        let records = vec![record(1, 10, None), record(2, 200, None), record(3, 0, Some(IdentityInfo::default()))];
        let sum: usize = records.iter().map(|r| encoded_size(r).unwrap()).sum();

        let encoded = encode(&MixerPacket::BulkAvatarData { records: records.clone() }).unwrap();
        assert_eq!(encoded.len(), overhead + sum);

        let decoded: MixerPacket = decode(&encoded).unwrap();
        assert_eq!(decoded, MixerPacket::BulkAvatarData { records });
    }

    #[test]
    fn test_position_distance() {
        let a = Position::new(0.0, 0.0, 0.0);
        let b = Position::new(3.0, 4.0, 0.0);
        assert_eq!(a.distance_sq(&b), 25.0);
        assert!(!Position::new(f32::NAN, 0.0, 0.0).is_finite());
    }

    #[test]
    fn test_invalid_decode() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        let result: Result<InboundPacket, _> = decode(&garbage);
        assert!(result.is_err());
    }

    #[test]
    fn test_length_prefix_beyond_limit_rejected() {
        // version, AvatarData tag, then a payload length of 4 TiB
        let mut envelope = vec![PROTOCOL_VERSION, 0, 0, 0, 0];
        envelope.extend_from_slice(&(1u64 << 42).to_le_bytes());
        envelope.extend_from_slice(&[0u8; 8]);
        assert!(decode::<InboundPacket>(&envelope).is_err());

        // sequence 1, no position, then a pose length of 4 TiB
        let mut payload = vec![1, 0, 0];
        payload.extend_from_slice(&(1u64 << 42).to_le_bytes());
        payload.extend_from_slice(&[0u8; 8]);
        assert!(decode::<AvatarDataPacket>(&payload).is_err());
    }
}
