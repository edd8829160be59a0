//! Inbound packet handling
//!
//! Each packet kind maps to a plain function in a dispatch table. Handlers
//! apply the packet to the store and return side effects that the caller
//! hands to the connection layer.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::mixer::constants::limits;
use crate::mixer::session::{AvatarUpdate, NodeId};
use crate::mixer::store::NodeStore;
use crate::net::connection::PacketSender;
use crate::net::protocol::{
    self, AvatarDataPacket, DecodeError, IdentityInfo, InboundPacket, KillAvatarPacket, KillReason,
    MixerPacket, NodeIgnoreRequestPacket, PacketType, PROTOCOL_VERSION,
};

/// Dispatch key of the handler table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IngestKind {
    AvatarData,
    AvatarIdentity,
    KillAvatar,
    NodeIgnoreRequest,
    VersionMismatch,
}

impl From<PacketType> for IngestKind {
    fn from(packet_type: PacketType) -> Self {
        match packet_type {
            PacketType::AvatarData => IngestKind::AvatarData,
            PacketType::AvatarIdentity => IngestKind::AvatarIdentity,
            PacketType::KillAvatar => IngestKind::KillAvatar,
            PacketType::NodeIgnoreRequest => IngestKind::NodeIgnoreRequest,
        }
    }
}

/// Outbound work produced by ingestion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    /// Tell `recipients` that `killed` left their view
    KillNotification {
        killed: NodeId,
        reason: KillReason,
        recipients: Vec<NodeId>,
    },
    /// Tell `sender` its protocol version is not ours
    VersionMismatch { sender: NodeId },
}

pub type Effects = SmallVec<[SideEffect; 2]>;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Malformed packet: {0}")]
    Malformed(String),

    #[error("Avatar data of {len} bytes exceeds limit of {max}")]
    AvatarDataTooLarge { len: usize, max: usize },

    #[error("Invalid identity: {0}")]
    InvalidIdentity(&'static str),

    #[error("Kill for {target} sent by another node")]
    ForeignKill { target: NodeId },

    #[error("Sender is quarantined after a version mismatch")]
    Incompatible,

    #[error("{0} ignore targets exceeds limit")]
    TooManyIgnoreTargets(usize),
}

impl From<DecodeError> for IngestError {
    fn from(err: DecodeError) -> Self {
        IngestError::Malformed(err.to_string())
    }
}

pub type Handler = fn(&NodeStore, NodeId, &[u8]) -> Result<Effects, IngestError>;

/// Table of packet handlers keyed by kind
pub struct PacketDispatcher {
    handlers: FxHashMap<IngestKind, Handler>,
}

impl Default for PacketDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketDispatcher {
    pub fn new() -> Self {
        let mut handlers: FxHashMap<IngestKind, Handler> = FxHashMap::default();
        handlers.insert(IngestKind::AvatarData, handle_avatar_data);
        handlers.insert(IngestKind::AvatarIdentity, handle_avatar_identity);
        handlers.insert(IngestKind::KillAvatar, handle_kill_avatar);
        handlers.insert(IngestKind::NodeIgnoreRequest, handle_node_ignore_request);
        handlers.insert(IngestKind::VersionMismatch, handle_version_mismatch);
        Self { handlers }
    }

    /// Route raw bytes to the handler for their kind
    pub fn dispatch(
        &self,
        store: &NodeStore,
        sender: NodeId,
        bytes: &[u8],
    ) -> Result<Effects, IngestError> {
        let version = InboundPacket::peek_version(bytes)
            .ok_or_else(|| IngestError::Malformed("empty packet".to_string()))?;

        if version != PROTOCOL_VERSION {
            return self.call(IngestKind::VersionMismatch, store, sender, bytes);
        }

        if store.is_incompatible(&sender) {
            return Err(IngestError::Incompatible);
        }

        let packet: InboundPacket = protocol::decode(bytes)?;
        self.call(packet.packet_type.into(), store, sender, &packet.payload)
    }

    /// Dispatch, logging and counting failures instead of returning them
    pub fn handle(&self, store: &NodeStore, sender: NodeId, bytes: &[u8]) -> Effects {
        match self.dispatch(store, sender, bytes) {
            Ok(effects) => effects,
            Err(IngestError::Incompatible) => {
                debug!("Refused packet from quarantined node {}", sender);
                Effects::new()
            }
            Err(e) => {
                store.stats().record_malformed();
                debug!("Dropped packet from {}: {}", sender, e);
                Effects::new()
            }
        }
    }

    fn call(
        &self,
        kind: IngestKind,
        store: &NodeStore,
        sender: NodeId,
        payload: &[u8],
    ) -> Result<Effects, IngestError> {
        match self.handlers.get(&kind) {
            Some(handler) => handler(store, sender, payload),
            None => Err(IngestError::Malformed(format!("no handler for {:?}", kind))),
        }
    }
}

fn handle_avatar_data(
    store: &NodeStore,
    sender: NodeId,
    payload: &[u8],
) -> Result<Effects, IngestError> {
    let packet: AvatarDataPacket = protocol::decode(payload)?;

    if packet.data.len() > limits::MAX_AVATAR_DATA_BYTES {
        return Err(IngestError::AvatarDataTooLarge {
            len: packet.data.len(),
            max: limits::MAX_AVATAR_DATA_BYTES,
        });
    }
    if let Some(position) = &packet.position {
        if !position.is_finite() {
            return Err(IngestError::Malformed("non-finite position".to_string()));
        }
    }

    if let AvatarUpdate::Stale { stored } =
        store.upsert_avatar_data(sender, packet.data, packet.sequence, packet.position)
    {
        debug!(
            "Stale avatar data from {} (seq {} <= {})",
            sender, packet.sequence, stored
        );
    }
    Ok(Effects::new())
}

fn handle_avatar_identity(
    store: &NodeStore,
    sender: NodeId,
    payload: &[u8],
) -> Result<Effects, IngestError> {
    let info: IdentityInfo = protocol::decode(payload)?;

    if info.display_name.chars().count() > limits::MAX_DISPLAY_NAME_CHARS {
        return Err(IngestError::InvalidIdentity("display name too long"));
    }
    if info.skeleton_model_url.len() > limits::MAX_MODEL_URL_BYTES {
        return Err(IngestError::InvalidIdentity("model URL too long"));
    }

    if store.upsert_identity(sender, info) {
        debug!("Identity changed for {}", sender);
    }
    Ok(Effects::new())
}

fn handle_kill_avatar(
    store: &NodeStore,
    sender: NodeId,
    payload: &[u8],
) -> Result<Effects, IngestError> {
    let packet: KillAvatarPacket = protocol::decode(payload)?;
    if packet.node_id != sender {
        return Err(IngestError::ForeignKill {
            target: packet.node_id,
        });
    }

    let mut effects = Effects::new();
    if let Some(recipients) = store.remove(&sender) {
        effects.push(SideEffect::KillNotification {
            killed: sender,
            reason: packet.reason,
            recipients,
        });
    }
    Ok(effects)
}

fn handle_node_ignore_request(
    store: &NodeStore,
    sender: NodeId,
    payload: &[u8],
) -> Result<Effects, IngestError> {
    let packet: NodeIgnoreRequestPacket = protocol::decode(payload)?;
    if packet.targets.len() > limits::MAX_IGNORE_TARGETS {
        return Err(IngestError::TooManyIgnoreTargets(packet.targets.len()));
    }

    let mut effects = Effects::new();
    for target in packet.targets {
        if target == sender {
            continue;
        }

        if !packet.enabled {
            store.remove_ignore(sender, target, packet.bidirectional);
            continue;
        }

        if !store.add_ignore(sender, target, packet.bidirectional) {
            continue;
        }
        effects.push(SideEffect::KillNotification {
            killed: target,
            reason: KillReason::AvatarIgnored,
            recipients: vec![sender],
        });
        // Mixing suppresses the pair either way, so the target drops the
        // requester's avatar too
        if store.contains(&target) {
            effects.push(SideEffect::KillNotification {
                killed: sender,
                reason: KillReason::AvatarIgnored,
                recipients: vec![target],
            });
        }
    }
    Ok(effects)
}

fn handle_version_mismatch(
    store: &NodeStore,
    sender: NodeId,
    payload: &[u8],
) -> Result<Effects, IngestError> {
    store.stats().record_version_mismatch();

    let mut effects = Effects::new();
    if store.mark_incompatible(sender) {
        warn!(
            "Node {} speaks protocol version {:?}, expected {}",
            sender,
            InboundPacket::peek_version(payload),
            PROTOCOL_VERSION
        );
        effects.push(SideEffect::VersionMismatch { sender });
    }
    Ok(effects)
}

/// Register a newly connected node
pub fn node_connected(store: &NodeStore, node_id: NodeId) {
    if store.connect(node_id) {
        debug!("Node {} connected ({} total)", node_id, store.len());
    }
}

/// Remove a node that went away without a kill packet
pub fn node_disconnected(store: &NodeStore, node_id: NodeId) -> Option<SideEffect> {
    let recipients = store.remove(&node_id)?;
    Some(SideEffect::KillNotification {
        killed: node_id,
        reason: KillReason::AvatarDisconnected,
        recipients,
    })
}

/// Send the packets described by `effects`
pub fn deliver_effects<I>(effects: I, sender: &dyn PacketSender)
where
    I: IntoIterator<Item = SideEffect>,
{
    for effect in effects {
        match effect {
            SideEffect::KillNotification {
                killed,
                reason,
                recipients,
            } => {
                let payload = match protocol::encode(&MixerPacket::KillAvatar {
                    node_id: killed,
                    reason,
                }) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Failed to encode kill notification: {}", e);
                        continue;
                    }
                };
                for recipient in recipients {
                    if let Err(e) = sender.send(recipient, payload.clone()) {
                        debug!("Kill notification to {} not sent: {}", recipient, e);
                    }
                }
            }
            SideEffect::VersionMismatch { sender: node_id } => {
                let payload = match protocol::encode(&MixerPacket::VersionMismatch {
                    expected_version: PROTOCOL_VERSION,
                }) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Failed to encode version mismatch notice: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sender.send(node_id, payload) {
                    debug!("Version mismatch notice to {} not sent: {}", node_id, e);
                }
            }
        }
    }
}
