//! Per-node mixer state
//!
//! One `ClientSession` exists per connected node. Ingestion writes the pose,
//! identity and ignore fields; the broadcast tick reads them through a
//! snapshot and writes back what it sent to the node as a listener.

use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use uuid::Uuid;

use crate::mixer::sequence::{sequence_greater_than, SequenceNumber};
use crate::net::protocol::{IdentityInfo, Position};

/// Unique identifier of a connected node
pub type NodeId = Uuid;

/// Latest pose received from a node
#[derive(Debug, Clone)]
pub struct AvatarData {
    pub sequence: SequenceNumber,
    pub position: Option<Position>,
    pub data: Bytes,
    /// Broadcast frame during which this pose arrived
    pub received_frame: u64,
}

/// What a listener last received from one sender
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SentRecord {
    pub sequence: Option<SequenceNumber>,
    pub identity_version: u64,
    pub frame: u64,
}

/// Outcome of applying an avatar data packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvatarUpdate {
    Applied,
    /// Sequence was older than or equal to the stored one
    Stale { stored: SequenceNumber },
}

impl AvatarUpdate {
    pub fn is_applied(&self) -> bool {
        matches!(self, AvatarUpdate::Applied)
    }
}

/// Server-side record of one connected node
#[derive(Debug)]
pub struct ClientSession {
    node_id: NodeId,
    avatar: Option<AvatarData>,
    identity: Option<Arc<IdentityInfo>>,
    /// Bumped whenever the identity content changes; 0 = no identity yet
    identity_version: u64,
    ignoring: FxHashSet<NodeId>,
    /// Nodes holding a one-way ignore against this one
    ignored_by: FxHashSet<NodeId>,
    /// Per-sender record of what this node has been sent as a listener
    sent: FxHashMap<NodeId, SentRecord>,
    /// Effective cap in bits per second, refreshed every tick
    pub bandwidth_budget_bps: f64,
    pub last_broadcast_bytes_sent: usize,
    pub total_bytes_sent: u64,
    pub avatars_sent_last_frame: usize,
    pub avatars_over_budget_last_frame: usize,
    pub stale_packets: u64,
    incompatible: bool,
    removed: bool,
}

impl ClientSession {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            avatar: None,
            identity: None,
            identity_version: 0,
            ignoring: FxHashSet::default(),
            ignored_by: FxHashSet::default(),
            sent: FxHashMap::default(),
            bandwidth_budget_bps: 0.0,
            last_broadcast_bytes_sent: 0,
            total_bytes_sent: 0,
            avatars_sent_last_frame: 0,
            avatars_over_budget_last_frame: 0,
            stale_packets: 0,
            incompatible: false,
            removed: false,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn avatar(&self) -> Option<&AvatarData> {
        self.avatar.as_ref()
    }

    pub fn identity(&self) -> Option<&Arc<IdentityInfo>> {
        self.identity.as_ref()
    }

    pub fn identity_version(&self) -> u64 {
        self.identity_version
    }

    /// Store a pose unless an equal or newer sequence is already held
    pub fn apply_avatar_data(&mut self, data: AvatarData) -> AvatarUpdate {
        if let Some(current) = &self.avatar {
            if !sequence_greater_than(data.sequence, current.sequence) {
                self.stale_packets += 1;
                return AvatarUpdate::Stale {
                    stored: current.sequence,
                };
            }
        }
        self.avatar = Some(data);
        AvatarUpdate::Applied
    }

    /// Replace the identity, returning whether its content changed
    pub fn apply_identity(&mut self, info: IdentityInfo) -> bool {
        let changed = self.identity.as_deref() != Some(&info);
        if changed {
            self.identity_version += 1;
        }
        self.identity = Some(Arc::new(info));
        changed
    }

    pub fn is_ignoring(&self, other: &NodeId) -> bool {
        self.ignoring.contains(other)
    }

    pub fn ignoring(&self) -> &FxHashSet<NodeId> {
        &self.ignoring
    }

    /// Start ignoring `other`; also forgets what was sent from it
    pub fn ignore(&mut self, other: NodeId) -> bool {
        self.sent.remove(&other);
        self.ignoring.insert(other)
    }

    pub fn unignore(&mut self, other: &NodeId) -> bool {
        self.ignoring.remove(other)
    }

    pub fn set_ignoring(&mut self, other: NodeId, enabled: bool) -> bool {
        if enabled {
            self.ignore(other)
        } else {
            self.unignore(&other)
        }
    }

    /// Note that `other` ignores this node; also forgets what was sent from it
    pub fn set_ignored_by(&mut self, other: NodeId, enabled: bool) {
        if enabled {
            self.sent.remove(&other);
            self.ignored_by.insert(other);
        } else {
            self.ignored_by.remove(&other);
        }
    }

    /// An ignore held by either side keeps `other` out of this node's view
    pub fn excludes(&self, other: &NodeId) -> bool {
        self.ignoring.contains(other) || self.ignored_by.contains(other)
    }

    pub fn sent_records(&self) -> &FxHashMap<NodeId, SentRecord> {
        &self.sent
    }

    pub fn record_sent(&mut self, sender: NodeId, record: SentRecord) {
        self.sent.insert(sender, record);
    }

    pub fn forget_sender(&mut self, sender: &NodeId) {
        self.sent.remove(sender);
        self.ignored_by.remove(sender);
    }

    pub fn is_incompatible(&self) -> bool {
        self.incompatible
    }

    /// Quarantine after a protocol version mismatch; returns true the first time
    pub fn mark_incompatible(&mut self) -> bool {
        !std::mem::replace(&mut self.incompatible, true)
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    pub(crate) fn mark_removed(&mut self) {
        self.removed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pose(sequence: SequenceNumber) -> AvatarData {
        AvatarData {
            sequence,
            position: None,
            data: Bytes::from(vec![sequence as u8; 4]),
            received_frame: 0,
        }
    }

    #[test]
    fn test_out_of_order_pose_dropped() {
        let mut session = ClientSession::new(Uuid::new_v4());

        assert!(session.apply_avatar_data(pose(5)).is_applied());
        assert_eq!(session.apply_avatar_data(pose(3)), AvatarUpdate::Stale { stored: 5 });
        assert!(session.apply_avatar_data(pose(7)).is_applied());

        let stored = session.avatar().unwrap();
        assert_eq!(stored.sequence, 7);
        assert_eq!(stored.data, Bytes::from(vec![7u8; 4]));
        assert_eq!(session.stale_packets, 1);
    }

    #[test]
    fn test_duplicate_pose_dropped() {
        let mut session = ClientSession::new(Uuid::new_v4());
        session.apply_avatar_data(pose(2));
        assert!(!session.apply_avatar_data(pose(2)).is_applied());
    }

    #[test]
    fn test_identity_version_bumps_on_change_only() {
        let mut session = ClientSession::new(Uuid::new_v4());
        let info = IdentityInfo {
            display_name: "Ada".to_string(),
            skeleton_model_url: String::new(),
        };

        assert!(session.apply_identity(info.clone()));
        assert_eq!(session.identity_version(), 1);
        assert!(!session.apply_identity(info));
        assert_eq!(session.identity_version(), 1);

        assert!(session.apply_identity(IdentityInfo {
            display_name: "Grace".to_string(),
            skeleton_model_url: String::new(),
        }));
        assert_eq!(session.identity_version(), 2);
    }

    #[test]
    fn test_ignore_forgets_sent_record() {
        let mut session = ClientSession::new(Uuid::new_v4());
        let other = Uuid::new_v4();
        session.record_sent(other, SentRecord { sequence: Some(4), identity_version: 1, frame: 3 });

        assert!(session.ignore(other));
        assert!(session.is_ignoring(&other));
        assert!(session.sent_records().get(&other).is_none());

        assert!(session.unignore(&other));
        assert!(!session.is_ignoring(&other));
    }

    #[test]
    fn test_mark_incompatible_once() {
        let mut session = ClientSession::new(Uuid::new_v4());
        assert!(session.mark_incompatible());
        assert!(!session.mark_incompatible());
        assert!(session.is_incompatible());
    }
}
