//! Per-node state store shared by ingestion and the broadcast tick
//!
//! Sessions live behind their own mutex; the map itself is only locked to
//! look up, insert or remove a session. Lock order is always map before
//! session, and sessions in ascending `NodeId` order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::mixer::sequence::SequenceNumber;
use crate::mixer::session::{AvatarData, AvatarUpdate, ClientSession, NodeId, SentRecord};
use crate::mixer::stats::BroadcastStats;
use crate::net::protocol::{IdentityInfo, Position};

pub type SessionHandle = Arc<Mutex<ClientSession>>;

/// Per-session-consistent copy of one node, taken once per tick
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub node_id: NodeId,
    pub avatar: Option<AvatarData>,
    pub identity: Option<Arc<IdentityInfo>>,
    pub identity_version: u64,
    pub ignoring: FxHashSet<NodeId>,
    pub sent: FxHashMap<NodeId, SentRecord>,
    pub incompatible: bool,
    pub handle: SessionHandle,
}

impl SessionSnapshot {
    /// Either side ignoring the other suppresses the pair
    pub fn mutually_ignored(&self, other: &SessionSnapshot) -> bool {
        self.ignoring.contains(&other.node_id) || other.ignoring.contains(&self.node_id)
    }
}

/// Frozen view of which nodes are connected
pub(crate) struct Membership<'a> {
    sessions: &'a FxHashMap<NodeId, SessionHandle>,
}

impl Membership<'_> {
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.sessions.contains_key(node_id)
    }
}

/// Store of every connected node's latest state
pub struct NodeStore {
    sessions: RwLock<FxHashMap<NodeId, SessionHandle>>,
    /// Current broadcast frame, advanced by the tick
    frame: AtomicU64,
    stats: Arc<BroadcastStats>,
}

impl NodeStore {
    pub fn new(stats: Arc<BroadcastStats>) -> Self {
        Self {
            sessions: RwLock::new(FxHashMap::default()),
            frame: AtomicU64::new(0),
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<BroadcastStats> {
        &self.stats
    }

    /// Register a node; returns false if it already had a session
    pub fn connect(&self, node_id: NodeId) -> bool {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&node_id) {
            return false;
        }
        sessions.insert(node_id, Arc::new(Mutex::new(ClientSession::new(node_id))));
        true
    }

    /// Lookups never queue behind a pending removal, so ingestion keeps
    /// flowing while a tick holds the membership guard
    pub fn get(&self, node_id: &NodeId) -> Option<SessionHandle> {
        self.sessions.read_recursive().get(node_id).cloned()
    }

    /// Fetch a session, creating it on first contact
    pub fn get_or_create(&self, node_id: NodeId) -> SessionHandle {
        if let Some(handle) = self.get(&node_id) {
            return handle;
        }
        self.sessions
            .write()
            .entry(node_id)
            .or_insert_with(|| Arc::new(Mutex::new(ClientSession::new(node_id))))
            .clone()
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.sessions.read_recursive().contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read_recursive().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read_recursive().is_empty()
    }

    pub fn current_frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    /// Start a new broadcast frame, returning its number
    pub fn advance_frame(&self) -> u64 {
        self.frame.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Apply a pose if it is newer than the stored one
    pub fn upsert_avatar_data(
        &self,
        node_id: NodeId,
        data: Bytes,
        sequence: SequenceNumber,
        position: Option<Position>,
    ) -> AvatarUpdate {
        let handle = self.get_or_create(node_id);
        let update = handle.lock().apply_avatar_data(AvatarData {
            sequence,
            position,
            data,
            received_frame: self.current_frame(),
        });

        match update {
            AvatarUpdate::Applied => self.stats.record_avatar_packet(),
            AvatarUpdate::Stale { .. } => self.stats.record_stale(),
        }
        update
    }

    /// Replace identity metadata; returns whether it changed
    pub fn upsert_identity(&self, node_id: NodeId, info: IdentityInfo) -> bool {
        let handle = self.get_or_create(node_id);
        let changed = handle.lock().apply_identity(info);
        self.stats.record_identity_packet();
        changed
    }

    /// Delete a session, returning every other node at the moment of removal
    pub fn remove(&self, node_id: &NodeId) -> Option<Vec<NodeId>> {
        let (others, remaining) = {
            let mut sessions = self.sessions.write();
            let removed = sessions.remove(node_id)?;
            // Flagged under the map lock: any send after this point sees it
            removed.lock().mark_removed();
            let others: Vec<NodeId> = sessions.keys().copied().collect();
            let remaining: Vec<SessionHandle> = sessions.values().cloned().collect();
            (others, remaining)
        };

        for handle in remaining {
            handle.lock().forget_sender(node_id);
        }

        self.stats.record_kill();
        debug!("Removed node {}, notifying {} others", node_id, others.len());
        Some(others)
    }

    /// Start ignoring `target`; with `bidirectional` both nodes ignore each other
    pub fn add_ignore(&self, node_id: NodeId, target: NodeId, bidirectional: bool) -> bool {
        self.update_ignore(node_id, target, bidirectional, true)
    }

    /// Lift an ignore; with `bidirectional` both directions are lifted
    pub fn remove_ignore(&self, node_id: NodeId, target: NodeId, bidirectional: bool) -> bool {
        self.update_ignore(node_id, target, bidirectional, false)
    }

    fn update_ignore(
        &self,
        node_id: NodeId,
        target: NodeId,
        bidirectional: bool,
        enabled: bool,
    ) -> bool {
        if node_id == target {
            return false;
        }

        let requester = self.get_or_create(node_id);
        let Some(other) = self.get(&target) else {
            // The target is gone; only the requester's side can be recorded
            return requester.lock().set_ignoring(target, enabled);
        };

        // Both sides change under both locks, taken in id order
        let (mut first, mut second) = if node_id < target {
            let a = requester.lock();
            let b = other.lock();
            (a, b)
        } else {
            let b = other.lock();
            let a = requester.lock();
            (a, b)
        };
        let changed = first.set_ignoring(target, enabled);
        if bidirectional {
            second.set_ignoring(node_id, enabled) || changed
        } else {
            second.set_ignored_by(node_id, enabled);
            changed
        }
    }

    pub fn is_ignoring(&self, node_id: &NodeId, target: &NodeId) -> bool {
        self.get(node_id)
            .map(|handle| handle.lock().is_ignoring(target))
            .unwrap_or(false)
    }

    /// Quarantine a node after a version mismatch; true the first time
    pub fn mark_incompatible(&self, node_id: NodeId) -> bool {
        self.get_or_create(node_id).lock().mark_incompatible()
    }

    pub fn is_incompatible(&self, node_id: &NodeId) -> bool {
        self.get(node_id)
            .map(|handle| handle.lock().is_incompatible())
            .unwrap_or(false)
    }

    /// Run `f` while no session can be added or removed.
    ///
    /// `f` may lock individual sessions but must not call back into the store.
    pub(crate) fn with_membership<R>(&self, f: impl FnOnce(&Membership<'_>) -> R) -> R {
        let sessions = self.sessions.read();
        f(&Membership { sessions: &*sessions })
    }

    /// Copy every session, each under its own lock
    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let handles: Vec<SessionHandle> = self.sessions.read().values().cloned().collect();

        handles
            .into_iter()
            .filter_map(|handle| {
                let snapshot = {
                    let session = handle.lock();
                    if session.is_removed() {
                        return None;
                    }
                    SessionSnapshot {
                        node_id: session.node_id(),
                        avatar: session.avatar().cloned(),
                        identity: session.identity().cloned(),
                        identity_version: session.identity_version(),
                        ignoring: session.ignoring().clone(),
                        sent: session.sent_records().clone(),
                        incompatible: session.is_incompatible(),
                        handle: handle.clone(),
                    }
                };
                Some(snapshot)
            })
            .collect()
    }
}
