use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;

use crate::mixer::session::NodeId;

/// Why an outbound packet could not be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("No connection for recipient")]
    UnknownRecipient,
    #[error("Outbound queue full")]
    QueueFull,
    #[error("Connection closed")]
    Closed,
}

/// Non-blocking outbound path to connected nodes
pub trait PacketSender: Send + Sync {
    /// Queue `payload` for `recipient`; never waits on the network
    fn send(&self, recipient: NodeId, payload: Vec<u8>) -> Result<(), SendError>;
}

/// Traffic counters of one connection, shared with its reader and writer tasks
#[derive(Debug)]
pub struct ConnectionStats {
    pub remote_addr: Option<SocketAddr>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    packets_dropped: AtomicU64,
}

impl ConnectionStats {
    pub fn new(remote_addr: Option<SocketAddr>) -> Self {
        Self {
            remote_addr,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
        }
    }

    /// Record bytes sent
    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record bytes received
    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped.load(Ordering::Relaxed)
    }
}

struct ConnectionEntry {
    outbound: mpsc::Sender<Vec<u8>>,
    stats: Arc<ConnectionStats>,
}

/// Outbound queues of every live connection
pub struct ConnectionRegistry {
    connections: RwLock<FxHashMap<NodeId, ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(FxHashMap::default()),
        }
    }

    /// Add a connection with a bounded outbound queue; the caller drains the receiver
    pub fn register(
        &self,
        node_id: NodeId,
        remote_addr: Option<SocketAddr>,
        capacity: usize,
    ) -> (mpsc::Receiver<Vec<u8>>, Arc<ConnectionStats>) {
        let (outbound, receiver) = mpsc::channel(capacity.max(1));
        let stats = Arc::new(ConnectionStats::new(remote_addr));
        self.connections.write().insert(
            node_id,
            ConnectionEntry {
                outbound,
                stats: stats.clone(),
            },
        );
        (receiver, stats)
    }

    /// Remove a connection
    pub fn unregister(&self, node_id: &NodeId) -> Option<Arc<ConnectionStats>> {
        self.connections.write().remove(node_id).map(|entry| entry.stats)
    }

    /// Get connection count
    pub fn count(&self) -> usize {
        self.connections.read().len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketSender for ConnectionRegistry {
    fn send(&self, recipient: NodeId, payload: Vec<u8>) -> Result<(), SendError> {
        let connections = self.connections.read();
        let entry = connections.get(&recipient).ok_or(SendError::UnknownRecipient)?;

        match entry.outbound.try_send(payload) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                entry.stats.record_dropped();
                Err(SendError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }
}
