//! WebTransport server
//!
//! Each client session gets a node id, one bidirectional stream for framed
//! packets in both directions, and datagrams for unreliable pose updates.
//! Outbound packets are queued by the mixer through the connection registry
//! and written by a per-connection task.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;
use wtransport::endpoint::IncomingSession;
use wtransport::{Connection, Endpoint, RecvStream, SendStream, ServerConfig};

use crate::config::MixerConfig;
use crate::metrics::Metrics;
use crate::mixer::session::NodeId;
use crate::mixer::AvatarMixer;
use crate::net::connection::{ConnectionRegistry, ConnectionStats, PacketSender};
use crate::net::framing::{read_message, validate_datagram_size, write_message, FramingError};
use crate::net::protocol::{self, MixerPacket, PROTOCOL_VERSION};
use crate::net::tls::TlsConfig;

/// WebTransport front end of the mixer
pub struct WebTransportServer {
    config: MixerConfig,
    tls_config: TlsConfig,
    mixer: Arc<AvatarMixer>,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<Metrics>,
}

impl WebTransportServer {
    pub async fn new(
        config: MixerConfig,
        mixer: Arc<AvatarMixer>,
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        let tls_config = TlsConfig::load(&config).await?;
        Ok(Self {
            config,
            tls_config,
            mixer,
            registry,
            metrics,
        })
    }

    /// Get the certificate hash for client configuration
    pub fn cert_hash(&self) -> &str {
        self.tls_config.cert_hash()
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.config.bind_address, self.config.port)
    }

    /// Accept sessions until the endpoint fails
    pub async fn run(self) -> anyhow::Result<()> {
        let bind_addr = self.bind_addr();
        let server_config = ServerConfig::builder()
            .with_bind_address(bind_addr)
            .with_identity(self.tls_config.identity)
            .build();

        let server = Endpoint::server(server_config)?;
        info!("WebTransport server listening on {}", bind_addr);

        loop {
            let incoming = server.accept().await;
            let handler = ConnectionHandler {
                mixer: self.mixer.clone(),
                registry: self.registry.clone(),
                metrics: self.metrics.clone(),
                queue_depth: self.config.outbound_queue_depth,
            };

            tokio::spawn(async move {
                if let Err(e) = handler.run(incoming).await {
                    warn!("Connection error: {}", e);
                }
            });
        }
    }
}

struct ConnectionHandler {
    mixer: Arc<AvatarMixer>,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<Metrics>,
    queue_depth: usize,
}

impl ConnectionHandler {
    async fn run(self, incoming: IncomingSession) -> anyhow::Result<()> {
        let request = incoming.await?;
        debug!("Session request from {}, path {}", request.authority(), request.path());

        let connection = request.accept().await?;
        let (send, recv) = connection.accept_bi().await?;

        let node_id = Uuid::new_v4();
        let (outbound, stats) =
            self.registry
                .register(node_id, Some(connection.remote_address()), self.queue_depth);
        self.metrics
            .connections_active
            .store(self.registry.count() as u64, Ordering::Relaxed);

        let writer = tokio::spawn(write_outbound(send, outbound, stats.clone()));

        self.mixer.node_connected(node_id);
        let welcome = protocol::encode(&MixerPacket::Welcome {
            node_id,
            protocol_version: PROTOCOL_VERSION,
        })?;
        if let Err(e) = self.registry.send(node_id, welcome) {
            warn!("Failed to queue welcome for {}: {}", node_id, e);
        }
        info!("Node {} connected from {}", node_id, connection.remote_address());

        tokio::select! {
            _ = self.read_stream(node_id, recv, &stats) => {}
            _ = self.read_datagrams(node_id, &connection, &stats) => {}
        }

        self.registry.unregister(&node_id);
        self.mixer.node_killed(node_id);
        writer.abort();
        self.metrics
            .connections_active
            .store(self.registry.count() as u64, Ordering::Relaxed);

        info!(
            "Node {} disconnected from {:?} ({} packets / {} bytes in, {} / {} out, {} dropped)",
            node_id,
            stats.remote_addr,
            stats.packets_received(),
            stats.bytes_received(),
            stats.packets_sent(),
            stats.bytes_sent(),
            stats.packets_dropped()
        );
        Ok(())
    }

    async fn read_stream(&self, node_id: NodeId, mut recv: RecvStream, stats: &ConnectionStats) {
        loop {
            match read_message(&mut recv).await {
                Ok(packet) => {
                    stats.record_received(packet.len());
                    if !self.mixer.handle_packet(node_id, &packet) {
                        debug!("Node {} left", node_id);
                        return;
                    }
                }
                Err(FramingError::ConnectionClosed) => return,
                Err(e) => {
                    debug!("Stream read error from {}: {}", node_id, e);
                    return;
                }
            }
        }
    }

    async fn read_datagrams(&self, node_id: NodeId, connection: &Connection, stats: &ConnectionStats) {
        loop {
            let datagram = match connection.receive_datagram().await {
                Ok(datagram) => datagram,
                Err(e) => {
                    debug!("Datagram receive error from {}: {}", node_id, e);
                    return;
                }
            };

            if let Err(e) = validate_datagram_size(&datagram) {
                stats.record_dropped();
                debug!("Dropped datagram from {}: {}", node_id, e);
                continue;
            }

            stats.record_received(datagram.len());
            if !self.mixer.handle_packet(node_id, &datagram) {
                return;
            }
        }
    }
}

/// Drain the outbound queue onto the stream
async fn write_outbound(
    mut send: SendStream,
    mut outbound: tokio::sync::mpsc::Receiver<Vec<u8>>,
    stats: Arc<ConnectionStats>,
) {
    while let Some(payload) = outbound.recv().await {
        if let Err(e) = write_message(&mut send, &payload).await {
            debug!("Stream write error: {}", e);
            break;
        }
        stats.record_sent(payload.len());
    }
}
