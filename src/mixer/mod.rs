//! Avatar mixer
//!
//! Ingests per-frame avatar state from connected nodes and, on a fixed
//! cadence, sends every node a bandwidth-limited view of the other avatars.

pub mod allocator;
pub mod constants;
pub mod handlers;
pub mod overload;
pub mod scheduler;
pub mod sequence;
pub mod session;
pub mod stats;
pub mod store;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::MixerSettings;
use crate::metrics::Metrics;
use crate::net::connection::PacketSender;

use self::allocator::Mixer;
use self::handlers::PacketDispatcher;
use self::overload::ThrottlingState;
use self::scheduler::{BroadcastScheduler, SchedulerHandle};
use self::session::NodeId;
use self::stats::{AvatarStats, BroadcastStats, StatsReport};
use self::store::NodeStore;

/// Coordinating surface of the mixer
pub struct AvatarMixer {
    store: Arc<NodeStore>,
    dispatcher: PacketDispatcher,
    sender: Arc<dyn PacketSender>,
    settings: Arc<MixerSettings>,
    tick_interval: Duration,
    metrics: Option<Arc<Metrics>>,
    throttling: Mutex<Arc<ThrottlingState>>,
    scheduler: Mutex<Option<SchedulerHandle>>,
    reporter: Mutex<Option<JoinHandle<()>>>,
}

impl AvatarMixer {
    pub fn new(
        sender: Arc<dyn PacketSender>,
        settings: Arc<MixerSettings>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            store: Arc::new(NodeStore::new(Arc::new(BroadcastStats::new()))),
            dispatcher: PacketDispatcher::new(),
            sender,
            settings,
            tick_interval,
            metrics: None,
            throttling: Mutex::new(Arc::new(ThrottlingState::default())),
            scheduler: Mutex::new(None),
            reporter: Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<NodeStore> {
        &self.store
    }

    pub fn settings(&self) -> &Arc<MixerSettings> {
        &self.settings
    }

    /// Apply one inbound packet; returns whether the sender still has a session
    pub fn handle_packet(&self, sender: NodeId, bytes: &[u8]) -> bool {
        if let Some(metrics) = &self.metrics {
            metrics.record_received(bytes.len());
        }
        let effects = self.dispatcher.handle(&self.store, sender, bytes);
        handlers::deliver_effects(effects, self.sender.as_ref());
        self.store.contains(&sender)
    }

    pub fn node_connected(&self, node_id: NodeId) {
        handlers::node_connected(&self.store, node_id);
    }

    /// Remove a node and tell everyone else it left
    pub fn node_killed(&self, node_id: NodeId) {
        if let Some(effect) = handlers::node_disconnected(&self.store, node_id) {
            handlers::deliver_effects([effect], self.sender.as_ref());
        }
    }

    /// Drain the counters into a report
    pub fn stats_report(&self) -> StatsReport {
        let counters = self.store.stats().drain();
        let throttling = self.throttling.lock().clone();

        StatsReport {
            average_listeners_per_frame: counters.average_listeners_per_frame(),
            average_identity_packets_per_frame: counters.average_identity_packets_per_frame(),
            trailing_sleep_percentage: throttling.trailing_sleep_ratio() * 100.0,
            performance_throttling_ratio: throttling.throttling_ratio(),
            counters,
            avatars: self.avatar_stats(),
        }
    }

    #[cfg(feature = "metrics_extended")]
    fn avatar_stats(&self) -> BTreeMap<String, AvatarStats> {
        let tick_secs = self.tick_interval.as_secs_f64().max(f64::EPSILON);
        self.store
            .snapshot()
            .into_iter()
            .map(|snapshot| {
                let session = snapshot.handle.lock();
                let outbound_kbps = session.last_broadcast_bytes_sent as f64
                    * constants::bandwidth::BITS_PER_BYTE
                    / constants::bandwidth::BITS_PER_KILOBIT
                    / tick_secs;
                let stats = AvatarStats {
                    outbound_kbps,
                    bandwidth_budget_kbps: session.bandwidth_budget_bps
                        / constants::bandwidth::BITS_PER_KILOBIT,
                    avatars_sent_last_frame: session.avatars_sent_last_frame,
                    avatars_over_budget_last_frame: session.avatars_over_budget_last_frame,
                    stale_packets: session.stale_packets,
                    total_bytes_sent: session.total_bytes_sent,
                    incompatible: session.is_incompatible(),
                };
                (snapshot.node_id.to_string(), stats)
            })
            .collect()
    }

    #[cfg(not(feature = "metrics_extended"))]
    fn avatar_stats(&self) -> BTreeMap<String, AvatarStats> {
        BTreeMap::new()
    }

    /// Start the broadcast thread
    pub fn start(&self) -> anyhow::Result<()> {
        let mut slot = self.scheduler.lock();
        if slot.is_some() {
            anyhow::bail!("Avatar mixer already running");
        }

        let mixer = Mixer::new(
            self.store.clone(),
            self.sender.clone(),
            self.settings.clone(),
            self.tick_interval,
        )?;
        let mut scheduler = BroadcastScheduler::new(mixer);
        if let Some(metrics) = &self.metrics {
            scheduler = scheduler.with_metrics(metrics.clone());
        }
        *self.throttling.lock() = scheduler.throttling();

        *slot = Some(scheduler.spawn()?);
        info!("Avatar mixer started");
        Ok(())
    }

    /// Drain and log a stats report every `period`; requires a tokio runtime
    pub fn spawn_stats_reporter(self: &Arc<Self>, period: Duration) {
        let mixer = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let report = mixer.stats_report();
                info!(
                    "Stats: {:.1} listeners/frame, {:.2} identities/frame, sleep {:.1}%, throttling {:.2}",
                    report.average_listeners_per_frame,
                    report.average_identity_packets_per_frame,
                    report.trailing_sleep_percentage,
                    report.performance_throttling_ratio
                );

                if let Some(metrics) = &mixer.metrics {
                    match serde_json::to_string(&report) {
                        Ok(json) => metrics.set_stats_report(json),
                        Err(e) => warn!("Failed to serialize stats report: {}", e),
                    }
                }
            }
        });

        if let Some(previous) = self.reporter.lock().replace(task) {
            previous.abort();
        }
    }

    /// Stop the stats reporter and the broadcast thread after its current tick
    pub async fn shutdown(&self) {
        if let Some(reporter) = self.reporter.lock().take() {
            reporter.abort();
        }

        let handle = self.scheduler.lock().take();
        if let Some(handle) = handle {
            let ticks = handle.shutdown().await;
            info!("Avatar mixer stopped after {} ticks", ticks);
        }
    }
}
