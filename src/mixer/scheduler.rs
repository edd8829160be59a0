//! Fixed-cadence broadcast loop
//!
//! The loop owns the tick exclusively and runs on its own OS thread with a
//! current-thread runtime, so ingestion on the main runtime never waits for
//! a broadcast pass. Shutdown is only observed between ticks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::metrics::Metrics;
use crate::mixer::allocator::{Mixer, TickReport};
use crate::mixer::overload::{OverloadMonitor, OverloadTransition, ThrottlingState};

const THREAD_NAME: &str = "avatar-broadcast";

/// Result of one scheduled tick
#[derive(Debug, Clone, Copy)]
pub struct TickSummary {
    pub report: TickReport,
    pub elapsed: Duration,
    pub transition: OverloadTransition,
}

pub struct BroadcastScheduler {
    mixer: Mixer,
    monitor: OverloadMonitor,
    metrics: Option<Arc<Metrics>>,
}

impl BroadcastScheduler {
    pub fn new(mixer: Mixer) -> Self {
        let monitor = OverloadMonitor::new(mixer.tick_interval());
        Self {
            mixer,
            monitor,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Throttling values for readers outside the loop
    pub fn throttling(&self) -> Arc<ThrottlingState> {
        self.monitor.state()
    }

    pub fn monitor(&self) -> &OverloadMonitor {
        &self.monitor
    }

    /// Time, mix and feed the monitor once
    pub fn run_tick(&mut self) -> TickSummary {
        self.monitor.tick_start();
        let report = self.mixer.broadcast(self.monitor.throttling_ratio());
        let transition = self.monitor.tick_end();
        let elapsed = self.monitor.last_tick_duration();

        let store = self.mixer.store();
        store.stats().record_frame();

        if let Some(metrics) = &self.metrics {
            use std::sync::atomic::Ordering;

            metrics.record_tick_time(elapsed);
            metrics.record_broadcast(&report);
            metrics.record_throttling(
                self.monitor.trailing_sleep_ratio(),
                self.monitor.throttling_ratio(),
                self.monitor.budget_usage_percent(),
            );
            metrics.sessions_active.store(store.len() as u64, Ordering::Relaxed);
            metrics.max_kbps_per_node.store(
                self.mixer.settings().max_kbps_per_node().round() as u64,
                Ordering::Relaxed,
            );
        }

        TickSummary {
            report,
            elapsed,
            transition,
        }
    }

    /// Move the loop onto a dedicated thread
    pub fn spawn(mut self) -> anyhow::Result<SchedulerHandle> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();
        let period = self.mixer.tick_interval();

        std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                let ticks = runtime.block_on(async move {
                    let mut ticker = interval(period);
                    // An overrun tick is followed by the next one at once, without catch-up
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    let mut ticks = 0u64;

                    info!("Broadcast loop started ({:?} interval)", period);
                    loop {
                        tokio::select! {
                            biased;
                            _ = shutdown_rx.changed() => break,
                            _ = ticker.tick() => {
                                let summary = self.run_tick();
                                ticks += 1;
                                if ticks % 600 == 0 {
                                    debug!(
                                        "Tick {}: {} listeners, {} bytes in {:?}",
                                        ticks, summary.report.listeners, summary.report.bytes_sent, summary.elapsed
                                    );
                                }
                            }
                        }
                    }
                    ticks
                });

                info!("Broadcast loop stopped after {} ticks", ticks);
                let _ = done_tx.send(ticks);
            })?;

        Ok(SchedulerHandle {
            shutdown_tx,
            done_rx,
        })
    }
}

/// Stops the broadcast thread
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    done_rx: oneshot::Receiver<u64>,
}

impl SchedulerHandle {
    /// Signal shutdown and wait for the in-flight tick; returns ticks run
    pub async fn shutdown(self) -> u64 {
        let _ = self.shutdown_tx.send(true);
        self.done_rx.await.unwrap_or(0)
    }

    /// Blocking form of [`shutdown`](Self::shutdown) for non-async callers
    pub fn shutdown_blocking(self) -> u64 {
        let _ = self.shutdown_tx.send(true);
        self.done_rx.blocking_recv().unwrap_or(0)
    }
}
