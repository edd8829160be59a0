//! Prometheus-compatible metrics endpoint
//!
//! Exposes mixer metrics in Prometheus format.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{info, debug};

use crate::mixer::allocator::TickReport;

/// Metrics registry for the mixer
#[derive(Debug)]
pub struct Metrics {
    // Population
    pub sessions_active: AtomicU64,
    pub connections_active: AtomicU64,

    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,
    pub budget_usage_percent: AtomicU64,

    // Throttling, stored as ratio * 1000
    pub trailing_sleep_permille: AtomicU64,
    pub throttling_permille: AtomicU64,
    pub max_kbps_per_node: AtomicU64,

    // Broadcast output
    pub listeners_last_tick: AtomicU64,
    pub avatars_sent: AtomicU64,
    pub avatars_over_budget: AtomicU64,
    pub send_failures: AtomicU64,
    pub bytes_sent: AtomicU64,

    // Ingestion
    pub packets_received: AtomicU64,
    pub bytes_received: AtomicU64,

    start_time: Instant,

    // Rolling tick times for percentile calculation
    tick_history: RwLock<VecDeque<u64>>,

    // Last periodic stats report, as JSON
    stats_report: RwLock<String>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            sessions_active: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            budget_usage_percent: AtomicU64::new(0),
            trailing_sleep_permille: AtomicU64::new(1000),
            throttling_permille: AtomicU64::new(0),
            max_kbps_per_node: AtomicU64::new(0),
            listeners_last_tick: AtomicU64::new(0),
            avatars_sent: AtomicU64::new(0),
            avatars_over_budget: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(1000)),
            stats_report: RwLock::new("{}".to_string()),
        }
    }

    /// Record a tick time and update percentiles
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);
        while history.len() > 1000 {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.tick_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_p99_us.store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    /// Record the output of one broadcast pass
    pub fn record_broadcast(&self, report: &TickReport) {
        self.listeners_last_tick.store(report.listeners as u64, Ordering::Relaxed);
        self.avatars_sent.fetch_add(report.avatars_sent as u64, Ordering::Relaxed);
        self.avatars_over_budget.fetch_add(report.avatars_over_budget as u64, Ordering::Relaxed);
        self.send_failures.fetch_add(report.send_failures as u64, Ordering::Relaxed);
        self.bytes_sent.fetch_add(report.bytes_sent as u64, Ordering::Relaxed);
    }

    pub fn record_throttling(&self, trailing_sleep_ratio: f32, throttling_ratio: f32, budget_usage_percent: f32) {
        self.trailing_sleep_permille
            .store((trailing_sleep_ratio * 1000.0).round() as u64, Ordering::Relaxed);
        self.throttling_permille
            .store((throttling_ratio * 1000.0).round() as u64, Ordering::Relaxed);
        self.budget_usage_percent
            .store(budget_usage_percent.round() as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn set_stats_report(&self, json: String) {
        *self.stats_report.write() = json;
    }

    pub fn stats_report(&self) -> String {
        self.stats_report.read().clone()
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("avatar_mixer_sessions", "Connected avatar sessions", "gauge",
            self.sessions_active.load(Ordering::Relaxed));
        metric!("avatar_mixer_connections_active", "Active WebTransport connections", "gauge",
            self.connections_active.load(Ordering::Relaxed));

        metric!("avatar_mixer_tick_time_microseconds", "Last broadcast pass time in microseconds", "gauge",
            self.tick_time_us.load(Ordering::Relaxed));
        metric!("avatar_mixer_tick_time_p95_microseconds", "95th percentile broadcast pass time", "gauge",
            self.tick_time_p95_us.load(Ordering::Relaxed));
        metric!("avatar_mixer_tick_time_p99_microseconds", "99th percentile broadcast pass time", "gauge",
            self.tick_time_p99_us.load(Ordering::Relaxed));
        metric!("avatar_mixer_tick_time_max_microseconds", "Maximum broadcast pass time", "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed));
        metric!("avatar_mixer_tick_count", "Total broadcast passes", "counter",
            self.tick_count.load(Ordering::Relaxed));
        metric!("avatar_mixer_budget_usage_percent", "Broadcast interval usage percentage", "gauge",
            self.budget_usage_percent.load(Ordering::Relaxed));

        metric!("avatar_mixer_trailing_sleep_permille", "Trailing idle fraction of the interval (x1000)", "gauge",
            self.trailing_sleep_permille.load(Ordering::Relaxed));
        metric!("avatar_mixer_throttling_permille", "Performance throttling ratio (x1000)", "gauge",
            self.throttling_permille.load(Ordering::Relaxed));
        metric!("avatar_mixer_max_kbps_per_node", "Per-node bandwidth cap before throttling", "gauge",
            self.max_kbps_per_node.load(Ordering::Relaxed));

        metric!("avatar_mixer_listeners", "Listeners served by the last pass", "gauge",
            self.listeners_last_tick.load(Ordering::Relaxed));
        metric!("avatar_mixer_avatars_sent_total", "Avatar records sent", "counter",
            self.avatars_sent.load(Ordering::Relaxed));
        metric!("avatar_mixer_avatars_over_budget_total", "Avatar records cut by bandwidth budgets", "counter",
            self.avatars_over_budget.load(Ordering::Relaxed));
        metric!("avatar_mixer_send_failures_total", "Payloads refused by the connection layer", "counter",
            self.send_failures.load(Ordering::Relaxed));
        metric!("avatar_mixer_bytes_sent_total", "Total payload bytes sent", "counter",
            self.bytes_sent.load(Ordering::Relaxed));

        metric!("avatar_mixer_packets_received_total", "Total packets received", "counter",
            self.packets_received.load(Ordering::Relaxed));
        metric!("avatar_mixer_bytes_received_total", "Total bytes received", "counter",
            self.bytes_received.load(Ordering::Relaxed));
        metric!("avatar_mixer_uptime_seconds", "Mixer uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// Generate JSON format metrics
    pub fn to_json(&self) -> String {
        let load = |value: &AtomicU64| value.load(Ordering::Relaxed);
        serde_json::json!({
            "sessions": load(&self.sessions_active),
            "connections": load(&self.connections_active),
            "performance": {
                "tick_time_us": load(&self.tick_time_us),
                "tick_time_p95_us": load(&self.tick_time_p95_us),
                "tick_time_p99_us": load(&self.tick_time_p99_us),
                "tick_time_max_us": load(&self.tick_time_max_us),
                "tick_count": load(&self.tick_count),
                "budget_percent": load(&self.budget_usage_percent),
                "trailing_sleep_ratio": load(&self.trailing_sleep_permille) as f64 / 1000.0,
                "throttling_ratio": load(&self.throttling_permille) as f64 / 1000.0,
            },
            "broadcast": {
                "max_kbps_per_node": load(&self.max_kbps_per_node),
                "listeners": load(&self.listeners_last_tick),
                "avatars_sent": load(&self.avatars_sent),
                "avatars_over_budget": load(&self.avatars_over_budget),
                "send_failures": load(&self.send_failures),
                "bytes_sent": load(&self.bytes_sent),
            },
            "network": {
                "packets_received": load(&self.packets_received),
                "bytes_received": load(&self.bytes_received),
            },
            "uptime_seconds": self.uptime_seconds(),
        })
        .to_string()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn http_response(content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content_type,
        body.len(),
        body
    )
}

/// Build the HTTP response for a raw request
fn route(metrics: &Metrics, request: &str) -> String {
    if request.starts_with("GET /metrics/json") {
        http_response("application/json", &metrics.to_json())
    } else if request.starts_with("GET /metrics") {
        http_response("text/plain; version=0.0.4", &metrics.to_prometheus())
    } else if request.starts_with("GET /stats") {
        http_response("application/json", &metrics.stats_report())
    } else if request.starts_with("GET /health") {
        http_response("text/plain", "OK")
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);
                    let response = route(&metrics, &request);

                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}
