use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Deserialize;

use crate::mixer::constants::{bandwidth, broadcast, net};

/// Mixer process configuration
#[derive(Debug, Clone)]
pub struct MixerConfig {
    /// Address to bind the server to
    pub bind_address: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Port of the HTTP metrics endpoint
    pub metrics_port: u16,
    /// Broadcast passes per second
    pub broadcast_fps: u32,
    /// Per-node outbound cap before throttling
    pub max_kbps_per_node: f32,
    /// Seconds between stats reports
    pub stats_interval_secs: u64,
    /// Outbound packets queued per connection before sends fail
    pub outbound_queue_depth: usize,
    /// Optional domain settings document
    pub domain_settings_path: Option<PathBuf>,
    /// Path to TLS certificate file
    pub tls_cert_path: Option<String>,
    /// Path to TLS key file
    pub tls_key_path: Option<String>,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 4444,
            metrics_port: 9090,
            broadcast_fps: broadcast::FRAMES_PER_SECOND,
            max_kbps_per_node: (bandwidth::DEFAULT_MAX_NODE_SEND_BANDWIDTH_MBPS * bandwidth::KILO_PER_MEGA)
                as f32,
            stats_interval_secs: 1,
            outbound_queue_depth: net::OUTBOUND_QUEUE_DEPTH,
            domain_settings_path: None,
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

/// Parse an environment variable, warning and keeping the default when invalid
fn env_parse<T: std::str::FromStr>(name: &str, accept: impl Fn(&T) -> bool, target: &mut T) {
    let Ok(raw) = std::env::var(name) else {
        return;
    };
    match raw.parse::<T>() {
        Ok(parsed) if accept(&parsed) => *target = parsed,
        Ok(_) => tracing::warn!("{} '{}' out of range, using default", name, raw),
        Err(_) => tracing::warn!("Invalid {} '{}', using default", name, raw),
    }
}

impl MixerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        env_parse("BIND_ADDRESS", |_| true, &mut config.bind_address);
        env_parse("PORT", |p: &u16| *p > 0, &mut config.port);
        env_parse("METRICS_PORT", |p: &u16| *p > 0, &mut config.metrics_port);
        env_parse("BROADCAST_FPS", |fps: &u32| (1..=1000).contains(fps), &mut config.broadcast_fps);
        env_parse(
            "MAX_KBPS_PER_NODE",
            |kbps: &f32| kbps.is_finite() && *kbps > 0.0,
            &mut config.max_kbps_per_node,
        );
        env_parse("STATS_INTERVAL_SECS", |s: &u64| *s > 0, &mut config.stats_interval_secs);
        env_parse("OUTBOUND_QUEUE_DEPTH", |d: &usize| *d > 0, &mut config.outbound_queue_depth);

        if let Ok(path) = std::env::var("DOMAIN_SETTINGS_PATH") {
            config.domain_settings_path = Some(PathBuf::from(path));
        }

        if let Ok(cert_path) = std::env::var("TLS_CERT_PATH") {
            config.tls_cert_path = Some(cert_path);
        }

        if let Ok(key_path) = std::env::var("TLS_KEY_PATH") {
            config.tls_key_path = Some(key_path);
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("Port cannot be 0".to_string());
        }
        if self.metrics_port == self.port {
            return Err("metrics_port must differ from port".to_string());
        }
        if self.broadcast_fps == 0 {
            return Err("broadcast_fps must be at least 1".to_string());
        }
        if !(self.max_kbps_per_node.is_finite() && self.max_kbps_per_node > 0.0) {
            return Err("max_kbps_per_node must be a positive number".to_string());
        }
        if self.stats_interval_secs == 0 {
            return Err("stats_interval_secs must be at least 1".to_string());
        }
        if self.outbound_queue_depth == 0 {
            return Err("outbound_queue_depth must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.broadcast_fps.max(1) as u64)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

/// Settings that may change while the mixer runs
#[derive(Debug)]
pub struct MixerSettings {
    max_kbps_per_node: RwLock<f32>,
}

impl MixerSettings {
    pub fn new(max_kbps_per_node: f32) -> Self {
        Self {
            max_kbps_per_node: RwLock::new(max_kbps_per_node),
        }
    }

    pub fn max_kbps_per_node(&self) -> f32 {
        *self.max_kbps_per_node.read()
    }

    /// Replace the per-node cap; rejected values leave it unchanged
    pub fn update_max_kbps(&self, kbps: f32) -> bool {
        if !(kbps.is_finite() && kbps > 0.0) {
            tracing::warn!("Ignoring invalid per-node bandwidth {}", kbps);
            return false;
        }
        let mut current = self.max_kbps_per_node.write();
        if *current != kbps {
            tracing::info!("Per-node bandwidth cap {} -> {} kbps", *current, kbps);
            *current = kbps;
        }
        true
    }

    /// Apply a domain settings document; absent keys leave the current value
    pub fn apply_domain_settings(&self, settings: &DomainSettings) {
        match settings.configured_max_kbps_per_node() {
            Some(kbps) => {
                self.update_max_kbps(kbps);
            }
            None => tracing::debug!(
                "Domain settings carry no bandwidth cap, keeping {} kbps",
                self.max_kbps_per_node()
            ),
        }
    }
}

/// Domain settings document delivered by the domain server
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DomainSettings {
    #[serde(default)]
    pub avatar_mixer: AvatarMixerSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AvatarMixerSettings {
    /// Megabits per second; anything but a number falls back to the default
    #[serde(default)]
    pub max_node_send_bandwidth: Option<serde_json::Value>,
}

impl DomainSettings {
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Per-node cap in kbps
    pub fn max_kbps_per_node(&self) -> f32 {
        self.configured_max_kbps_per_node().unwrap_or(
            (bandwidth::DEFAULT_MAX_NODE_SEND_BANDWIDTH_MBPS * bandwidth::KILO_PER_MEGA) as f32,
        )
    }

    /// Per-node cap in kbps, or `None` when the document does not set one
    pub fn configured_max_kbps_per_node(&self) -> Option<f32> {
        let value = self.avatar_mixer.max_node_send_bandwidth.as_ref()?;
        let mbps = value
            .as_f64()
            .filter(|mbps| mbps.is_finite() && *mbps > 0.0)
            .unwrap_or(bandwidth::DEFAULT_MAX_NODE_SEND_BANDWIDTH_MBPS);
        Some((mbps * bandwidth::KILO_PER_MEGA) as f32)
    }
}

/// Read and parse a domain settings file
pub fn load_domain_settings(path: &Path) -> anyhow::Result<DomainSettings> {
    let json = std::fs::read_to_string(path)?;
    Ok(DomainSettings::parse(&json)?)
}
