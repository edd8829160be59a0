use std::sync::Arc;

use anyhow::anyhow;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use avatar_mixer::config::{load_domain_settings, MixerConfig, MixerSettings};
use avatar_mixer::metrics::{self, Metrics};
use avatar_mixer::mixer::AvatarMixer;
use avatar_mixer::net::connection::ConnectionRegistry;
use avatar_mixer::net::transport::WebTransportServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Avatar Mixer v{}", env!("CARGO_PKG_VERSION"));

    let config = MixerConfig::load_or_default();
    config.validate().map_err(|e| anyhow!("Invalid configuration: {}", e))?;
    info!(
        "Configuration loaded: {}:{}, {} fps, {} kbps per node",
        config.bind_address, config.port, config.broadcast_fps, config.max_kbps_per_node
    );

    let settings = Arc::new(MixerSettings::new(config.max_kbps_per_node));
    if let Some(path) = &config.domain_settings_path {
        match load_domain_settings(path) {
            Ok(domain) => settings.apply_domain_settings(&domain),
            Err(e) => warn!("Failed to load domain settings from {}: {}", path.display(), e),
        }
    }

    let metrics = Arc::new(Metrics::new());
    let metrics_clone = metrics.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    let registry = Arc::new(ConnectionRegistry::new());
    let mixer = Arc::new(
        AvatarMixer::new(registry.clone(), settings, config.broadcast_interval())
            .with_metrics(metrics.clone()),
    );
    mixer.start()?;
    mixer.spawn_stats_reporter(config.stats_interval());

    let server = WebTransportServer::new(config.clone(), mixer.clone(), registry, metrics).await?;
    info!("Mixer ready on https://{}", server.bind_addr());
    info!(
        "Chrome flag: --ignore-certificate-errors-spki-list={}",
        server.cert_hash()
    );

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => error!("Failed to listen for shutdown signal: {}", e),
            }
        }
    }

    mixer.shutdown().await;
    info!("Mixer stopped");

    Ok(())
}
