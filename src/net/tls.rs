use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ring::digest::{digest, SHA256};
use std::path::Path;
use tracing::info;
use wtransport::Identity;

use crate::config::MixerConfig;

// Dev certificate paths
const DEV_CERT_FILE: &str = "certs/cert.pem";
const DEV_KEY_FILE: &str = "certs/key.pem";

/// TLS identity of the mixer's WebTransport endpoint
pub struct TlsConfig {
    pub identity: Identity,
    /// Base64-encoded SHA-256 hash of the certificate (for browser flag)
    pub cert_hash: String,
}

impl TlsConfig {
    /// Load from the configured paths, falling back to certs/
    pub async fn load(config: &MixerConfig) -> Result<Self> {
        if let (Some(cert_path), Some(key_path)) = (&config.tls_cert_path, &config.tls_key_path) {
            info!("Loading TLS certificate from {}", cert_path);
            return Self::load_from_paths(cert_path, key_path).await;
        }

        if Path::new(DEV_CERT_FILE).exists() && Path::new(DEV_KEY_FILE).exists() {
            info!("Loading dev certificate from certs/");
            Self::load_from_paths(DEV_CERT_FILE, DEV_KEY_FILE).await
        } else {
            Err(anyhow!(
                "TLS certificate not found. Set TLS_CERT_PATH and TLS_KEY_PATH, \
                or place cert.pem and key.pem under certs/."
            ))
        }
    }

    async fn load_from_paths(cert_path: &str, key_path: &str) -> Result<Self> {
        let identity = Identity::load_pemfiles(cert_path, key_path)
            .await
            .context("Failed to load certificate from PEM files")?;

        let cert_hash = Self::compute_cert_hash(&identity);
        info!("Certificate hash: {}", cert_hash);

        Ok(Self {
            identity,
            cert_hash,
        })
    }

    fn compute_cert_hash(identity: &Identity) -> String {
        identity
            .certificate_chain()
            .as_slice()
            .first()
            .map(|cert| STANDARD.encode(digest(&SHA256, cert.der()).as_ref()))
            .unwrap_or_default()
    }

    pub fn cert_hash(&self) -> &str {
        &self.cert_hash
    }
}
