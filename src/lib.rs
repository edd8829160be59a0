//! Avatar Mixer Library
//!
//! A real-time avatar mixer: clients stream pose updates over WebTransport
//! and receive a bandwidth-limited mix of the other avatars every frame.
//!
//! # Features
//!
//! - `webtransport` - WebTransport connection layer and TLS loading (enabled by default)
//! - `metrics_extended` - Per-avatar entries in the periodic stats report (enabled by default)

pub mod config;
pub mod metrics;
pub mod mixer;
pub mod net;
