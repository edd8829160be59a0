//! Wire protocol and connection layer

pub mod connection;
pub mod framing;
pub mod protocol;

#[cfg(feature = "webtransport")]
pub mod tls;
#[cfg(feature = "webtransport")]
pub mod transport;
