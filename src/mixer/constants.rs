/// Broadcast cadence
pub mod broadcast {
    use std::time::Duration;

    /// Broadcast passes per second
    pub const FRAMES_PER_SECOND: u32 = 60;
    /// Target duration of one broadcast pass
    pub const INTERVAL: Duration = Duration::from_micros(1_000_000 / FRAMES_PER_SECOND as u64);
}

/// Overload detection and throttling policy
pub mod throttling {
    /// Number of frames the trailing sleep ratio averages over.
    /// The smoothing factor of the moving average is `1 / TRAILING_AVERAGE_FRAMES`.
    ///
    /// From idle, a sustained full overrun takes 230 frames (about 3.8 s at
    /// 60 fps) to pull the trailing ratio down to the struggle trigger, so
    /// single slow frames never throttle. A smaller value reacts sooner at
    /// the cost of throttling on short spikes.
    pub const TRAILING_AVERAGE_FRAMES: u32 = 100;
    /// At or below this trailing sleep ratio the mixer is struggling
    pub const STRUGGLE_TRIGGER_SLEEP_RATIO: f32 = 0.10;
    /// At or above this trailing sleep ratio the mixer backs off throttling
    pub const BACK_OFF_TRIGGER_SLEEP_RATIO: f32 = 0.20;
    /// Fraction of the remaining headroom added to the ratio per struggling frame
    pub const STRUGGLE_STEP: f32 = 0.5;
    /// Amount removed from the ratio per recovering frame
    pub const RATIO_BACK_OFF: f32 = 0.02;
    /// Highest throttling ratio; 10% of every budget survives maximum throttling
    pub const CEILING: f32 = 0.9;
    /// Rolling window of tick durations kept for reporting
    pub const DURATION_SAMPLES: usize = 120;
}

/// Per-node bandwidth
pub mod bandwidth {
    /// Default per-node send bandwidth (megabits per second)
    pub const DEFAULT_MAX_NODE_SEND_BANDWIDTH_MBPS: f64 = 1.0;
    pub const KILO_PER_MEGA: f64 = 1000.0;
    pub const BITS_PER_KILOBIT: f64 = 1000.0;
    pub const BITS_PER_BYTE: f64 = 8.0;
}

/// Inbound validation limits
pub mod limits {
    /// Largest pose blob accepted from a client
    pub const MAX_AVATAR_DATA_BYTES: usize = 16 * 1024;
    /// Longest display name accepted (characters)
    pub const MAX_DISPLAY_NAME_CHARS: usize = 128;
    /// Longest skeleton model URL accepted (bytes)
    pub const MAX_MODEL_URL_BYTES: usize = 2048;
    /// Most targets a single ignore request may name
    pub const MAX_IGNORE_TARGETS: usize = 64;
}

/// Connection layer
pub mod net {
    /// Maximum reliable message size
    pub const MAX_MESSAGE_SIZE: usize = 65536;
    /// Maximum datagram (unreliable) size
    pub const MAX_DATAGRAM_SIZE: usize = 1200;
    /// Outbound payloads queued per connection before sends are refused
    pub const OUTBOUND_QUEUE_DEPTH: usize = 64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_matches_frame_rate() {
        assert_eq!(broadcast::INTERVAL.as_micros(), 16_666);
    }

    #[test]
    fn test_hysteresis_band_is_open() {
        assert!(throttling::STRUGGLE_TRIGGER_SLEEP_RATIO < throttling::BACK_OFF_TRIGGER_SLEEP_RATIO);
        assert!(throttling::CEILING <= 1.0);
    }
}
