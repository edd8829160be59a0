//! Broadcast counters and the periodic stats report
//!
//! Counters are incremented from both the ingestion path and the broadcast
//! tick. `drain` swaps every counter with zero, so each increment is reported
//! by exactly one drain.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters accumulated since the last drain
#[derive(Debug, Default)]
pub struct BroadcastStats {
    num_listeners: AtomicU64,
    num_identity_packets: AtomicU64,
    num_frames: AtomicU64,
    avatar_packets: AtomicU64,
    stale_dropped: AtomicU64,
    malformed_dropped: AtomicU64,
    avatars_sent: AtomicU64,
    avatars_held_back: AtomicU64,
    avatars_over_budget: AtomicU64,
    avatars_with_skipped_frames: AtomicU64,
    identities_sent: AtomicU64,
    bytes_sent: AtomicU64,
    kills: AtomicU64,
    version_mismatches: AtomicU64,
}

/// Values returned by a drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub num_listeners: u64,
    pub num_identity_packets: u64,
    pub num_frames: u64,
    pub avatar_packets: u64,
    pub stale_dropped: u64,
    pub malformed_dropped: u64,
    pub avatars_sent: u64,
    pub avatars_held_back: u64,
    pub avatars_over_budget: u64,
    pub avatars_with_skipped_frames: u64,
    pub identities_sent: u64,
    pub bytes_sent: u64,
    pub kills: u64,
    pub version_mismatches: u64,
}

impl StatsSnapshot {
    pub fn average_listeners_per_frame(&self) -> f32 {
        per_frame(self.num_listeners, self.num_frames)
    }

    pub fn average_identity_packets_per_frame(&self) -> f32 {
        per_frame(self.num_identity_packets, self.num_frames)
    }
}

fn per_frame(value: u64, frames: u64) -> f32 {
    if frames == 0 {
        0.0
    } else {
        value as f32 / frames as f32
    }
}

impl BroadcastStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_frame(&self) {
        self.num_frames.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_listener(&self) {
        self.num_listeners.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_identity_packet(&self) {
        self.num_identity_packets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_avatar_packet(&self) {
        self.avatar_packets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_stale(&self) {
        self.stale_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_malformed(&self) {
        self.malformed_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_kill(&self) {
        self.kills.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_version_mismatch(&self) {
        self.version_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of composing one listener's payload
    pub fn record_mix(&self, mix: &ListenerMixCounts) {
        self.avatars_sent.fetch_add(mix.sent as u64, Ordering::Relaxed);
        self.avatars_held_back.fetch_add(mix.held_back as u64, Ordering::Relaxed);
        self.avatars_over_budget.fetch_add(mix.over_budget as u64, Ordering::Relaxed);
        self.avatars_with_skipped_frames
            .fetch_add(mix.skipped_frames as u64, Ordering::Relaxed);
        self.identities_sent.fetch_add(mix.identities as u64, Ordering::Relaxed);
        self.bytes_sent.fetch_add(mix.bytes as u64, Ordering::Relaxed);
    }

    /// Read and reset every counter
    pub fn drain(&self) -> StatsSnapshot {
        let take = |counter: &AtomicU64| counter.swap(0, Ordering::AcqRel);
        StatsSnapshot {
            num_listeners: take(&self.num_listeners),
            num_identity_packets: take(&self.num_identity_packets),
            num_frames: take(&self.num_frames),
            avatar_packets: take(&self.avatar_packets),
            stale_dropped: take(&self.stale_dropped),
            malformed_dropped: take(&self.malformed_dropped),
            avatars_sent: take(&self.avatars_sent),
            avatars_held_back: take(&self.avatars_held_back),
            avatars_over_budget: take(&self.avatars_over_budget),
            avatars_with_skipped_frames: take(&self.avatars_with_skipped_frames),
            identities_sent: take(&self.identities_sent),
            bytes_sent: take(&self.bytes_sent),
            kills: take(&self.kills),
            version_mismatches: take(&self.version_mismatches),
        }
    }
}

/// Counts for one listener in one tick, only recorded once delivered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerMixCounts {
    pub sent: usize,
    pub held_back: usize,
    pub over_budget: usize,
    pub skipped_frames: usize,
    pub identities: usize,
    pub bytes: usize,
}

/// Per-avatar entry of the stats report
#[derive(Debug, Clone, Serialize)]
pub struct AvatarStats {
    pub outbound_kbps: f64,
    pub bandwidth_budget_kbps: f64,
    pub avatars_sent_last_frame: usize,
    pub avatars_over_budget_last_frame: usize,
    pub stale_packets: u64,
    pub total_bytes_sent: u64,
    pub incompatible: bool,
}

/// Periodic report handed to the stats collaborator
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub average_listeners_per_frame: f32,
    pub average_identity_packets_per_frame: f32,
    pub trailing_sleep_percentage: f32,
    pub performance_throttling_ratio: f32,
    pub counters: StatsSnapshot,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub avatars: BTreeMap<String, AvatarStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_identity_packets_drain_then_zero() {
        let stats = BroadcastStats::new();
        for _ in 0..7 {
            stats.record_identity_packet();
        }

        assert_eq!(stats.drain().num_identity_packets, 7);
        assert_eq!(stats.drain().num_identity_packets, 0);
    }

    #[test]
    fn test_averages() {
        let snapshot = StatsSnapshot {
            num_listeners: 30,
            num_identity_packets: 6,
            num_frames: 3,
            ..Default::default()
        };
        assert_eq!(snapshot.average_listeners_per_frame(), 10.0);
        assert_eq!(snapshot.average_identity_packets_per_frame(), 2.0);
        assert_eq!(StatsSnapshot::default().average_listeners_per_frame(), 0.0);
    }

    #[test]
    fn test_record_mix() {
        let stats = BroadcastStats::new();
        stats.record_mix(&ListenerMixCounts {
            sent: 3,
            held_back: 1,
            over_budget: 2,
            skipped_frames: 0,
            identities: 1,
            bytes: 120,
        });
        let drained = stats.drain();
        assert_eq!(drained.avatars_sent, 3);
        assert_eq!(drained.avatars_over_budget, 2);
        assert_eq!(drained.bytes_sent, 120);
    }

    #[test]
    fn test_no_increment_lost_to_concurrent_drains() {
        let stats = Arc::new(BroadcastStats::new());
        const THREADS: u64 = 4;
        const PER_THREAD: u64 = 10_000;

        let drained_total = std::thread::scope(|scope| {
            for _ in 0..THREADS {
                let stats = stats.clone();
                scope.spawn(move || {
                    for _ in 0..PER_THREAD {
                        stats.record_identity_packet();
                    }
                });
            }

            let drainer = scope.spawn(|| {
                let mut total = 0;
                for _ in 0..1_000 {
                    total += stats.drain().num_identity_packets;
                }
                total
            });
            drainer.join().unwrap()
        });

        let remainder = stats.drain().num_identity_packets;
        assert_eq!(drained_total + remainder, THREADS * PER_THREAD);
    }
}
