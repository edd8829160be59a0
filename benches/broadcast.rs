//! Broadcast pass benchmarks
//!
//! Measures one full mix (compose and deliver) at increasing session counts,
//! with every avatar moving each frame.
//!
//! Run with: cargo bench --bench broadcast

use std::sync::Arc;
use std::time::Duration;

use avatar_mixer::config::MixerSettings;
use avatar_mixer::mixer::allocator::Mixer;
use avatar_mixer::mixer::session::NodeId;
use avatar_mixer::mixer::stats::BroadcastStats;
use avatar_mixer::mixer::store::NodeStore;
use avatar_mixer::net::connection::{PacketSender, SendError};
use avatar_mixer::net::protocol::Position;
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;
use uuid::Uuid;

const POSE_BYTES: usize = 120;

/// Accepts and discards every payload
struct NullSender;

impl PacketSender for NullSender {
    fn send(&self, _recipient: NodeId, payload: Vec<u8>) -> Result<(), SendError> {
        black_box(payload);
        Ok(())
    }
}

/// Create a mixer with `count` sessions spread around the origin
fn create_mixer(count: usize, max_kbps: f32) -> (Mixer, Vec<(NodeId, Position)>) {
    let store = Arc::new(NodeStore::new(Arc::new(BroadcastStats::new())));
    let mixer = Mixer::new(
        store,
        Arc::new(NullSender),
        Arc::new(MixerSettings::new(max_kbps)),
        Duration::from_micros(16_667),
    )
    .expect("empty bulk packet encodes");

    let mut rng = rand::thread_rng();
    let nodes = (0..count)
        .map(|_| {
            let position = Position::new(
                rng.gen_range(-50.0..50.0),
                rng.gen_range(0.0..3.0),
                rng.gen_range(-50.0..50.0),
            );
            (Uuid::new_v4(), position)
        })
        .collect();

    (mixer, nodes)
}

fn bench_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast");
    group.sample_size(30);
    let pose = Bytes::from(vec![0xA5u8; POSE_BYTES]);

    for count in [10, 50, 100, 250, 500] {
        let (mixer, nodes) = create_mixer(count, 1000.0);
        let mut sequence: u16 = 0;

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("moving", count), &count, |b, _| {
            b.iter(|| {
                sequence = sequence.wrapping_add(1);
                for (node_id, position) in &nodes {
                    mixer
                        .store()
                        .upsert_avatar_data(*node_id, pose.clone(), sequence, Some(*position));
                }
                black_box(mixer.broadcast(0.0));
            })
        });
    }
    group.finish();
}

/// Same pass with a throttled budget, so most listeners truncate
fn bench_broadcast_throttled(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast_throttled");
    group.sample_size(30);
    let pose = Bytes::from(vec![0xA5u8; POSE_BYTES]);

    for count in [100, 250, 500] {
        let (mixer, nodes) = create_mixer(count, 1000.0);
        let mut sequence: u16 = 0;

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("ratio_0.9", count), &count, |b, _| {
            b.iter(|| {
                sequence = sequence.wrapping_add(1);
                for (node_id, position) in &nodes {
                    mixer
                        .store()
                        .upsert_avatar_data(*node_id, pose.clone(), sequence, Some(*position));
                }
                black_box(mixer.broadcast(0.9));
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_broadcast, bench_broadcast_throttled);
criterion_main!(benches);
