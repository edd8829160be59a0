//! Per-listener avatar selection under a bandwidth budget
//!
//! For every listener the mixer orders the other avatars by relevance and
//! packs the longest prefix of that order that fits the listener's byte
//! budget for one tick. Composition runs in parallel across listeners;
//! delivery is sequential and records what each listener actually received.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rayon::prelude::*;
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::config::MixerSettings;
use crate::mixer::constants::bandwidth;
use crate::mixer::sequence::{sequence_gap, SequenceNumber};
use crate::mixer::session::{NodeId, SentRecord};
use crate::mixer::stats::ListenerMixCounts;
use crate::mixer::store::{NodeStore, SessionHandle, SessionSnapshot};
use crate::net::connection::PacketSender;
use crate::net::protocol::{self, AvatarRecord, EncodeError, MixerPacket};

/// Another avatar eligible for a listener's payload
#[derive(Debug, Clone, Copy)]
struct Candidate {
    index: usize,
    node_id: NodeId,
    age_frames: u64,
    distance_sq: Option<f32>,
    sequence: SequenceNumber,
    include_identity: bool,
    previous: SentRecord,
}

thread_local! {
    /// Reused per rayon worker to avoid a candidate allocation per listener
    static CANDIDATE_BUFFER: RefCell<Vec<Candidate>> = RefCell::new(Vec::with_capacity(256));
}

/// Ascending: fresher pose, then nearer (unknown last), then lower id
fn priority(a: &Candidate, b: &Candidate) -> Ordering {
    a.age_frames
        .cmp(&b.age_frames)
        .then_with(|| match (a.distance_sq, b.distance_sq) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.node_id.cmp(&b.node_id))
}

/// Bytes a listener may receive in one tick
pub fn budget_bytes(max_kbps: f32, tick_interval: Duration, throttling_ratio: f32) -> usize {
    let bytes_per_sec = max_kbps as f64 * bandwidth::BITS_PER_KILOBIT / bandwidth::BITS_PER_BYTE;
    let scale = (1.0 - throttling_ratio as f64).clamp(0.0, 1.0);
    (bytes_per_sec * tick_interval.as_secs_f64() * scale).floor().max(0.0) as usize
}

/// Effective per-listener cap in bits per second
pub fn budget_bps(max_kbps: f32, throttling_ratio: f32) -> f64 {
    max_kbps as f64 * bandwidth::BITS_PER_KILOBIT * (1.0 - throttling_ratio as f64).clamp(0.0, 1.0)
}

/// Encoded payload for one listener, awaiting delivery
#[derive(Debug)]
pub struct ComposedPayload {
    pub listener: NodeId,
    handle: SessionHandle,
    /// `None` when nothing was selected
    pub buffer: Option<Vec<u8>>,
    /// Send records to store once the buffer is handed off
    sent: SmallVec<[(NodeId, SentRecord); 8]>,
    pub counts: ListenerMixCounts,
}

/// Outcome of one broadcast pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub frame: u64,
    pub listeners: usize,
    pub payloads_sent: usize,
    pub send_failures: usize,
    pub bytes_sent: usize,
    pub avatars_sent: usize,
    pub avatars_over_budget: usize,
}

pub struct Mixer {
    store: Arc<NodeStore>,
    sender: Arc<dyn PacketSender>,
    settings: Arc<MixerSettings>,
    tick_interval: Duration,
    /// Encoded size of an empty bulk packet
    envelope_overhead: usize,
}

impl Mixer {
    pub fn new(
        store: Arc<NodeStore>,
        sender: Arc<dyn PacketSender>,
        settings: Arc<MixerSettings>,
        tick_interval: Duration,
    ) -> Result<Self, EncodeError> {
        let envelope_overhead =
            protocol::encoded_size(&MixerPacket::BulkAvatarData { records: Vec::new() })?;
        Ok(Self {
            store,
            sender,
            settings,
            tick_interval,
            envelope_overhead,
        })
    }

    pub fn store(&self) -> &Arc<NodeStore> {
        &self.store
    }

    pub fn settings(&self) -> &Arc<MixerSettings> {
        &self.settings
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Run one full pass: advance the frame, compose and deliver
    pub fn broadcast(&self, throttling_ratio: f32) -> TickReport {
        let frame = self.store.advance_frame();
        let payloads = self.compose_all(frame, throttling_ratio);
        let mut report = self.deliver(payloads, throttling_ratio);
        report.frame = frame;
        report
    }

    /// Compose every listener's payload in parallel
    pub fn compose_all(&self, frame: u64, throttling_ratio: f32) -> Vec<ComposedPayload> {
        let snapshots = self.store.snapshot();
        let budget = budget_bytes(
            self.settings.max_kbps_per_node(),
            self.tick_interval,
            throttling_ratio,
        );

        snapshots
            .par_iter()
            .filter(|listener| !listener.incompatible)
            .filter_map(|listener| match self.compose(listener, &snapshots, frame, budget) {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!("Failed to compose payload for {}: {}", listener.node_id, e);
                    None
                }
            })
            .collect()
    }

    fn compose(
        &self,
        listener: &SessionSnapshot,
        all: &[SessionSnapshot],
        frame: u64,
        budget: usize,
    ) -> Result<ComposedPayload, EncodeError> {
        CANDIDATE_BUFFER.with(|buffer| {
            let mut candidates = buffer.borrow_mut();
            candidates.clear();

            let mut counts = ListenerMixCounts::default();
            let listener_position = listener.avatar.as_ref().and_then(|a| a.position);

            for (index, other) in all.iter().enumerate() {
                if other.node_id == listener.node_id
                    || other.incompatible
                    || listener.mutually_ignored(other)
                {
                    continue;
                }
                let Some(avatar) = &other.avatar else {
                    continue;
                };

                let previous = listener.sent.get(&other.node_id).copied().unwrap_or_default();
                let pose_changed = previous.sequence != Some(avatar.sequence);
                let include_identity =
                    other.identity.is_some() && other.identity_version > previous.identity_version;
                if !pose_changed && !include_identity {
                    counts.held_back += 1;
                    continue;
                }

                let distance_sq = match (listener_position, avatar.position) {
                    (Some(a), Some(b)) => Some(a.distance_sq(&b)),
                    _ => None,
                };

                candidates.push(Candidate {
                    index,
                    node_id: other.node_id,
                    age_frames: frame.saturating_sub(avatar.received_frame),
                    distance_sq,
                    sequence: avatar.sequence,
                    include_identity,
                    previous,
                });
            }

            candidates.sort_unstable_by(priority);

            let mut records = Vec::new();
            let mut sent = SmallVec::new();
            let mut total = self.envelope_overhead;

            for (position, candidate) in candidates.iter().enumerate() {
                let other = &all[candidate.index];
                let Some(avatar) = &other.avatar else {
                    continue;
                };
                let record = AvatarRecord {
                    node_id: candidate.node_id,
                    sequence: candidate.sequence,
                    data: avatar.data.clone(),
                    identity: if candidate.include_identity {
                        other.identity.as_deref().cloned()
                    } else {
                        None
                    },
                };

                let size = protocol::encoded_size(&record)?;
                if total + size > budget {
                    counts.over_budget = candidates.len() - position;
                    break;
                }
                total += size;

                if let Some(previous_sequence) = candidate.previous.sequence {
                    if sequence_gap(previous_sequence, candidate.sequence) > 1 {
                        counts.skipped_frames += 1;
                    }
                }
                if candidate.include_identity {
                    counts.identities += 1;
                }

                sent.push((
                    candidate.node_id,
                    SentRecord {
                        sequence: Some(candidate.sequence),
                        identity_version: if candidate.include_identity {
                            other.identity_version
                        } else {
                            candidate.previous.identity_version
                        },
                        frame,
                    },
                ));
                records.push(record);
            }

            counts.sent = records.len();
            let buffer = if records.is_empty() {
                None
            } else {
                let encoded = protocol::encode(&MixerPacket::BulkAvatarData { records })?;
                debug_assert_eq!(encoded.len(), total);
                debug_assert!(encoded.len() <= budget);
                counts.bytes = encoded.len();
                Some(encoded)
            };

            Ok(ComposedPayload {
                listener: listener.node_id,
                handle: listener.handle.clone(),
                buffer,
                sent,
                counts,
            })
        })
    }

    /// Hand composed payloads to the connection layer, one listener at a time
    pub fn deliver(&self, payloads: Vec<ComposedPayload>, throttling_ratio: f32) -> TickReport {
        let stats = self.store.stats().clone();
        let budget_bps = budget_bps(self.settings.max_kbps_per_node(), throttling_ratio);

        // Membership stays fixed while payloads are queued, so a kill
        // notification for a removed node is always queued after them
        self.store.with_membership(|members| {
            let mut report = TickReport::default();

            for payload in payloads {
                if !members.contains(&payload.listener) {
                    continue;
                }

                let mut session = payload.handle.lock();
                if session.is_removed() {
                    continue;
                }
                session.bandwidth_budget_bps = budget_bps;
                report.listeners += 1;
                stats.record_listener();

                let mut counts = payload.counts;
                let stale = payload
                    .sent
                    .iter()
                    .any(|(id, _)| !members.contains(id) || session.excludes(id));

                let delivered = match payload.buffer {
                    Some(_) if stale => {
                        debug!("Payload for {} referenced a departed avatar, retrying next tick", payload.listener);
                        false
                    }
                    Some(buffer) => match self.sender.send(payload.listener, buffer) {
                        Ok(()) => true,
                        Err(e) => {
                            debug!("Payload for {} not sent: {}", payload.listener, e);
                            report.send_failures += 1;
                            false
                        }
                    },
                    None => false,
                };

                if delivered {
                    for (sender_id, record) in payload.sent {
                        session.record_sent(sender_id, record);
                    }
                    report.payloads_sent += 1;
                } else {
                    counts.sent = 0;
                    counts.identities = 0;
                    counts.skipped_frames = 0;
                    counts.bytes = 0;
                }

                session.last_broadcast_bytes_sent = counts.bytes;
                session.total_bytes_sent += counts.bytes as u64;
                session.avatars_sent_last_frame = counts.sent;
                session.avatars_over_budget_last_frame = counts.over_budget;
                drop(session);

                report.bytes_sent += counts.bytes;
                report.avatars_sent += counts.sent;
                report.avatars_over_budget += counts.over_budget;
                stats.record_mix(&counts);
            }

            report
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixer::stats::BroadcastStats;
    use crate::mixer::testing::RecordingSender;
    use crate::net::protocol::{IdentityInfo, Position};
    use bytes::Bytes;
    use proptest::prelude::*;
    use uuid::Uuid;

    const TICK: Duration = Duration::from_millis(100);

    fn setup(max_kbps: f32) -> (Arc<NodeStore>, Arc<RecordingSender>, Mixer) {
        let store = Arc::new(NodeStore::new(Arc::new(BroadcastStats::new())));
        let sender = Arc::new(RecordingSender::new());
        let mixer = Mixer::new(
            store.clone(),
            sender.clone(),
            Arc::new(MixerSettings::new(max_kbps)),
            TICK,
        )
        .unwrap();
        (store, sender, mixer)
    }

    fn pose(len: usize) -> Bytes {
        Bytes::from(vec![0xAB; len])
    }

    fn ids(records: &[AvatarRecord]) -> Vec<NodeId> {
        records.iter().map(|r| r.node_id).collect()
    }

    fn record_size(len: usize) -> usize {
        protocol::encoded_size(&AvatarRecord {
            node_id: Uuid::nil(),
            sequence: 0,
            data: pose(len),
            identity: None,
        })
        .unwrap()
    }

    /// Cap whose per-tick budget floors to exactly `bytes`
    fn kbps_for_bytes(bytes: usize) -> f32 {
        (bytes as f32 + 0.5) * 8.0 / 1000.0 / TICK.as_secs_f32()
    }

    fn overhead() -> usize {
        protocol::encoded_size(&MixerPacket::BulkAvatarData { records: Vec::new() }).unwrap()
    }

    #[test]
    fn test_budget_bytes() {
        // 8 kbps over 100ms is 100 bytes
        assert_eq!(budget_bytes(8.0, TICK, 0.0), 100);
        assert_eq!(budget_bytes(8.0, TICK, 0.5), 50);
        assert_eq!(budget_bytes(8.0, TICK, 1.0), 0);
        assert_eq!(budget_bps(1000.0, 0.25), 750_000.0);
    }

    #[test]
    fn test_two_sessions_see_each_other() {
        let (store, sender, mixer) = setup(1000.0);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        store.upsert_avatar_data(a, pose(10), 1, None);
        store.upsert_avatar_data(b, pose(20), 1, None);

        let report = mixer.broadcast(0.0);
        assert_eq!(report.listeners, 2);
        assert_eq!(report.payloads_sent, 2);

        let to_a = sender.bulk_records_for(a);
        let to_b = sender.bulk_records_for(b);
        assert_eq!(to_a.len(), 1);
        assert_eq!(ids(&to_a[0]), vec![b]);
        assert_eq!(to_a[0][0].data, pose(20));
        assert_eq!(ids(&to_b[0]), vec![a]);

        let sent_to_a = sender.payloads_for(a)[0].len() as u64;
        assert_eq!(store.get(&a).unwrap().lock().total_bytes_sent, sent_to_a);
        assert_eq!(store.get(&a).unwrap().lock().last_broadcast_bytes_sent as u64, sent_to_a);

        let stats = store.stats().drain();
        assert_eq!(stats.num_listeners, 2);
        assert_eq!(stats.avatars_sent, 2);
    }

    #[test]
    fn test_ignore_suppresses_both_directions() {
        let (store, sender, mixer) = setup(1000.0);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        for node in [a, b, c] {
            store.upsert_avatar_data(node, pose(8), 1, None);
        }
        store.add_ignore(a, b, false);

        mixer.broadcast(0.0);

        assert_eq!(ids(&sender.bulk_records_for(a)[0]), vec![c]);
        assert_eq!(ids(&sender.bulk_records_for(b)[0]), vec![c]);
        let mut to_c = ids(&sender.bulk_records_for(c)[0]);
        to_c.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(to_c, expected);
    }

    #[test]
    fn test_unchanged_avatar_held_back() {
        let (store, sender, mixer) = setup(1000.0);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        store.upsert_avatar_data(a, pose(8), 1, None);
        store.upsert_avatar_data(b, pose(8), 1, None);

        mixer.broadcast(0.0);
        sender.clear();
        store.stats().drain();

        let report = mixer.broadcast(0.0);
        assert_eq!(report.payloads_sent, 0);
        assert!(sender.bulk_records_for(a).is_empty());
        assert_eq!(store.stats().drain().avatars_held_back, 2);

        store.upsert_avatar_data(a, pose(8), 2, None);
        mixer.broadcast(0.0);
        assert_eq!(ids(&sender.bulk_records_for(b)[0]), vec![a]);
        assert!(sender.bulk_records_for(a).is_empty());
    }

    #[test]
    fn test_identity_sent_only_when_changed() {
        let (store, sender, mixer) = setup(1000.0);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let ada = IdentityInfo {
            display_name: "Ada".to_string(),
            skeleton_model_url: String::new(),
        };
        store.upsert_avatar_data(a, pose(8), 1, None);
        store.upsert_identity(a, ada.clone());
        store.connect(b);

        mixer.broadcast(0.0);
        assert_eq!(sender.bulk_records_for(b)[0][0].identity, Some(ada.clone()));

        sender.clear();
        store.upsert_avatar_data(a, pose(8), 2, None);
        store.upsert_identity(a, ada);
        mixer.broadcast(0.0);
        assert_eq!(sender.bulk_records_for(b)[0][0].identity, None);

        sender.clear();
        let grace = IdentityInfo {
            display_name: "Grace".to_string(),
            skeleton_model_url: String::new(),
        };
        store.upsert_identity(a, grace.clone());
        mixer.broadcast(0.0);
        let records = sender.bulk_records_for(b);
        assert_eq!(records[0][0].identity, Some(grace));
        assert_eq!(records[0][0].sequence, 2);
    }

    #[test]
    fn test_failed_send_retried() {
        let (store, sender, mixer) = setup(1000.0);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        store.upsert_avatar_data(a, pose(8), 1, None);
        store.upsert_identity(a, IdentityInfo::default());
        store.connect(b);

        sender.fail_for(b);
        let report = mixer.broadcast(0.0);
        assert_eq!(report.send_failures, 1);
        assert_eq!(store.stats().drain().avatars_sent, 0);

        sender.heal(b);
        mixer.broadcast(0.0);
        let records = sender.bulk_records_for(b);
        assert_eq!(records.len(), 1);
        assert!(records[0][0].identity.is_some());
    }

    #[test]
    fn test_removed_avatar_omitted() {
        let (store, sender, mixer) = setup(1000.0);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        for node in [a, b, c] {
            store.upsert_avatar_data(node, pose(8), 1, None);
        }
        store.remove(&a);

        mixer.broadcast(0.0);
        assert_eq!(ids(&sender.bulk_records_for(b)[0]), vec![c]);
        assert_eq!(ids(&sender.bulk_records_for(c)[0]), vec![b]);
        assert!(sender.bulk_records_for(a).is_empty());
    }

    #[test]
    fn test_removal_between_compose_and_deliver() {
        let (store, sender, mixer) = setup(1000.0);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        for node in [a, b, c] {
            store.upsert_avatar_data(node, pose(8), 1, None);
        }

        let frame = store.advance_frame();
        let payloads = mixer.compose_all(frame, 0.0);
        store.remove(&a);
        let report = mixer.deliver(payloads, 0.0);

        // a is no longer a listener and b, c payloads still referenced a
        assert_eq!(report.listeners, 2);
        assert_eq!(report.payloads_sent, 0);
        assert!(sender.bulk_records_for(a).is_empty());

        mixer.broadcast(0.0);
        assert_eq!(ids(&sender.bulk_records_for(b)[0]), vec![c]);
    }

    #[test]
    fn test_one_way_ignore_between_compose_and_deliver() {
        let (store, sender, mixer) = setup(1000.0);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        store.upsert_avatar_data(a, pose(8), 1, None);
        store.upsert_avatar_data(b, pose(8), 1, None);

        let frame = store.advance_frame();
        let payloads = mixer.compose_all(frame, 0.0);
        store.add_ignore(a, b, false);
        let report = mixer.deliver(payloads, 0.0);

        // Neither side may receive the other once the ignore is recorded
        assert_eq!(report.payloads_sent, 0);
        assert!(sender.bulk_records_for(a).is_empty());
        assert!(sender.bulk_records_for(b).is_empty());

        store.remove_ignore(a, b, false);
        mixer.broadcast(0.0);
        assert_eq!(ids(&sender.bulk_records_for(b)[0]), vec![a]);
    }

    #[test]
    fn test_order_falls_back_to_id() {
        let size = record_size(8);
        // Room for exactly two records
        let kbps = kbps_for_bytes(overhead() + 2 * size);
        let (store, sender, mixer) = setup(kbps);

        let listener = Uuid::new_v4();
        store.connect(listener);
        let mut others: Vec<NodeId> = (0..5).map(|_| Uuid::new_v4()).collect();
        for node in &others {
            store.upsert_avatar_data(*node, pose(8), 1, None);
        }
        others.sort();

        mixer.broadcast(0.0);
        let records = sender.bulk_records_for(listener);
        assert_eq!(ids(&records[0]), others[..2].to_vec());
    }

    #[test]
    fn test_nearer_avatars_first() {
        let (store, sender, mixer) = setup(1000.0);
        let listener = Uuid::new_v4();
        let (near, mid, far, unknown) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        store.upsert_avatar_data(listener, pose(8), 1, Some(Position::new(0.0, 0.0, 0.0)));
        store.upsert_avatar_data(far, pose(8), 1, Some(Position::new(30.0, 0.0, 0.0)));
        store.upsert_avatar_data(unknown, pose(8), 1, None);
        store.upsert_avatar_data(near, pose(8), 1, Some(Position::new(1.0, 0.0, 0.0)));
        store.upsert_avatar_data(mid, pose(8), 1, Some(Position::new(0.0, 5.0, 0.0)));

        mixer.broadcast(0.0);
        assert_eq!(ids(&sender.bulk_records_for(listener)[0]), vec![near, mid, far, unknown]);
    }

    #[test]
    fn test_fresher_avatars_first() {
        let (store, sender, mixer) = setup(1000.0);
        let listener = Uuid::new_v4();
        let (old, fresh) = (Uuid::new_v4(), Uuid::new_v4());
        store.connect(listener);
        store.upsert_avatar_data(old, pose(8), 1, Some(Position::new(1.0, 0.0, 0.0)));
        store.advance_frame();
        store.advance_frame();
        store.upsert_avatar_data(fresh, pose(8), 1, Some(Position::new(50.0, 0.0, 0.0)));

        mixer.broadcast(0.0);
        assert_eq!(ids(&sender.bulk_records_for(listener)[0]), vec![fresh, old]);
    }

    #[test]
    fn test_throttling_shrinks_payload() {
        let size = record_size(50);
        let kbps = kbps_for_bytes(overhead() + 10 * size);
        let (store, sender, mixer) = setup(kbps);

        let listener = Uuid::new_v4();
        store.connect(listener);
        for _ in 0..10 {
            store.upsert_avatar_data(Uuid::new_v4(), pose(50), 1, None);
        }

        let frame = store.advance_frame();
        let full = mixer.compose_all(frame, 0.0);
        let throttled = mixer.compose_all(frame, 0.5);
        let count = |payloads: &[ComposedPayload]| {
            payloads
                .iter()
                .find(|p| p.listener == listener)
                .map(|p| p.counts.sent)
                .unwrap()
        };

        assert_eq!(count(&full), 10);
        let budget = budget_bytes(kbps, TICK, 0.5);
        assert_eq!(count(&throttled), (budget - overhead()) / size);
        assert!(count(&throttled) < 10);
        assert!(sender.bulk_records_for(listener).is_empty());
    }

    #[test]
    fn test_incompatible_session_neither_listens_nor_mixed() {
        let (store, sender, mixer) = setup(1000.0);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        store.upsert_avatar_data(a, pose(8), 1, None);
        store.upsert_avatar_data(b, pose(8), 1, None);
        store.mark_incompatible(b);

        let report = mixer.broadcast(0.0);
        assert_eq!(report.listeners, 1);
        assert!(sender.bulk_records_for(a).is_empty());
        assert!(sender.bulk_records_for(b).is_empty());
    }

    proptest! {
        #[test]
        fn prop_payload_is_budget_prefix(
            sizes in prop::collection::vec(0usize..300, 1..20),
            kbps in 1u32..200,
        ) {
            let (store, sender, mixer) = setup(kbps as f32);
            let listener = Uuid::new_v4();
            store.connect(listener);

            let mut senders: Vec<(NodeId, usize)> =
                sizes.iter().map(|size| (Uuid::new_v4(), *size)).collect();
            for (node, size) in &senders {
                store.upsert_avatar_data(*node, pose(*size), 1, None);
            }
            senders.sort();

            mixer.broadcast(0.0);

            let budget = budget_bytes(kbps as f32, TICK, 0.0);
            let payloads = sender.payloads_for(listener);
            let included = match payloads.first() {
                Some(payload) => {
                    prop_assert!(payload.len() <= budget);
                    match protocol::decode::<MixerPacket>(payload).unwrap() {
                        MixerPacket::BulkAvatarData { records } => ids(&records),
                        other => panic!("unexpected packet {:?}", other),
                    }
                }
                None => Vec::new(),
            };

            let expected: Vec<NodeId> = senders.iter().take(included.len()).map(|(id, _)| *id).collect();
            prop_assert_eq!(&included, &expected);

            if included.len() < senders.len() {
                let with_next: usize = overhead()
                    + senders[..=included.len()].iter().map(|(_, size)| record_size(*size)).sum::<usize>();
                prop_assert!(with_next > budget);
            }
        }
    }
}
