//! Producer/consumer bookkeeping
//!
//! Consumers are keyed by consumer id and carry their owning participant and
//! quality statistics. Producers are keyed by application tag. An entry is
//! present exactly while its track is deliverable: closing a transport clears
//! everything bound to it.

use crate::identity::PeerId;
use crate::media::{parse_scalability_mode, scalability_mode_of, Consumer, MediaTrack, Producer};
use crate::pending::TrackSource;
use crate::types::{ConsumerStats, MediaKind, ProducerTag};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

struct ConsumerEntry {
    consumer: Arc<dyn Consumer>,
    peer: PeerId,
    stats: ConsumerStats,
}

#[derive(Default)]
struct RegistryState {
    consumers: HashMap<String, ConsumerEntry>,
    producers: HashMap<ProducerTag, Arc<dyn Producer>>,
    downlink_bwe: Option<Value>,
    blocked: HashSet<PeerId>,
}

/// Registry of local producers, remote consumers and blocked participants
#[derive(Default)]
pub struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a consumer for `peer`. Video consumers get their layer counts
    /// from the scalability mode of their first encoding.
    pub fn add_consumer(&self, peer: PeerId, consumer: Arc<dyn Consumer>) {
        let mut stats = ConsumerStats::default();
        if consumer.track().kind() == MediaKind::Video {
            let mode = parse_scalability_mode(scalability_mode_of(consumer.rtp_parameters()));
            stats.spatial_layers = Some(mode.spatial_layers);
            stats.temporal_layers = Some(mode.temporal_layers);
        }
        let id = consumer.id().to_string();
        tracing::debug!(consumer_id = %id, peer = %peer, "Consumer added");
        let previous = self.state.lock().consumers.insert(
            id,
            ConsumerEntry {
                consumer,
                peer,
                stats,
            },
        );
        if let Some(previous) = previous {
            previous.consumer.close();
        }
    }

    /// Close and remove a consumer. Returns its participant, or `None` for
    /// an unknown id.
    pub fn remove_consumer(&self, consumer_id: &str) -> Option<PeerId> {
        let entry = self.state.lock().consumers.remove(consumer_id);
        match entry {
            Some(entry) => {
                entry.consumer.close();
                Some(entry.peer)
            }
            None => {
                tracing::info!(consumer_id, "Consumer close for unknown consumer");
                None
            }
        }
    }

    /// Close and remove every consumer of `peer`
    pub fn remove_peer_consumers(&self, peer: &PeerId) -> usize {
        let removed: Vec<ConsumerEntry> = {
            let mut state = self.state.lock();
            let ids: Vec<String> = state
                .consumers
                .iter()
                .filter(|(_, entry)| &entry.peer == peer)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| state.consumers.remove(id))
                .collect()
        };
        for entry in &removed {
            entry.consumer.close();
        }
        removed.len()
    }

    /// Close and remove every consumer
    pub fn clear_consumers(&self) -> usize {
        let drained: Vec<ConsumerEntry> = self.state.lock().consumers.drain().map(|(_, e)| e).collect();
        for entry in &drained {
            entry.consumer.close();
        }
        drained.len()
    }

    /// Record the forwarded layers of a consumer. Unknown ids are logged and
    /// dropped.
    pub fn update_layers(&self, consumer_id: &str, spatial: Option<u8>, temporal: Option<u8>) -> bool {
        self.update_stats(consumer_id, "consumerLayersChanged", |stats| {
            stats.spatial_layer = spatial;
            stats.temporal_layer = temporal;
        })
    }

    /// Record the quality score of a consumer. Unknown ids are logged and
    /// dropped.
    pub fn update_score(&self, consumer_id: &str, score: Value) -> bool {
        self.update_stats(consumer_id, "consumerScore", |stats| stats.score = Some(score))
    }

    fn update_stats(&self, consumer_id: &str, event: &str, apply: impl FnOnce(&mut ConsumerStats)) -> bool {
        let mut state = self.state.lock();
        match state.consumers.get_mut(consumer_id) {
            Some(entry) => {
                apply(&mut entry.stats);
                true
            }
            None => {
                tracing::info!(consumer_id, event, "Stats for unknown consumer dropped");
                false
            }
        }
    }

    /// Snapshot of consumer stats keyed by consumer id
    #[must_use]
    pub fn consumer_stats(&self) -> HashMap<String, ConsumerStats> {
        self.state
            .lock()
            .consumers
            .iter()
            .map(|(id, entry)| (id.clone(), entry.stats.clone()))
            .collect()
    }

    /// Ids of every live consumer
    #[must_use]
    pub fn consumer_ids(&self) -> Vec<String> {
        self.state.lock().consumers.keys().cloned().collect()
    }

    /// Whether a consumer with `consumer_id` is registered
    #[must_use]
    pub fn has_consumer(&self, consumer_id: &str) -> bool {
        self.state.lock().consumers.contains_key(consumer_id)
    }

    /// Store a producer under `tag`, closing any producer it replaces
    pub fn set_producer(&self, tag: ProducerTag, producer: Arc<dyn Producer>) {
        tracing::debug!(producer_id = producer.id(), tag = ?tag, "Producer added");
        if let Some(previous) = self.state.lock().producers.insert(tag, producer) {
            previous.close();
        }
    }

    /// Remove the producer under `tag` without closing it
    pub fn take_producer(&self, tag: ProducerTag) -> Option<Arc<dyn Producer>> {
        self.state.lock().producers.remove(&tag)
    }

    /// Open producer under `tag`
    #[must_use]
    pub fn producer(&self, tag: ProducerTag) -> Option<Arc<dyn Producer>> {
        self.state
            .lock()
            .producers
            .get(&tag)
            .filter(|p| !p.is_closed())
            .cloned()
    }

    /// Ids of every producer
    #[must_use]
    pub fn producer_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .producers
            .values()
            .map(|p| p.id().to_string())
            .collect()
    }

    /// Close and drop every producer
    pub fn clear_producers(&self) -> usize {
        let drained: Vec<_> = self.state.lock().producers.drain().map(|(_, p)| p).collect();
        for producer in &drained {
            producer.close();
        }
        drained.len()
    }

    /// Store the latest downlink bandwidth estimate
    pub fn set_downlink_bwe(&self, bwe: Value) {
        self.state.lock().downlink_bwe = Some(bwe);
    }

    /// Latest downlink bandwidth estimate
    #[must_use]
    pub fn downlink_bwe(&self) -> Option<Value> {
        self.state.lock().downlink_bwe.clone()
    }

    /// Mark `peer` as blocked
    pub fn block(&self, peer: PeerId) {
        self.state.lock().blocked.insert(peer);
    }

    /// Remove `peer` from the blocked set
    pub fn unblock(&self, peer: &PeerId) -> bool {
        self.state.lock().blocked.remove(peer)
    }

    /// Whether `peer` is blocked
    #[must_use]
    pub fn is_blocked(&self, peer: &PeerId) -> bool {
        self.state.lock().blocked.contains(peer)
    }

    /// Currently blocked participants
    #[must_use]
    pub fn blocked(&self) -> HashSet<PeerId> {
        self.state.lock().blocked.clone()
    }
}

impl TrackSource for Registry {
    fn lookup_track(&self, peer: &PeerId, kind: MediaKind) -> Option<MediaTrack> {
        self.state
            .lock()
            .consumers
            .values()
            .filter(|entry| &entry.peer == peer && !entry.consumer.is_closed())
            .map(|entry| entry.consumer.track())
            .find(|track| track.kind() == kind)
            .cloned()
    }
}
