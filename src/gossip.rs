//! # Gossip Dissemination Engine
//!
//! Epidemic broadcast over the directly connected peers, with at-most-once
//! local processing per logical message.
//!
//! ## Receive Pipeline
//!
//! ```text
//! banished? -> byte cap -> decode -> Arbiter digest -> age window
//!           -> dedup -> deliver -> hops > 0? -> damping -> forward
//! ```
//!
//! ## Damping
//!
//! Forwarding probability falls as the local neighborhood grows:
//!
//! ```text
//! rate = topic_rate ^ max(1, connected / ponderation_factor)
//! ```
//!
//! Below `damping_min_neighbors` connections every neighbor is forwarded to,
//! so sparse meshes stay connected.
//!
//! ## Deduplication
//!
//! Messages are keyed by a 32-bit content hash of
//! `sender || topic || data`. The timestamp is not part of the key, so
//! identical content re-sent inside the retention window is suppressed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand::rngs::StdRng;
use tracing::{debug, trace};

use crate::arbiter::{Admission, Arbiter, Inbound, TrafficKind};
use crate::codec::{Codec, DecodeError, EncodeError};
use crate::identity::PeerId;
use crate::messages::{GossipMessage, MessageData};
use crate::node::ConfigError;
use crate::protocols::Transport;

/// Messages whose claimed timestamp is older than this are dropped.
pub const DEFAULT_MESSAGE_EXPIRATION: Duration = Duration::from_secs(60);

/// How long an accepted message stays in the dedup cache.
pub const DEFAULT_CACHE_RETENTION: Duration = Duration::from_secs(120);

/// Tolerated clock skew for timestamps in the future.
pub const DEFAULT_MAX_FUTURE_SKEW: Duration = Duration::from_secs(30);

/// Dedup cache cleanup runs once per this many insertions.
pub const DEFAULT_CLEANUP_INTERVAL: usize = 100;

pub const DEFAULT_PONDERATION_FACTOR: f64 = 4.0;

/// Below this many connected peers, damping is skipped.
pub const DEFAULT_DAMPING_MIN_NEIGHBORS: usize = 4;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct GossipConfig {
    pub message_expiration: Duration,
    pub cache_retention: Duration,
    pub max_future_skew: Duration,
    pub cleanup_interval: usize,
    pub ponderation_factor: f64,
    pub damping_min_neighbors: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            message_expiration: DEFAULT_MESSAGE_EXPIRATION,
            cache_retention: DEFAULT_CACHE_RETENTION,
            max_future_skew: DEFAULT_MAX_FUTURE_SKEW,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            ponderation_factor: DEFAULT_PONDERATION_FACTOR,
            damping_min_neighbors: DEFAULT_DAMPING_MIN_NEIGHBORS,
        }
    }
}

impl GossipConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_retention < self.message_expiration {
            return Err(ConfigError::new("cache_retention must be at least message_expiration"));
        }
        if self.cleanup_interval == 0 {
            return Err(ConfigError::new("cleanup_interval must be positive"));
        }
        if !(self.ponderation_factor > 0.0) {
            return Err(ConfigError::new("ponderation_factor must be positive"));
        }
        Ok(())
    }
}

// ============================================================================
// Dedup Cache
// ============================================================================

/// 32-bit content key of a gossip message.
pub fn content_hash(sender: &PeerId, topic: &str, data: &MessageData) -> u32 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(sender.as_str().as_bytes());
    hasher.update(topic.as_bytes());
    hasher.update(&[0, data.type_code()]);
    hasher.update(&data.to_bytes());
    let digest = hasher.finalize();
    let bytes = digest.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Append-only log of sightings plus a hash -> expiry index.
///
/// Entries are pushed in time order, so pruning is a prefix trim.
#[derive(Debug)]
pub struct DedupCache {
    order: VecDeque<(u32, u64)>,
    expirations: HashMap<u32, u64>,
    retention_ms: u64,
    cleanup_interval: usize,
    inserts_since_cleanup: usize,
}

impl DedupCache {
    pub fn new(retention: Duration, cleanup_interval: usize) -> Self {
        Self {
            order: VecDeque::new(),
            expirations: HashMap::new(),
            retention_ms: retention.as_millis() as u64,
            cleanup_interval: cleanup_interval.max(1),
            inserts_since_cleanup: 0,
        }
    }

    /// Record a sighting. Returns `false` if the key is already live.
    pub fn insert(&mut self, hash: u32, now_ms: u64) -> bool {
        if let Some(expires) = self.expirations.get(&hash)
            && *expires > now_ms
        {
            return false;
        }
        let expires = now_ms.saturating_add(self.retention_ms);
        self.expirations.insert(hash, expires);
        self.order.push_back((hash, expires));

        self.inserts_since_cleanup += 1;
        if self.inserts_since_cleanup >= self.cleanup_interval {
            self.cleanup(now_ms);
        }
        true
    }

    pub fn contains(&self, hash: u32, now_ms: u64) -> bool {
        self.expirations.get(&hash).is_some_and(|expires| *expires > now_ms)
    }

    /// Drop every entry whose retention has elapsed.
    pub fn cleanup(&mut self, now_ms: u64) {
        self.inserts_since_cleanup = 0;
        while let Some(&(hash, expires)) = self.order.front() {
            if expires > now_ms {
                break;
            }
            self.order.pop_front();
            // A later re-insert owns the index entry; leave it alone.
            if self.expirations.get(&hash) == Some(&expires) {
                self.expirations.remove(&hash);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.expirations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expirations.is_empty()
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Result of [`GossipEngine::handle_incoming`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GossipOutcome {
    /// Immediate sender is banished.
    Banished,
    /// Immediate sender exceeded its byte cap.
    Flood,
    /// Frame did not decode. Not penalised here.
    Malformed(DecodeError),
    Rejected(Admission),
    /// Claimed timestamp outside the accepted window.
    Expired,
    Duplicate,
    Delivered { forwarded: usize },
}

pub type GossipCallback = Box<dyn FnMut(&GossipMessage) + Send>;

pub struct GossipEngine<T: Transport> {
    codec: Arc<Codec>,
    transport: Arc<T>,
    config: GossipConfig,
    cache: DedupCache,
    topic_subscribers: HashMap<String, Vec<GossipCallback>>,
    subscribers: Vec<GossipCallback>,
    rng: StdRng,
}

impl<T: Transport> GossipEngine<T> {
    pub fn new(codec: Arc<Codec>, transport: Arc<T>, config: GossipConfig, rng: StdRng) -> Self {
        let cache = DedupCache::new(config.cache_retention, config.cleanup_interval);
        Self {
            codec,
            transport,
            config,
            cache,
            topic_subscribers: HashMap::new(),
            subscribers: Vec::new(),
            rng,
        }
    }

    /// Register a callback for one topic.
    pub fn on_topic<F>(&mut self, topic: impl Into<String>, callback: F)
    where
        F: FnMut(&GossipMessage) + Send + 'static,
    {
        self.topic_subscribers.entry(topic.into()).or_default().push(Box::new(callback));
    }

    /// Register a callback for every delivered gossip message.
    pub fn on_message<F>(&mut self, callback: F)
    where
        F: FnMut(&GossipMessage) + Send + 'static,
    {
        self.subscribers.push(Box::new(callback));
    }

    /// Flood `data` to every connected peer.
    ///
    /// `hops` defaults to the topic's configured budget and never exceeds
    /// it, since receivers reject frames above the topic maximum. Returns
    /// how many peers the frame was handed to.
    pub fn broadcast(
        &mut self,
        topic: &str,
        data: &MessageData,
        hops: Option<u32>,
        now_ms: u64,
    ) -> Result<usize, EncodeError> {
        let default_hops = self
            .codec
            .table()
            .gossip_topic(topic)
            .map(|t| t.hops)
            .ok_or_else(|| EncodeError::UnknownTopic(topic.to_string()))?;
        let max_hops = default_hops as u32;
        let hops = match hops {
            Some(requested) if requested > max_hops => {
                debug!(topic = %topic, requested, max_hops, "capping gossip hops at topic maximum");
                max_hops
            }
            Some(requested) => requested,
            None => max_hops,
        };

        let neighbors = self.transport.connected_peers();
        let frame = self.codec.encode_gossip(topic, data, hops, &neighbors, now_ms)?;
        self.cache.insert(content_hash(self.codec.self_id(), topic, data), now_ms);

        let mut sent = 0;
        for peer in &neighbors {
            match self.transport.send_bytes(peer, &frame) {
                Ok(()) => sent += 1,
                Err(e) => debug!(peer = %peer, error = %e, "gossip send failed"),
            }
        }
        trace!(topic = %topic, hops = hops, peers = sent, "broadcast gossip");
        Ok(sent)
    }

    /// Process a raw gossip frame received from `from`.
    pub fn handle_incoming(
        &mut self,
        arbiter: &mut Arbiter,
        from: &PeerId,
        raw: &[u8],
        now_ms: u64,
    ) -> GossipOutcome {
        if arbiter.is_banished(from) {
            trace!(peer = %from, "dropping gossip from banished peer");
            return GossipOutcome::Banished;
        }
        if !arbiter.count_message_bytes(from, raw.len(), TrafficKind::Gossip) {
            return GossipOutcome::Flood;
        }

        let message = match self.codec.decode_gossip(raw) {
            Ok(message) => message,
            Err(e) => {
                debug!(peer = %from, error = %e, "failed to decode gossip");
                return GossipOutcome::Malformed(e);
            }
        };

        let admission = arbiter.digest_message(from, Inbound::Gossip(&message), raw);
        if !admission.is_accepted() {
            debug!(peer = %from, topic = %message.topic, ?admission, "gossip rejected");
            return GossipOutcome::Rejected(admission);
        }

        if !self.is_fresh(message.timestamp, now_ms) {
            trace!(peer = %from, timestamp = message.timestamp, "gossip outside age window");
            return GossipOutcome::Expired;
        }

        let hash = content_hash(&message.sender_id, &message.topic, &message.data);
        if !self.cache.insert(hash, now_ms) {
            return GossipOutcome::Duplicate;
        }

        self.deliver(&message);

        if message.hops < 1 {
            return GossipOutcome::Delivered { forwarded: 0 };
        }
        let forwarded = self.forward(&message, from, raw);
        GossipOutcome::Delivered { forwarded }
    }

    /// Periodic maintenance.
    pub fn tick(&mut self, now_ms: u64) {
        self.cache.cleanup(now_ms);
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    fn is_fresh(&self, timestamp: u64, now_ms: u64) -> bool {
        let expiration = self.config.message_expiration.as_millis() as u64;
        let skew = self.config.max_future_skew.as_millis() as u64;
        timestamp.saturating_add(expiration) >= now_ms && timestamp <= now_ms.saturating_add(skew)
    }

    fn deliver(&mut self, message: &GossipMessage) {
        if let Some(callbacks) = self.topic_subscribers.get_mut(&message.topic) {
            for callback in callbacks.iter_mut() {
                callback(message);
            }
        }
        for callback in self.subscribers.iter_mut() {
            callback(message);
        }
    }

    fn forward(&mut self, message: &GossipMessage, from: &PeerId, raw: &[u8]) -> usize {
        let connected = self.transport.connected_peers();
        let rate = self.forward_rate(&message.topic, connected.len());
        let frame = Codec::decrement_hops(raw);

        let mut forwarded = 0;
        for peer in connected.iter().filter(|p| *p != from) {
            if rate < 1.0 && !self.rng.gen_bool(rate) {
                continue;
            }
            match self.transport.send_bytes(peer, &frame) {
                Ok(()) => forwarded += 1,
                Err(e) => debug!(peer = %peer, error = %e, "gossip forward failed"),
            }
        }
        trace!(
            topic = %message.topic,
            sender = %message.sender_id.short(),
            rate = rate,
            forwarded = forwarded,
            "relayed gossip"
        );
        forwarded
    }

    fn forward_rate(&self, topic: &str, connected: usize) -> f64 {
        if connected < self.config.damping_min_neighbors {
            return 1.0;
        }
        let base = self
            .codec
            .table()
            .gossip_topic(topic)
            .map_or(1.0, |t| t.transmission_rate);
        let exponent = (connected as f64 / self.config.ponderation_factor).max(1.0);
        base.powf(exponent).clamp(0.0, 1.0)
    }
}

impl<T: Transport> std::fmt::Debug for GossipEngine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipEngine")
            .field("self_id", self.codec.self_id())
            .field("cache_len", &self.cache.len())
            .field("topics", &self.topic_subscribers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::ArbiterConfig;
    use crate::codec::CodecConfig;
    use crate::identity::{IdentityConfig, Keypair, PowConfig};
    use crate::messages::{GossipTopic, ProtocolTable};
    use rand::SeedableRng;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const NOW: u64 = 1_700_000_000_000;

    #[derive(Default)]
    struct RecordingTransport {
        connected: Mutex<Vec<PeerId>>,
        sent: Mutex<Vec<(PeerId, Vec<u8>)>>,
    }

    impl Transport for RecordingTransport {
        fn send_bytes(&self, to: &PeerId, frame: &[u8]) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push((to.clone(), frame.to_vec()));
            Ok(())
        }

        fn connected_peers(&self) -> Vec<PeerId> {
            self.connected.lock().unwrap().clone()
        }
    }

    impl RecordingTransport {
        fn take_sent(&self) -> Vec<(PeerId, Vec<u8>)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    fn identity() -> IdentityConfig {
        IdentityConfig { pow: PowConfig::disabled(), ..IdentityConfig::default() }
    }

    fn codec_with_table(table: ProtocolTable) -> Arc<Codec> {
        Arc::new(Codec::new(Keypair::generate(), identity(), table, CodecConfig::default()))
    }

    fn peer() -> PeerId {
        Keypair::generate().peer_id(&identity())
    }

    struct Fixture {
        engine: GossipEngine<RecordingTransport>,
        transport: Arc<RecordingTransport>,
        arbiter: Arbiter,
        remote: Codec,
    }

    fn fixture_with(table: ProtocolTable, connected: usize) -> Fixture {
        let codec = codec_with_table(table.clone());
        let transport = Arc::new(RecordingTransport::default());
        *transport.connected.lock().unwrap() = (0..connected).map(|_| peer()).collect();
        let arbiter = Arbiter::new(ArbiterConfig::default(), &codec, StdRng::seed_from_u64(1));
        let engine = GossipEngine::new(codec, transport.clone(), GossipConfig::default(), StdRng::seed_from_u64(2));
        let remote = Codec::new(Keypair::generate(), identity(), table, CodecConfig::default());
        Fixture { engine, transport, arbiter, remote }
    }

    fn fixture(connected: usize) -> Fixture {
        fixture_with(ProtocolTable::default(), connected)
    }

    #[test]
    fn dedup_cache_suppresses_and_expires() {
        let mut cache = DedupCache::new(Duration::from_millis(100), 1_000);
        assert!(cache.insert(7, 0));
        assert!(!cache.insert(7, 50));
        assert!(cache.contains(7, 99));
        assert!(!cache.contains(7, 100));
        assert!(cache.insert(7, 100));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn dedup_cleanup_trims_prefix_only() {
        let mut cache = DedupCache::new(Duration::from_millis(100), 1_000);
        cache.insert(1, 0);
        cache.insert(2, 50);
        cache.insert(1, 120);
        cache.cleanup(130);
        // Entry 2 still live; entry 1 was re-inserted at 120.
        assert!(cache.contains(1, 130));
        assert!(cache.contains(2, 130));
        cache.cleanup(220);
        assert!(cache.is_empty());
    }

    #[test]
    fn dedup_cleanup_runs_every_n_inserts() {
        let mut cache = DedupCache::new(Duration::from_millis(10), 3);
        cache.insert(1, 0);
        cache.insert(2, 0);
        assert_eq!(cache.len(), 2);
        cache.insert(3, 50);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn content_hash_covers_sender_topic_and_data() {
        let a = peer();
        let b = peer();
        let data = MessageData::from("x");
        let base = content_hash(&a, "gossip", &data);
        assert_eq!(base, content_hash(&a, "gossip", &MessageData::from("x")));
        assert_ne!(base, content_hash(&b, "gossip", &data));
        assert_ne!(base, content_hash(&a, "signal_offer", &data));
        assert_ne!(base, content_hash(&a, "gossip", &MessageData::from("y")));
    }

    #[test]
    fn broadcast_reaches_every_neighbor_and_is_cached() {
        let mut f = fixture(3);
        let sent = f.engine.broadcast("gossip", &"hello".into(), None, NOW).unwrap();
        assert_eq!(sent, 3);
        assert_eq!(f.engine.cache_len(), 1);

        let frames = f.transport.take_sent();
        let msg = f.remote.decode_gossip(&frames[0].1).unwrap();
        assert_eq!(msg.hops, 10);
        assert_eq!(msg.neighbors.len(), 3);

        assert_eq!(
            f.engine.broadcast("unknown", &"x".into(), None, NOW),
            Err(EncodeError::UnknownTopic("unknown".into()))
        );
    }

    #[test]
    fn incoming_is_delivered_once_and_forwarded_to_others() {
        let mut f = fixture(3);
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        f.engine.on_topic("gossip", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let from = f.transport.connected_peers()[0].clone();
        let frame = f.remote.encode_gossip("gossip", &"hi".into(), 2, &[], NOW).unwrap();

        let outcome = f.engine.handle_incoming(&mut f.arbiter, &from, &frame, NOW);
        assert_eq!(outcome, GossipOutcome::Delivered { forwarded: 2 });
        let forwarded = f.transport.take_sent();
        assert!(forwarded.iter().all(|(to, _)| *to != from));
        let relayed = f.remote.decode_gossip(&forwarded[0].1).unwrap();
        assert_eq!(relayed.hops, 1);

        let again = f.engine.handle_incoming(&mut f.arbiter, &from, &frame, NOW + 10);
        assert_eq!(again, GossipOutcome::Duplicate);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert!(f.transport.take_sent().is_empty());
    }

    #[test]
    fn zero_hops_is_delivered_but_not_forwarded() {
        let mut f = fixture(3);
        let from = f.transport.connected_peers()[0].clone();
        let frame = f.remote.encode_gossip("gossip", &"hi".into(), 0, &[], NOW).unwrap();
        assert_eq!(
            f.engine.handle_incoming(&mut f.arbiter, &from, &frame, NOW),
            GossipOutcome::Delivered { forwarded: 0 }
        );
    }

    #[test]
    fn banished_and_stale_messages_are_dropped() {
        let mut f = fixture(2);
        let from = f.transport.connected_peers()[0].clone();
        let frame = f.remote.encode_gossip("gossip", &"old".into(), 2, &[], NOW).unwrap();
        let late = NOW + DEFAULT_MESSAGE_EXPIRATION.as_millis() as u64 + 1;
        assert_eq!(f.engine.handle_incoming(&mut f.arbiter, &from, &frame, late), GossipOutcome::Expired);

        let future = NOW + DEFAULT_MAX_FUTURE_SKEW.as_millis() as u64 + 1;
        let frame = f.remote.encode_gossip("gossip", &"new".into(), 2, &[], future).unwrap();
        assert_eq!(f.engine.handle_incoming(&mut f.arbiter, &from, &frame, NOW), GossipOutcome::Expired);

        f.arbiter.adjust_trust(&from, -1_000, "test");
        assert_eq!(f.engine.handle_incoming(&mut f.arbiter, &from, &frame, NOW), GossipOutcome::Banished);
    }

    #[test]
    fn malformed_frames_are_surfaced_without_penalty() {
        let mut f = fixture(1);
        let from = f.transport.connected_peers()[0].clone();
        let outcome = f.engine.handle_incoming(&mut f.arbiter, &from, &[131, 1, 0], NOW);
        assert!(matches!(outcome, GossipOutcome::Malformed(DecodeError::Truncated { .. })));
        assert_eq!(f.arbiter.trust_balance(&from), 0);
        assert!(!f.arbiter.is_banished(&from));
        assert!(f.transport.take_sent().is_empty());
    }

    #[test]
    fn explicit_hops_are_capped_at_the_topic_maximum() {
        let mut f = fixture(1);
        f.engine.broadcast("peer_connected", &"joined".into(), Some(20), NOW).unwrap();
        let frames = f.transport.take_sent();
        let msg = f.remote.decode_gossip(&frames[0].1).unwrap();
        assert_eq!(msg.hops, 3);

        let mut receiver = fixture(1);
        let outcome = receiver.engine.handle_incoming(&mut receiver.arbiter, &msg.sender_id, &frames[0].1, NOW);
        assert!(matches!(outcome, GossipOutcome::Delivered { .. }));
        assert!(receiver.arbiter.trust_balance(&msg.sender_id) > 0);

        f.engine.broadcast("gossip", &"short".into(), Some(2), NOW).unwrap();
        let frames = f.transport.take_sent();
        assert_eq!(f.remote.decode_gossip(&frames[0].1).unwrap().hops, 2);
    }

    #[test]
    fn damping_applies_only_in_dense_neighborhoods() {
        let mut table = ProtocolTable::empty();
        table.add_gossip_topic(GossipTopic::new("quiet", 200, 5, 0.0)).unwrap();

        let mut dense = fixture_with(table.clone(), 8);
        let from = dense.transport.connected_peers()[0].clone();
        let frame = dense.remote.encode_gossip("quiet", &"x".into(), 2, &[], NOW).unwrap();
        assert_eq!(
            dense.engine.handle_incoming(&mut dense.arbiter, &from, &frame, NOW),
            GossipOutcome::Delivered { forwarded: 0 }
        );

        let mut sparse = fixture_with(table, 3);
        let from = sparse.transport.connected_peers()[0].clone();
        let frame = sparse.remote.encode_gossip("quiet", &"x".into(), 2, &[], NOW).unwrap();
        assert_eq!(
            sparse.engine.handle_incoming(&mut sparse.arbiter, &from, &frame, NOW),
            GossipOutcome::Delivered { forwarded: 2 }
        );
    }
}
