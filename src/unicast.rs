//! # Unicast Router
//!
//! Targeted multi-hop delivery along explicit, sender-signed routes.
//!
//! ## Sending
//!
//! [`UnicastRouter::send`] discovers routes (see `routing`), then encodes one
//! frame per chosen route and hands it to the route's first relay. Found
//! routes are cached per destination for `route_cache_ttl`; a cached route
//! whose first hop fails is evicted and discovery runs again.
//!
//! ## Relaying
//!
//! ```text
//! banished? -> byte cap -> decode -> Arbiter digest -> route integrity
//!           -> final hop? deliver : forward to next hop
//!                                   \-> unreachable: re-route once
//! ```
//!
//! A relay whose next hop is gone appends a signed [`ReroutePatch`] with a
//! fresh route from itself to the target. A frame that already carries a
//! patch is never patched again, bounding churn-induced relay loops.
//!
//! [`ReroutePatch`]: crate::messages::ReroutePatch

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use rand::rngs::StdRng;
use tracing::{debug, trace, warn};

use crate::arbiter::{Admission, Arbiter, Inbound, TrafficKind, Violation};
use crate::codec::{Codec, DecodeError, EncodeError};
use crate::identity::PeerId;
use crate::messages::{DirectMessage, MessageData, UnicastMessage};
use crate::node::ConfigError;
use crate::protocols::{PeerGraph, Transport};
use crate::routing::{Avoid, PathFinder, RouteResult, RouteStatus, SearchLimits};

/// Maximum edges in a discovered route.
pub const DEFAULT_MAX_HOPS: usize = 6;

/// Nodes both search frontiers may visit per discovery.
pub const DEFAULT_MAX_NODES: usize = 1_000;

pub const DEFAULT_MAX_ROUTES: usize = 3;

pub const DEFAULT_GOOD_ENOUGH_HOPS: usize = 3;

pub const DEFAULT_BLIND_SPREAD: usize = 1;

pub const DEFAULT_ROUTE_CACHE_SIZE: usize = 256;

pub const DEFAULT_ROUTE_CACHE_TTL: Duration = Duration::from_secs(30);

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct UnicastConfig {
    pub max_hops: usize,
    pub max_nodes: usize,
    pub max_routes: usize,
    pub good_enough_hops: usize,
    pub blind_spread: usize,
    pub route_cache_size: usize,
    pub route_cache_ttl: Duration,
}

impl Default for UnicastConfig {
    fn default() -> Self {
        Self {
            max_hops: DEFAULT_MAX_HOPS,
            max_nodes: DEFAULT_MAX_NODES,
            max_routes: DEFAULT_MAX_ROUTES,
            good_enough_hops: DEFAULT_GOOD_ENOUGH_HOPS,
            blind_spread: DEFAULT_BLIND_SPREAD,
            route_cache_size: DEFAULT_ROUTE_CACHE_SIZE,
            route_cache_ttl: DEFAULT_ROUTE_CACHE_TTL,
        }
    }
}

impl UnicastConfig {
    pub fn search_limits(&self) -> SearchLimits {
        SearchLimits {
            max_hops: self.max_hops,
            max_nodes: self.max_nodes,
            max_routes: self.max_routes,
            good_enough_hops: self.good_enough_hops,
            blind_spread: self.blind_spread,
        }
    }

    /// Discovered routes must fit the codec's route length limit.
    pub fn validate(&self, max_route_length: usize) -> Result<(), ConfigError> {
        if self.max_hops < 2 {
            return Err(ConfigError::new("max_hops must be at least 2"));
        }
        if self.max_hops + 1 > max_route_length {
            return Err(ConfigError::new(format!(
                "max_hops {} needs routes of {} ids, codec allows {}",
                self.max_hops,
                self.max_hops + 1,
                max_route_length
            )));
        }
        if self.max_routes == 0 || self.route_cache_size == 0 {
            return Err(ConfigError::new("max_routes and route_cache_size must be positive"));
        }
        Ok(())
    }
}

// ============================================================================
// Router
// ============================================================================

/// Result of [`UnicastRouter::handle_incoming`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnicastOutcome {
    Banished,
    Flood,
    Malformed(DecodeError),
    Rejected(Admission),
    /// Route integrity broken; reported to the Arbiter.
    RoutingViolation,
    /// This node is the target.
    Delivered,
    Relayed { next: PeerId },
    Rerouted { next: PeerId },
    /// Next hop unreachable and no re-route was possible or allowed.
    Undeliverable,
}

pub type UnicastCallback = Box<dyn FnMut(&DirectMessage) + Send>;

struct CachedRoutes {
    result: RouteResult,
    expires_at_ms: u64,
}

pub struct UnicastRouter<T: Transport, G: PeerGraph> {
    codec: Arc<Codec>,
    transport: Arc<T>,
    graph: Arc<G>,
    finder: PathFinder,
    route_cache: LruCache<PeerId, CachedRoutes>,
    route_cache_ttl_ms: u64,
    type_subscribers: HashMap<String, Vec<UnicastCallback>>,
    subscribers: Vec<UnicastCallback>,
    rng: StdRng,
}

impl<T: Transport, G: PeerGraph> UnicastRouter<T, G> {
    pub fn new(codec: Arc<Codec>, transport: Arc<T>, graph: Arc<G>, config: UnicastConfig, rng: StdRng) -> Self {
        let capacity = NonZeroUsize::new(config.route_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            codec,
            transport,
            graph,
            finder: PathFinder::new(config.search_limits()),
            route_cache: LruCache::new(capacity),
            route_cache_ttl_ms: config.route_cache_ttl.as_millis() as u64,
            type_subscribers: HashMap::new(),
            subscribers: Vec::new(),
            rng,
        }
    }

    /// Register a callback for one unicast type.
    pub fn on_type<F>(&mut self, kind: impl Into<String>, callback: F)
    where
        F: FnMut(&DirectMessage) + Send + 'static,
    {
        self.type_subscribers.entry(kind.into()).or_default().push(Box::new(callback));
    }

    /// Register a callback for every unicast message addressed to this node.
    pub fn on_message<F>(&mut self, callback: F)
    where
        F: FnMut(&DirectMessage) + Send + 'static,
    {
        self.subscribers.push(Box::new(callback));
    }

    /// Run discovery to `target` without sending anything.
    pub fn discover(&mut self, target: &PeerId) -> RouteResult {
        let connected = self.transport.connected_peers();
        self.finder
            .find(self.codec.self_id(), target, &connected, self.graph.as_ref(), &mut self.rng)
    }

    /// Send `data` to `target` over up to `spread` routes.
    ///
    /// Returns `Ok(false)` when no route exists or no first hop accepted the
    /// frame. Blind results are always sent over a single route.
    pub fn send(
        &mut self,
        target: &PeerId,
        kind: &str,
        data: &MessageData,
        spread: usize,
        now_ms: u64,
    ) -> Result<bool, EncodeError> {
        if self.codec.table().unicast_marker(kind).is_none() {
            return Err(EncodeError::UnknownType(kind.to_string()));
        }

        if let Some(result) = self.cached_routes(target, now_ms) {
            if self.send_over(&result, target, kind, data, spread, now_ms)? {
                return Ok(true);
            }
            debug!(dest = %target, "cached route failed, rediscovering");
            self.route_cache.pop(target);
        }

        let result = self.discover(target);
        if !result.is_success() {
            debug!(dest = %target, explored = result.nodes_explored, "no route to target");
            return Ok(false);
        }
        let sent = self.send_over(&result, target, kind, data, spread, now_ms)?;
        if sent && result.status == RouteStatus::Found {
            self.route_cache.put(
                target.clone(),
                CachedRoutes { result, expires_at_ms: now_ms.saturating_add(self.route_cache_ttl_ms) },
            );
        }
        Ok(sent)
    }

    /// Process a raw unicast frame received from `from`.
    pub fn handle_incoming(
        &mut self,
        arbiter: &mut Arbiter,
        from: &PeerId,
        raw: &[u8],
    ) -> UnicastOutcome {
        if arbiter.is_banished(from) {
            trace!(peer = %from, "dropping unicast from banished peer");
            return UnicastOutcome::Banished;
        }
        if !arbiter.count_message_bytes(from, raw.len(), TrafficKind::Unicast) {
            return UnicastOutcome::Flood;
        }

        let message = match self.codec.decode_unicast(raw) {
            Ok(message) => message,
            Err(e) => {
                debug!(peer = %from, error = %e, "failed to decode unicast");
                arbiter.report(from, Violation::Malformed);
                return UnicastOutcome::Malformed(e);
            }
        };

        let admission = arbiter.digest_message(from, Inbound::Unicast(&message), raw);
        if !admission.is_accepted() {
            debug!(peer = %from, ?admission, "unicast rejected");
            return UnicastOutcome::Rejected(admission);
        }

        let Some(position) = self.check_route(&message, from) else {
            arbiter.report(from, Violation::Routing);
            return UnicastOutcome::RoutingViolation;
        };

        let route = message.active_route();
        if position == route.len() - 1 {
            self.deliver(message.message());
            return UnicastOutcome::Delivered;
        }

        let next = route[position + 1].clone();
        match self.transport.send_bytes(&next, raw) {
            Ok(()) => {
                trace!(next = %next, sender = %message.message().sender_id.short(), "relayed unicast");
                UnicastOutcome::Relayed { next }
            }
            Err(e) => {
                debug!(next = %next, error = %e, "next hop unreachable");
                self.reroute(&message, raw, &next, &route[..position])
            }
        }
    }

    /// Drop expired route cache entries.
    pub fn tick(&mut self, now_ms: u64) {
        let expired: Vec<PeerId> = self
            .route_cache
            .iter()
            .filter(|(_, cached)| cached.expires_at_ms <= now_ms)
            .map(|(target, _)| target.clone())
            .collect();
        for target in expired {
            self.route_cache.pop(&target);
        }
    }

    pub fn route_cache_len(&self) -> usize {
        self.route_cache.len()
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn cached_routes(&mut self, target: &PeerId, now_ms: u64) -> Option<RouteResult> {
        let fresh = self.route_cache.peek(target)?.expires_at_ms > now_ms;
        if !fresh {
            self.route_cache.pop(target);
            return None;
        }
        self.route_cache.get(target).map(|cached| cached.result.clone())
    }

    fn send_over(
        &mut self,
        result: &RouteResult,
        target: &PeerId,
        kind: &str,
        data: &MessageData,
        spread: usize,
        now_ms: u64,
    ) -> Result<bool, EncodeError> {
        let count = match result.status {
            RouteStatus::Blind => 1,
            _ => spread.max(1),
        };
        let neighbors = self.transport.connected_peers();
        let mut sent = false;
        for route in result.routes.iter().take(count) {
            let Some(first_hop) = route.next_hop() else {
                continue;
            };
            let frame = self.codec.encode_unicast(kind, data, &route.path, &neighbors, now_ms)?;
            match self.transport.send_bytes(first_hop, &frame) {
                Ok(()) => {
                    trace!(dest = %target, via = %first_hop, hops = route.hops, "sent unicast");
                    sent = true;
                }
                Err(e) => debug!(dest = %target, via = %first_hop, error = %e, "unicast send failed"),
            }
        }
        Ok(sent)
    }

    /// Index of this node in the active route, if the frame may pass here.
    fn check_route(&self, message: &UnicastMessage, from: &PeerId) -> Option<usize> {
        let self_id = self.codec.self_id();
        let direct = message.message();
        if direct.sender_id == *self_id || direct.route.first() != Some(&direct.sender_id) {
            return None;
        }
        if let Some(patch) = message.patch() {
            let consistent = patch.new_route.first() == Some(&patch.rerouter_id)
                && patch.new_route.last() == direct.route.last()
                && direct.route.contains(&patch.rerouter_id);
            if !consistent {
                return None;
            }
        }
        let route = message.active_route();
        let position = route.iter().skip(1).position(|p| p == self_id)? + 1;
        (route[position - 1] == *from).then_some(position)
    }

    fn deliver(&mut self, message: &DirectMessage) {
        trace!(sender = %message.sender_id.short(), kind = %message.kind, "unicast delivered");
        if let Some(callbacks) = self.type_subscribers.get_mut(&message.kind) {
            for callback in callbacks.iter_mut() {
                callback(message);
            }
        }
        for callback in self.subscribers.iter_mut() {
            callback(message);
        }
    }

    /// Patch in a new route from here to the target. `behind` is the route
    /// prefix that already carried the frame; a detour through any of those
    /// peers would send it backwards.
    fn reroute(
        &mut self,
        message: &UnicastMessage,
        raw: &[u8],
        failed: &PeerId,
        behind: &[PeerId],
    ) -> UnicastOutcome {
        if message.is_rerouted() {
            debug!(failed = %failed, "message already re-routed once, dropping");
            return UnicastOutcome::Undeliverable;
        }
        let Some(target) = message.target().cloned() else {
            return UnicastOutcome::Undeliverable;
        };
        self.route_cache.pop(&target);

        let connected = self.transport.connected_peers();
        let result = self.finder.find_avoiding(
            self.codec.self_id(),
            &target,
            &connected,
            self.graph.as_ref(),
            Avoid { first_hop: Some(failed), peers: behind },
            &mut self.rng,
        );
        for route in &result.routes {
            let Some(next) = route.next_hop() else {
                continue;
            };
            let frame = match self.codec.encode_rerouted(raw, &route.path) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "failed to build re-route patch");
                    return UnicastOutcome::Undeliverable;
                }
            };
            if self.transport.send_bytes(next, &frame).is_ok() {
                debug!(dest = %target, via = %next, status = ?result.status, "re-routed unicast");
                return UnicastOutcome::Rerouted { next: next.clone() };
            }
        }
        debug!(dest = %target, "re-route found no usable path");
        UnicastOutcome::Undeliverable
    }
}

impl<T: Transport, G: PeerGraph> std::fmt::Debug for UnicastRouter<T, G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnicastRouter")
            .field("self_id", self.codec.self_id())
            .field("limits", self.finder.limits())
            .field("route_cache_len", &self.route_cache.len())
            .finish_non_exhaustive()
    }
}
