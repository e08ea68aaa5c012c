//! # Path Discovery
//!
//! Bidirectional breadth-first search over the approximate peer graph.
//!
//! Two frontiers grow at once, one from the local node and one from the
//! target, each limited to `ceil(max_hops / 2)` levels. A node reached by
//! both sides is a meeting point and yields the path
//! `self_path(m) ++ reverse(target_path(m))[1..]`.
//!
//! | Situation | Result |
//! |-----------|--------|
//! | Target directly connected | `[self, target]`, [`RouteStatus::Found`] |
//! | Frontiers meet | Up to `max_routes` paths, shortest first |
//! | Target absent from the graph | `[self, random neighbor, target]`, [`RouteStatus::Blind`] |
//! | Nothing within limits | [`RouteStatus::NotFound`] |
//!
//! The local frontier expands through live connections as well as the graph,
//! since the graph may not yet know about fresh links.

use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::identity::PeerId;
use crate::protocols::PeerGraph;

/// Limits applied to one discovery run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SearchLimits {
    /// Maximum edges in a returned path.
    pub max_hops: usize,
    /// Total nodes both frontiers may visit.
    pub max_nodes: usize,
    pub max_routes: usize,
    /// A first meeting at or below this length ends the search at once.
    pub good_enough_hops: usize,
    /// Neighbors used when routing blind.
    pub blind_spread: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    /// Peer ids from the local node to the target, inclusive.
    pub path: Vec<PeerId>,
    pub hops: usize,
}

impl Route {
    fn new(path: Vec<PeerId>) -> Self {
        let hops = path.len().saturating_sub(1);
        Self { path, hops }
    }

    /// First relay, the peer the frame is handed to.
    pub fn next_hop(&self) -> Option<&PeerId> {
        self.path.get(1)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteStatus {
    Found,
    /// Target unknown; routes go through random neighbors.
    Blind,
    NotFound,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteResult {
    /// Sorted by hop count, ascending.
    pub routes: Vec<Route>,
    pub status: RouteStatus,
    pub nodes_explored: usize,
}

impl RouteResult {
    fn not_found(nodes_explored: usize) -> Self {
        Self { routes: Vec::new(), status: RouteStatus::NotFound, nodes_explored }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.status != RouteStatus::NotFound
    }

    pub fn best(&self) -> Option<&Route> {
        self.routes.first()
    }
}

// ============================================================================
// Frontier
// ============================================================================

struct Frontier {
    /// Visited node -> parent on the way back to the root.
    parents: HashMap<PeerId, Option<PeerId>>,
    current: Vec<PeerId>,
    depth: usize,
}

impl Frontier {
    fn new(root: &PeerId) -> Self {
        let mut parents = HashMap::new();
        parents.insert(root.clone(), None);
        Self { parents, current: vec![root.clone()], depth: 0 }
    }

    fn can_expand(&self, max_depth: usize) -> bool {
        self.depth < max_depth && !self.current.is_empty()
    }

    /// Root-to-node path.
    fn path_to(&self, node: &PeerId) -> Vec<PeerId> {
        let mut path = vec![node.clone()];
        let mut cursor = node;
        while let Some(Some(parent)) = self.parents.get(cursor) {
            path.push(parent.clone());
            cursor = parent;
        }
        path.reverse();
        path
    }

    /// Grow one level, recording nodes the other side has already seen.
    fn expand<F>(&mut self, other: &Frontier, neighbors: F, budget: &mut usize) -> Vec<PeerId>
    where
        F: Fn(&PeerId) -> Vec<PeerId>,
    {
        let mut meetings = Vec::new();
        let mut next = Vec::new();
        'outer: for node in std::mem::take(&mut self.current) {
            for neighbor in neighbors(&node) {
                if self.parents.contains_key(&neighbor) {
                    continue;
                }
                if *budget == 0 {
                    break 'outer;
                }
                *budget -= 1;
                self.parents.insert(neighbor.clone(), Some(node.clone()));
                if other.parents.contains_key(&neighbor) {
                    meetings.push(neighbor.clone());
                }
                next.push(neighbor);
            }
        }
        self.current = next;
        self.depth += 1;
        meetings
    }
}

// ============================================================================
// PathFinder
// ============================================================================

#[derive(Clone, Debug)]
pub struct PathFinder {
    limits: SearchLimits,
}

/// Peers a re-route discovery must stay clear of.
#[derive(Clone, Copy, Debug, Default)]
pub struct Avoid<'a> {
    /// No route may start with an edge to this peer. It may still appear
    /// further along, since it can be the target itself.
    pub first_hop: Option<&'a PeerId>,
    /// No route may pass through these peers. The target is never excluded.
    pub peers: &'a [PeerId],
}

impl Avoid<'_> {
    fn blocks(&self, peer: &PeerId, target: &PeerId) -> bool {
        peer != target && self.peers.contains(peer)
    }
}

impl PathFinder {
    pub fn new(limits: SearchLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SearchLimits {
        &self.limits
    }

    /// Discover routes from `self_id` to `target`.
    pub fn find<G: PeerGraph>(
        &self,
        self_id: &PeerId,
        target: &PeerId,
        connected: &[PeerId],
        graph: &G,
        rng: &mut StdRng,
    ) -> RouteResult {
        self.find_avoiding(self_id, target, connected, graph, Avoid::default(), rng)
    }

    /// Like [`find`](Self::find), but honoring `avoid`. Used after a first
    /// hop has failed, when the graph may still list the dead link and the
    /// peers already behind the frame must not see it again.
    pub fn find_avoiding<G: PeerGraph>(
        &self,
        self_id: &PeerId,
        target: &PeerId,
        connected: &[PeerId],
        graph: &G,
        avoid: Avoid<'_>,
        rng: &mut StdRng,
    ) -> RouteResult {
        if self_id == target {
            return RouteResult::not_found(0);
        }
        let live: Vec<PeerId> = connected
            .iter()
            .filter(|p| Some(*p) != avoid.first_hop && !avoid.blocks(p, target))
            .cloned()
            .collect();
        let connected = live.as_slice();
        if connected.contains(target) {
            return RouteResult {
                routes: vec![Route::new(vec![self_id.clone(), target.clone()])],
                status: RouteStatus::Found,
                nodes_explored: 1,
            };
        }
        if !graph.knows(target) {
            return self.blind(self_id, target, connected, rng);
        }

        let half = self.limits.max_hops.div_ceil(2);
        let mut budget = self.limits.max_nodes.saturating_sub(2);
        let mut from_self = Frontier::new(self_id);
        let mut from_target = Frontier::new(target);
        let mut routes: Vec<Route> = Vec::new();
        let mut extra_round = false;

        let self_neighbors = |node: &PeerId| -> Vec<PeerId> {
            let mut out = graph.neighbors_of(node);
            if node == self_id {
                out.extend(connected.iter().cloned());
            }
            out.retain(|p| !avoid.blocks(p, target));
            out
        };
        let target_neighbors = |node: &PeerId| {
            let mut out = graph.neighbors_of(node);
            out.retain(|p| !avoid.blocks(p, target));
            out
        };

        loop {
            let mut progressed = false;
            if from_self.can_expand(half) && budget > 0 {
                let meetings = from_self.expand(&from_target, &self_neighbors, &mut budget);
                self.join(&from_self, &from_target, &meetings, avoid.first_hop, &mut routes);
                progressed = true;
            }
            if from_target.can_expand(half) && budget > 0 {
                let meetings = from_target.expand(&from_self, &target_neighbors, &mut budget);
                self.join(&from_self, &from_target, &meetings, avoid.first_hop, &mut routes);
                progressed = true;
            }

            if let Some(best) = routes.iter().map(|r| r.hops).min() {
                if extra_round || best <= self.limits.good_enough_hops {
                    break;
                }
                // One more level may still surface a shorter meeting.
                extra_round = true;
            }
            if !progressed {
                break;
            }
        }

        let nodes_explored = from_self.parents.len() + from_target.parents.len();
        if routes.is_empty() {
            return RouteResult::not_found(nodes_explored);
        }
        routes.sort_by_key(|r| r.hops);
        routes.truncate(self.limits.max_routes.max(1));
        RouteResult { routes, status: RouteStatus::Found, nodes_explored }
    }

    /// Build full paths through each meeting node, keeping only valid ones.
    fn join(
        &self,
        from_self: &Frontier,
        from_target: &Frontier,
        meetings: &[PeerId],
        avoid: Option<&PeerId>,
        routes: &mut Vec<Route>,
    ) {
        for meeting in meetings {
            let mut path = from_self.path_to(meeting);
            let mut tail = from_target.path_to(meeting);
            tail.pop();
            path.extend(tail.into_iter().rev());

            if path.len() > self.limits.max_hops + 1 || (avoid.is_some() && path.get(1) == avoid) {
                continue;
            }
            let mut seen = HashSet::with_capacity(path.len());
            if !path.iter().all(|id| seen.insert(id)) {
                continue;
            }
            if routes.iter().any(|r| r.path == path) {
                continue;
            }
            routes.push(Route::new(path));
        }
    }

    fn blind(&self, self_id: &PeerId, target: &PeerId, connected: &[PeerId], rng: &mut StdRng) -> RouteResult {
        let candidates: Vec<&PeerId> = connected.iter().filter(|p| *p != self_id && *p != target).collect();
        if candidates.is_empty() || self.limits.max_hops < 2 {
            return RouteResult::not_found(0);
        }
        let routes = candidates
            .choose_multiple(rng, self.limits.blind_spread.max(1))
            .map(|relay| Route::new(vec![self_id.clone(), (*relay).clone(), target.clone()]))
            .collect();
        RouteResult { routes, status: RouteStatus::Blind, nodes_explored: 0 }
    }
}
