//! Shared harness for integration tests: an in-memory mesh of nodes.
//!
//! Frames travel through a single FIFO queue. `Mesh::pump` drains it and
//! feeds each frame to the addressed node, dispatching on the marker byte
//! the same way a host would.
//!
//! Run with verbose output: RUST_LOG=trace cargo test -- --nocapture

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Once};

use hivemesh::{
    Clock, Codec, CodecConfig, DirectMessage, GossipMessage, GossipOutcome, IdentityConfig, Keypair,
    ManualClock, Node, NodeConfig, NodeRole, PeerGraph, PeerId, PowConfig, ProtocolTable, Transport,
    UnicastOutcome,
};

/// One-time tracing initialization
static INIT: Once = Once::new();

/// Initialize tracing for tests. Use RUST_LOG=debug or RUST_LOG=trace for
/// verbose output.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("warn")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Simulated wall clock start (2023-11-14).
pub const START_MS: u64 = 1_700_000_000_000;

/// Upper bound on frames moved by one `pump`, guards against relay loops.
const MAX_PUMPED_FRAMES: usize = 10_000;

pub fn test_identity() -> IdentityConfig {
    IdentityConfig { pow: PowConfig::disabled(), ..IdentityConfig::default() }
}

pub fn test_config(seed: u64) -> NodeConfig {
    NodeConfig { identity: test_identity(), rng_seed: Some(seed), ..NodeConfig::default() }
}

/// A signing peer outside the mesh, for hand-crafted frames.
pub fn outsider() -> Codec {
    Codec::new(Keypair::generate(), test_identity(), ProtocolTable::default(), CodecConfig::default())
}

// ============================================================================
// Wire and Transport
// ============================================================================

#[derive(Clone, Debug)]
pub struct Frame {
    pub from: PeerId,
    pub to: PeerId,
    pub bytes: Vec<u8>,
}

impl Frame {
    pub fn is_gossip(&self) -> bool {
        self.bytes.first().is_some_and(|marker| *marker >= 128)
    }
}

/// Links and in-flight frames shared by every transport of one mesh.
#[derive(Default)]
pub struct Wire {
    links: Mutex<HashSet<(PeerId, PeerId)>>,
    queue: Mutex<VecDeque<Frame>>,
}

impl Wire {
    pub fn link(&self, a: &PeerId, b: &PeerId) {
        let mut links = self.links.lock().unwrap();
        links.insert((a.clone(), b.clone()));
        links.insert((b.clone(), a.clone()));
    }

    pub fn unlink(&self, a: &PeerId, b: &PeerId) {
        let mut links = self.links.lock().unwrap();
        links.remove(&(a.clone(), b.clone()));
        links.remove(&(b.clone(), a.clone()));
    }

    pub fn is_linked(&self, a: &PeerId, b: &PeerId) -> bool {
        self.links.lock().unwrap().contains(&(a.clone(), b.clone()))
    }

    /// Sorted so forwarding order is reproducible.
    pub fn peers_of(&self, peer: &PeerId) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .links
            .lock()
            .unwrap()
            .iter()
            .filter(|(from, _)| from == peer)
            .map(|(_, to)| to.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn pop(&self) -> Option<Frame> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn drain(&self) -> Vec<Frame> {
        self.queue.lock().unwrap().drain(..).collect()
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

pub struct MeshTransport {
    me: PeerId,
    wire: Arc<Wire>,
}

impl Transport for MeshTransport {
    fn send_bytes(&self, to: &PeerId, frame: &[u8]) -> anyhow::Result<()> {
        if !self.wire.is_linked(&self.me, to) {
            anyhow::bail!("no link from {} to {}", self.me, to);
        }
        self.wire.queue.lock().unwrap().push_back(Frame {
            from: self.me.clone(),
            to: to.clone(),
            bytes: frame.to_vec(),
        });
        Ok(())
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.wire.peers_of(&self.me)
    }
}

/// Topology knowledge shared by every node; may disagree with the wire.
#[derive(Default)]
pub struct SharedGraph(Mutex<HashMap<PeerId, Vec<PeerId>>>);

impl SharedGraph {
    pub fn link(&self, a: &PeerId, b: &PeerId) {
        let mut adjacency = self.0.lock().unwrap();
        adjacency.entry(a.clone()).or_default().push(b.clone());
        adjacency.entry(b.clone()).or_default().push(a.clone());
    }
}

impl PeerGraph for SharedGraph {
    fn neighbors_of(&self, peer: &PeerId) -> Vec<PeerId> {
        self.0.lock().unwrap().get(peer).cloned().unwrap_or_default()
    }
}

// ============================================================================
// Mesh
// ============================================================================

pub type MeshNode = Node<MeshTransport, SharedGraph>;

#[derive(Debug)]
pub enum Delivery {
    Gossip(GossipOutcome),
    Unicast(UnicastOutcome),
}

pub struct Mesh {
    pub nodes: Vec<MeshNode>,
    pub wire: Arc<Wire>,
    pub graph: Arc<SharedGraph>,
    pub clock: Arc<ManualClock>,
}

impl Mesh {
    pub fn new(size: usize) -> Self {
        Self::with_config(size, test_config)
    }

    /// Build `size` nodes; `config(i)` supplies node `i`'s configuration.
    pub fn with_config(size: usize, config: impl Fn(u64) -> NodeConfig) -> Self {
        init_tracing();
        let wire = Arc::new(Wire::default());
        let graph = Arc::new(SharedGraph::default());
        let clock = Arc::new(ManualClock::new(START_MS));

        let nodes = (0..size as u64)
            .map(|i| {
                let config = config(i);
                let keypair = Keypair::generate_for_role(&config.identity, NodeRole::Standard)
                    .expect("keypair generation");
                let id = keypair.peer_id(&config.identity);
                let transport = Arc::new(MeshTransport { me: id, wire: wire.clone() });
                let clock: Arc<dyn Clock> = clock.clone();
                Node::new(keypair, config, transport, graph.clone(), clock).expect("node construction")
            })
            .collect();

        Self { nodes, wire, graph, clock }
    }

    pub fn id(&self, index: usize) -> PeerId {
        self.nodes[index].id().clone()
    }

    pub fn index_of(&self, peer: &PeerId) -> Option<usize> {
        self.nodes.iter().position(|n| n.id() == peer)
    }

    /// Open a live link and record it in the shared graph.
    pub fn connect(&self, a: usize, b: usize) {
        let (a, b) = (self.id(a), self.id(b));
        self.wire.link(&a, &b);
        self.graph.link(&a, &b);
    }

    /// Drop the live link; the graph keeps its stale edge.
    pub fn cut(&self, a: usize, b: usize) {
        self.wire.unlink(&self.id(a), &self.id(b));
    }

    pub fn connect_all(&self) {
        for a in 0..self.nodes.len() {
            for b in (a + 1)..self.nodes.len() {
                self.connect(a, b);
            }
        }
    }

    /// Deliver queued frames until the wire is quiet.
    ///
    /// Frames addressed to peers outside the mesh are dropped.
    pub fn pump(&mut self) -> Vec<(Frame, Delivery)> {
        let mut log = Vec::new();
        while let Some(frame) = self.wire.pop() {
            assert!(log.len() < MAX_PUMPED_FRAMES, "mesh did not go quiet");
            let Some(index) = self.index_of(&frame.to) else {
                continue;
            };
            let node = &mut self.nodes[index];
            let delivery = if frame.is_gossip() {
                Delivery::Gossip(node.handle_incoming_gossip(&frame.from, &frame.bytes))
            } else {
                Delivery::Unicast(node.handle_incoming_unicast(&frame.from, &frame.bytes))
            };
            log.push((frame, delivery));
        }
        log
    }
}

// ============================================================================
// Recorders
// ============================================================================

pub type Inbox<T> = Arc<Mutex<Vec<T>>>;

pub fn record_gossip(node: &mut MeshNode) -> Inbox<GossipMessage> {
    let inbox: Inbox<GossipMessage> = Arc::default();
    let sink = inbox.clone();
    node.on_gossip(move |msg| sink.lock().unwrap().push(msg.clone()));
    inbox
}

pub fn record_unicast(node: &mut MeshNode) -> Inbox<DirectMessage> {
    let inbox: Inbox<DirectMessage> = Arc::default();
    let sink = inbox.clone();
    node.on_unicast(move |msg| sink.lock().unwrap().push(msg.clone()));
    inbox
}
