//! # Node
//!
//! A [`Node`] wires the codec, Arbiter, gossip engine and unicast router
//! into the surface a host process drives:
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `broadcast(topic, data, hops)` | Flood a gossip message |
//! | `send_unicast(target, kind, data, spread)` | Route a message to one peer |
//! | `handle_incoming_gossip(from, bytes)` | Feed a received gossip frame |
//! | `handle_incoming_unicast(from, bytes)` | Feed a received unicast frame |
//! | `on_topic` / `on_type` | Subscribe to deliveries |
//! | `tick()` | Periodic maintenance |
//!
//! `Node` itself is synchronous and owns all protocol state. Hosts that live
//! on tokio wrap it in a [`NodeHandle`], which runs the node as an actor:
//! commands go through a channel, a heartbeat interval drives `tick`, and
//! sampled proof-of-work checks run on the blocking pool so they never stall
//! message intake.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::arbiter::{Arbiter, ArbiterConfig, PowCheck, Violation};
use crate::codec::{Codec, CodecConfig, EncodeError};
use crate::gossip::{GossipConfig, GossipEngine, GossipOutcome};
use crate::identity::{IdentityConfig, Keypair, NodeRole, PeerId, PowConfig};
use crate::messages::{DirectMessage, GossipMessage, MessageData, ProtocolTable};
use crate::protocols::{Clock, PeerGraph, Transport};
use crate::unicast::{UnicastConfig, UnicastOutcome, UnicastRouter};

/// Interval between maintenance ticks when run through [`NodeHandle`].
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of the actor command channel.
const COMMAND_CHANNEL_SIZE: usize = 1_000;

// ============================================================================
// Configuration
// ============================================================================

/// Invalid configuration, detected at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(String);

impl ConfigError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid configuration: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub identity: IdentityConfig,
    pub table: ProtocolTable,
    pub codec: CodecConfig,
    pub gossip: GossipConfig,
    pub unicast: UnicastConfig,
    pub arbiter: ArbiterConfig,
    pub heartbeat_interval: Duration,
    /// Seed for every random choice the node makes. `None` draws from the OS.
    pub rng_seed: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            table: ProtocolTable::default(),
            codec: CodecConfig::default(),
            gossip: GossipConfig::default(),
            unicast: UnicastConfig::default(),
            arbiter: ArbiterConfig::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            rng_seed: None,
        }
    }
}

impl NodeConfig {
    /// Check every component config plus the invariants that span them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.identity.validate()?;
        self.codec.validate()?;
        self.gossip.validate()?;
        self.unicast.validate(self.codec.max_route_length)?;
        self.arbiter.validate()?;
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::new("heartbeat_interval must be positive"));
        }
        Ok(())
    }

    fn rng(&self, stream: u64) -> StdRng {
        match self.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stream)),
            None => StdRng::from_entropy(),
        }
    }
}

// ============================================================================
// Node
// ============================================================================

pub struct Node<T: Transport, G: PeerGraph> {
    codec: Arc<Codec>,
    arbiter: Arbiter,
    gossip: GossipEngine<T>,
    unicast: UnicastRouter<T, G>,
    clock: Arc<dyn Clock>,
    heartbeat_interval: Duration,
}

impl<T: Transport, G: PeerGraph> Node<T, G> {
    pub fn new(
        keypair: Keypair,
        config: NodeConfig,
        transport: Arc<T>,
        graph: Arc<G>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate().context("invalid node configuration")?;

        let codec = Arc::new(Codec::new(
            keypair,
            config.identity.clone(),
            config.table.clone(),
            config.codec.clone(),
        ));
        let arbiter = Arbiter::new(config.arbiter.clone(), &codec, config.rng(0));
        let gossip = GossipEngine::new(codec.clone(), transport.clone(), config.gossip.clone(), config.rng(1));
        let unicast = UnicastRouter::new(codec.clone(), transport, graph, config.unicast.clone(), config.rng(2));

        info!(
            peer = %codec.self_id(),
            role = ?codec.self_id().role(codec.identity()),
            "node created"
        );
        Ok(Self {
            codec,
            arbiter,
            gossip,
            unicast,
            clock,
            heartbeat_interval: config.heartbeat_interval,
        })
    }

    #[inline]
    pub fn id(&self) -> &PeerId {
        self.codec.self_id()
    }

    pub fn role(&self) -> NodeRole {
        self.id().role(self.codec.identity())
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.codec.public_key()
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn arbiter(&self) -> &Arbiter {
        &self.arbiter
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    pub fn broadcast(&mut self, topic: &str, data: &MessageData, hops: Option<u32>) -> Result<usize, EncodeError> {
        let now = self.clock.now_ms();
        self.gossip.broadcast(topic, data, hops, now)
    }

    /// Route `data` to `target`; `spread` defaults to one route.
    pub fn send_unicast(
        &mut self,
        target: &PeerId,
        kind: &str,
        data: &MessageData,
        spread: Option<usize>,
    ) -> Result<bool, EncodeError> {
        let now = self.clock.now_ms();
        self.unicast.send(target, kind, data, spread.unwrap_or(1), now)
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    /// A gossip frame that fails to decode comes back as
    /// [`GossipOutcome::Malformed`] with no penalty applied. Hosts that
    /// trust their transport's framing can follow up with
    /// [`report_violation`](Self::report_violation).
    pub fn handle_incoming_gossip(&mut self, from: &PeerId, raw: &[u8]) -> GossipOutcome {
        let now = self.clock.now_ms();
        self.gossip.handle_incoming(&mut self.arbiter, from, raw, now)
    }

    pub fn handle_incoming_unicast(&mut self, from: &PeerId, raw: &[u8]) -> UnicastOutcome {
        self.unicast.handle_incoming(&mut self.arbiter, from, raw)
    }

    pub fn on_topic<F>(&mut self, topic: impl Into<String>, callback: F)
    where
        F: FnMut(&GossipMessage) + Send + 'static,
    {
        self.gossip.on_topic(topic, callback);
    }

    /// Callback for every delivered gossip message, whatever its topic.
    pub fn on_gossip<F>(&mut self, callback: F)
    where
        F: FnMut(&GossipMessage) + Send + 'static,
    {
        self.gossip.on_message(callback);
    }

    pub fn on_type<F>(&mut self, kind: impl Into<String>, callback: F)
    where
        F: FnMut(&DirectMessage) + Send + 'static,
    {
        self.unicast.on_type(kind, callback);
    }

    pub fn on_unicast<F>(&mut self, callback: F)
    where
        F: FnMut(&DirectMessage) + Send + 'static,
    {
        self.unicast.on_message(callback);
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Trust decay, byte-period rollover, dedup and route cache pruning.
    pub fn tick(&mut self) {
        let now = self.clock.now_ms();
        self.arbiter.tick(now);
        self.gossip.tick(now);
        self.unicast.tick(now);
    }

    pub fn take_pow_checks(&mut self) -> Vec<PowCheck> {
        self.arbiter.take_pow_checks()
    }

    pub fn complete_pow_check(&mut self, check: &PowCheck, valid: bool) {
        self.arbiter.complete_pow_check(check, valid);
    }

    /// Verify queued PoW checks on the calling thread.
    pub fn run_pow_checks(&mut self) {
        self.arbiter.run_pow_checks();
    }

    pub fn pow_config(&self) -> &PowConfig {
        self.arbiter.pow_config()
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    pub fn trust_balance(&self, peer: &PeerId) -> i64 {
        self.arbiter.trust_balance(peer)
    }

    pub fn report_violation(&mut self, peer: &PeerId, violation: Violation) {
        self.arbiter.report(peer, violation);
    }

    pub fn is_banished(&self, peer: &PeerId) -> bool {
        self.arbiter.is_banished(peer)
    }

    pub fn banished_peers(&self) -> Vec<PeerId> {
        self.arbiter.banished_peers()
    }

    pub fn cache_len(&self) -> usize {
        self.gossip.cache_len()
    }
}

impl<T: Transport, G: PeerGraph> std::fmt::Debug for Node<T, G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", self.id())
            .field("arbiter", &self.arbiter)
            .field("gossip", &self.gossip)
            .field("unicast", &self.unicast)
            .finish()
    }
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    Broadcast {
        topic: String,
        data: MessageData,
        hops: Option<u32>,
        reply: oneshot::Sender<Result<usize, EncodeError>>,
    },
    SendUnicast {
        target: PeerId,
        kind: String,
        data: MessageData,
        spread: Option<usize>,
        reply: oneshot::Sender<Result<bool, EncodeError>>,
    },
    HandleGossip(PeerId, Vec<u8>, oneshot::Sender<GossipOutcome>),
    HandleUnicast(PeerId, Vec<u8>, oneshot::Sender<UnicastOutcome>),
    TrustBalance(PeerId, oneshot::Sender<i64>),
    BanishedPeers(oneshot::Sender<Vec<PeerId>>),
    Quit,
}

// ============================================================================
// NodeHandle (public API - cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct NodeHandle {
    cmd_tx: mpsc::Sender<Command>,
    id: PeerId,
}

impl NodeHandle {
    /// Move `node` onto a tokio task. Must be called within a runtime.
    pub fn spawn<T: Transport, G: PeerGraph>(node: Node<T, G>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let id = node.id().clone();
        let actor = NodeActor::new(node);
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx, id }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub async fn broadcast(&self, topic: &str, data: MessageData, hops: Option<u32>) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Broadcast { topic: topic.to_string(), data, hops, reply: tx })
            .await
            .map_err(|_| anyhow::anyhow!("node actor closed"))?;
        let sent = rx.await.map_err(|_| anyhow::anyhow!("node actor closed"))??;
        Ok(sent)
    }

    pub async fn send_unicast(
        &self,
        target: &PeerId,
        kind: &str,
        data: MessageData,
        spread: Option<usize>,
    ) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SendUnicast {
                target: target.clone(),
                kind: kind.to_string(),
                data,
                spread,
                reply: tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("node actor closed"))?;
        let sent = rx.await.map_err(|_| anyhow::anyhow!("node actor closed"))??;
        Ok(sent)
    }

    pub async fn handle_gossip(&self, from: &PeerId, bytes: Vec<u8>) -> Result<GossipOutcome> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::HandleGossip(from.clone(), bytes, tx))
            .await
            .map_err(|_| anyhow::anyhow!("node actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("node actor closed"))
    }

    pub async fn handle_unicast(&self, from: &PeerId, bytes: Vec<u8>) -> Result<UnicastOutcome> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::HandleUnicast(from.clone(), bytes, tx))
            .await
            .map_err(|_| anyhow::anyhow!("node actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("node actor closed"))
    }

    /// Current trust balance; zero once the actor is gone.
    pub async fn trust_balance(&self, peer: &PeerId) -> i64 {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::TrustBalance(peer.clone(), tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or_default()
    }

    pub async fn banished_peers(&self) -> Vec<PeerId> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::BanishedPeers(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle").field("id", &self.id).finish()
    }
}

// ============================================================================
// Node Actor
// ============================================================================

struct NodeActor<T: Transport, G: PeerGraph> {
    node: Node<T, G>,
    pow_tx: mpsc::UnboundedSender<(PowCheck, bool)>,
    pow_rx: mpsc::UnboundedReceiver<(PowCheck, bool)>,
}

impl<T: Transport, G: PeerGraph> NodeActor<T, G> {
    fn new(node: Node<T, G>) -> Self {
        let (pow_tx, pow_rx) = mpsc::unbounded_channel();
        Self { node, pow_tx, pow_rx }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut heartbeat = tokio::time::interval(self.node.heartbeat_interval());
        debug!(peer = %self.node.id(), "node actor started");

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Broadcast { topic, data, hops, reply }) => {
                            let _ = reply.send(self.node.broadcast(&topic, &data, hops));
                        }
                        Some(Command::SendUnicast { target, kind, data, spread, reply }) => {
                            let _ = reply.send(self.node.send_unicast(&target, &kind, &data, spread));
                        }
                        Some(Command::HandleGossip(from, bytes, reply)) => {
                            let _ = reply.send(self.node.handle_incoming_gossip(&from, &bytes));
                        }
                        Some(Command::HandleUnicast(from, bytes, reply)) => {
                            let _ = reply.send(self.node.handle_incoming_unicast(&from, &bytes));
                        }
                        Some(Command::TrustBalance(peer, reply)) => {
                            let _ = reply.send(self.node.trust_balance(&peer));
                        }
                        Some(Command::BanishedPeers(reply)) => {
                            let _ = reply.send(self.node.banished_peers());
                        }
                        Some(Command::Quit) => {
                            debug!("node actor quitting");
                            break;
                        }
                        None => {
                            debug!("node handle dropped, actor quitting");
                            break;
                        }
                    }
                }
                Some((check, valid)) = self.pow_rx.recv() => {
                    self.node.complete_pow_check(&check, valid);
                }
                _ = heartbeat.tick() => {
                    self.heartbeat();
                }
            }
        }
    }

    fn heartbeat(&mut self) {
        self.node.tick();
        for check in self.node.take_pow_checks() {
            let pow = self.node.pow_config().clone();
            let tx = self.pow_tx.clone();
            tokio::task::spawn_blocking(move || {
                let valid = check.verify(&pow);
                let _ = tx.send((check, valid));
            });
        }
    }
}
