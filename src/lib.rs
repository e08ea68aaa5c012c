//! # Hivemesh - Peer-to-Peer Overlay Protocol Core
//!
//! Hivemesh is the transport-agnostic heart of a browser-friendly P2P mesh:
//!
//! - **Identity**: Ed25519 keypairs, peer ids derived from public keys, optional
//!   Argon2 proof-of-work for public-role ids
//! - **Codec**: Compact signed binary frames for gossip and unicast traffic
//! - **Gossip**: Hop-limited flooding with content deduplication and damping
//! - **Unicast**: Source-routed delivery with bidirectional BFS path discovery
//!   and signed re-route patches when a hop fails
//! - **Arbiter**: Per-peer trust ledger, byte quotas and temporary banishment
//!
//! ## Architecture
//!
//! The core is synchronous and owns no sockets. Hosts supply a [`Transport`],
//! a [`PeerGraph`] and a [`Clock`], then feed received frames into a [`Node`].
//! Async hosts wrap the node in a [`NodeHandle`], an actor that serialises
//! commands, drives maintenance from a heartbeat and runs proof-of-work
//! checks on the blocking pool.
//!
//! ## Security Model
//!
//! - Every frame carries the sender's public key and an Ed25519 signature
//! - Re-routed frames add a second signature from the rerouting peer
//! - Peers lose trust for bad signatures, malformed frames, routing
//!   violations and floods; a negative balance means banishment until it
//!   recovers
//! - Byte counters, route lengths and data sizes are bounded
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components, actor handle |
//! | `identity` | Keypairs, peer ids, roles and proof-of-work |
//! | `crypto` | Signature creation and strict verification |
//! | `messages` | Payload types, protocol table, decoded message types |
//! | `codec` | Binary wire format encode/decode |
//! | `arbiter` | Trust ledger, byte quotas, admission checks |
//! | `gossip` | Flooding engine with dedup cache |
//! | `routing` | Bidirectional BFS path finder |
//! | `unicast` | Source-routed delivery, relaying and re-routing |
//! | `protocols` | Boundary traits (Transport, PeerGraph, Clock) |

mod arbiter;
mod codec;
mod crypto;
mod gossip;
mod identity;
mod messages;
mod node;
mod protocols;
mod routing;
mod unicast;

pub use arbiter::{Admission, Arbiter, ArbiterConfig, Inbound, PowCheck, TrafficKind, Violation};
pub use codec::{Codec, CodecConfig, DecodeError, EncodeError, HEADER_LEN, PATCH_OVERHEAD};
pub use crypto::{SignatureError, check_signature, sign, verify_signature};
pub use gossip::{DedupCache, GossipConfig, GossipEngine, GossipOutcome, content_hash};
pub use identity::{
    IdEncoding, IdentityConfig, IdentityError, Keypair, NodeRole, PeerId, PowConfig, verify_pow,
};
pub use messages::{
    DirectMessage, GossipMessage, GossipTopic, MessageData, ProtocolTable, ReroutePatch,
    UnicastMessage,
};
pub use node::{ConfigError, DEFAULT_HEARTBEAT_INTERVAL, Node, NodeConfig, NodeHandle};
pub use protocols::{Clock, ManualClock, PeerGraph, SystemClock, Transport};
pub use routing::{Avoid, PathFinder, Route, RouteResult, RouteStatus, SearchLimits};
pub use unicast::{UnicastConfig, UnicastOutcome, UnicastRouter};
