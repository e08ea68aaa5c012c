//! # Wire Protocol Messages
//!
//! This module defines the decoded forms of hivemesh frames and the tables
//! that map topic/type names onto marker bytes. The byte layout itself lives
//! in `codec`.
//!
//! ## Message Families
//!
//! | Family | Marker range | Decoded type |
//! |--------|-------------|--------------|
//! | Gossip | 128..=255 | [`GossipMessage`] |
//! | Unicast | 0..=127 | [`UnicastMessage`] (`Direct` or `Rerouted`) |
//!
//! ## Payloads
//!
//! Every frame carries a [`MessageData`] tagged by a one-byte type code:
//! `1` text, `2` raw bytes, `3` JSON.

use std::collections::HashMap;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::crypto::{PUBLIC_KEY_LEN, SIGNATURE_LEN};
use crate::identity::PeerId;
use crate::node::ConfigError;

/// Lowest marker reserved for gossip topics.
pub const GOSSIP_MARKER_MIN: u8 = 128;

/// Highest marker usable by unicast types.
pub const UNICAST_MARKER_MAX: u8 = 127;

/// Data type code: UTF-8 text.
pub const DATA_TEXT: u8 = 1;
/// Data type code: opaque bytes.
pub const DATA_BYTES: u8 = 2;
/// Data type code: JSON document.
pub const DATA_JSON: u8 = 3;

// ============================================================================
// Payload
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub enum MessageData {
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl MessageData {
    /// Serialize any value as a JSON payload.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Self::Json)
    }

    #[inline]
    pub fn type_code(&self) -> u8 {
        match self {
            Self::Text(_) => DATA_TEXT,
            Self::Bytes(_) => DATA_BYTES,
            Self::Json(_) => DATA_JSON,
        }
    }

    /// Bytes placed in the frame's data field.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Text(text) => text.as_bytes().to_vec(),
            Self::Bytes(bytes) => bytes.clone(),
            // `Value`'s Display impl is compact JSON and cannot fail.
            Self::Json(value) => value.to_string().into_bytes(),
        }
    }

    /// Rebuild a payload from its type code and raw bytes.
    pub fn decode(type_code: u8, bytes: &[u8]) -> Option<Self> {
        match type_code {
            DATA_TEXT => std::str::from_utf8(bytes).ok().map(|s| Self::Text(s.to_string())),
            DATA_BYTES => Some(Self::Bytes(bytes.to_vec())),
            DATA_JSON => serde_json::from_slice(bytes).ok().map(Self::Json),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Deserialize a JSON payload into `T`.
    pub fn parse_json<T: DeserializeOwned>(&self) -> Option<T> {
        match self {
            Self::Json(value) => T::deserialize(value).ok(),
            _ => None,
        }
    }
}

impl From<&str> for MessageData {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for MessageData {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<u8>> for MessageData {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<serde_json::Value> for MessageData {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

// ============================================================================
// Marker Tables
// ============================================================================

/// Per-topic gossip parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct GossipTopic {
    pub name: String,
    /// Marker byte in 128..=255.
    pub marker: u8,
    /// Default hop budget, also the maximum accepted from peers.
    pub hops: u8,
    /// Base forwarding probability before neighbor-count damping.
    pub transmission_rate: f64,
}

impl GossipTopic {
    pub fn new(name: impl Into<String>, marker: u8, hops: u8, transmission_rate: f64) -> Self {
        Self { name: name.into(), marker, hops, transmission_rate }
    }
}

/// Name <-> marker tables for both message families.
#[derive(Clone, Debug)]
pub struct ProtocolTable {
    gossip: HashMap<String, GossipTopic>,
    gossip_markers: HashMap<u8, String>,
    unicast: HashMap<String, u8>,
    unicast_markers: HashMap<u8, String>,
}

impl ProtocolTable {
    /// Empty table; every topic and type must be registered explicitly.
    pub fn empty() -> Self {
        Self {
            gossip: HashMap::new(),
            gossip_markers: HashMap::new(),
            unicast: HashMap::new(),
            unicast_markers: HashMap::new(),
        }
    }

    pub fn add_gossip_topic(&mut self, topic: GossipTopic) -> Result<(), ConfigError> {
        if topic.marker < GOSSIP_MARKER_MIN {
            return Err(ConfigError::new(format!(
                "gossip topic {:?} marker {} is outside 128..=255",
                topic.name, topic.marker
            )));
        }
        if !(0.0..=1.0).contains(&topic.transmission_rate) {
            return Err(ConfigError::new(format!(
                "gossip topic {:?} transmission_rate must be within [0, 1]",
                topic.name
            )));
        }
        if self.gossip.contains_key(&topic.name) || self.gossip_markers.contains_key(&topic.marker) {
            return Err(ConfigError::new(format!("duplicate gossip topic or marker: {:?}", topic.name)));
        }
        self.gossip_markers.insert(topic.marker, topic.name.clone());
        self.gossip.insert(topic.name.clone(), topic);
        Ok(())
    }

    pub fn add_unicast_type(&mut self, name: impl Into<String>, marker: u8) -> Result<(), ConfigError> {
        let name = name.into();
        if marker > UNICAST_MARKER_MAX {
            return Err(ConfigError::new(format!("unicast type {name:?} marker {marker} is outside 0..=127")));
        }
        if self.unicast.contains_key(&name) || self.unicast_markers.contains_key(&marker) {
            return Err(ConfigError::new(format!("duplicate unicast type or marker: {name:?}")));
        }
        self.unicast_markers.insert(marker, name.clone());
        self.unicast.insert(name, marker);
        Ok(())
    }

    pub fn gossip_topic(&self, name: &str) -> Option<&GossipTopic> {
        self.gossip.get(name)
    }

    pub fn gossip_topic_by_marker(&self, marker: u8) -> Option<&GossipTopic> {
        self.gossip_markers.get(&marker).and_then(|name| self.gossip.get(name))
    }

    pub fn unicast_marker(&self, name: &str) -> Option<u8> {
        self.unicast.get(name).copied()
    }

    pub fn unicast_type_by_marker(&self, marker: u8) -> Option<&str> {
        self.unicast_markers.get(&marker).map(String::as_str)
    }

    pub fn gossip_topics(&self) -> impl Iterator<Item = &GossipTopic> {
        self.gossip.values()
    }
}

impl Default for ProtocolTable {
    fn default() -> Self {
        let mut table = Self::empty();
        let topics = [
            GossipTopic::new("peer_connected", 128, 3, 0.5),
            GossipTopic::new("peer_disconnected", 129, 3, 0.5),
            GossipTopic::new("signal_offer", 130, 6, 0.8),
            GossipTopic::new("gossip", 131, 10, 1.0),
        ];
        for topic in topics {
            table.gossip_markers.insert(topic.marker, topic.name.clone());
            table.gossip.insert(topic.name.clone(), topic);
        }
        for (name, marker) in [("signal_answer", 0u8), ("signal_offer", 1), ("message", 2), ("handshake", 3)] {
            table.unicast_markers.insert(marker, name.to_string());
            table.unicast.insert(name.to_string(), marker);
        }
        table
    }
}

// ============================================================================
// Decoded Messages
// ============================================================================

/// A parsed gossip frame. Immutable once decoded.
#[derive(Clone, Debug)]
pub struct GossipMessage {
    pub topic: String,
    pub timestamp: u64,
    /// Sender's neighbors at send time (informational).
    pub neighbors: Vec<PeerId>,
    /// Remaining relay budget, read from the unsigned trailer.
    pub hops: u8,
    pub sender_id: PeerId,
    pub pubkey: [u8; PUBLIC_KEY_LEN],
    pub data: MessageData,
    pub signature: [u8; SIGNATURE_LEN],
    /// Offset of the signature; the signed region is `raw[..signature_start]`.
    pub signature_start: usize,
    /// Length the frame must have according to its own header.
    pub expected_end: usize,
}

/// A parsed unicast frame without a re-route patch.
#[derive(Clone, Debug)]
pub struct DirectMessage {
    /// Unicast type name (the `type` field of the frame).
    pub kind: String,
    pub timestamp: u64,
    pub neighbors: Vec<PeerId>,
    /// Full path from sender to target, as signed by the sender.
    pub route: Vec<PeerId>,
    pub sender_id: PeerId,
    pub pubkey: [u8; PUBLIC_KEY_LEN],
    pub data: MessageData,
    pub signature: [u8; SIGNATURE_LEN],
    pub signature_start: usize,
    /// End of the original (unpatched) frame.
    pub expected_end: usize,
}

impl DirectMessage {
    #[inline]
    pub fn target(&self) -> Option<&PeerId> {
        self.route.last()
    }
}

/// Continuation appended by a relay that could not reach the next hop.
#[derive(Clone, Debug)]
pub struct ReroutePatch {
    pub rerouter_pubkey: [u8; PUBLIC_KEY_LEN],
    pub rerouter_id: PeerId,
    /// Path from the rerouter onward to the target.
    pub new_route: Vec<PeerId>,
    pub signature: [u8; SIGNATURE_LEN],
    /// Offset of the rerouter signature; it covers `raw[..signature_start]`.
    pub signature_start: usize,
    pub expected_end: usize,
}

/// Unicast frame, classified once at decode time.
#[derive(Clone, Debug)]
pub enum UnicastMessage {
    Direct(DirectMessage),
    Rerouted { message: DirectMessage, patch: ReroutePatch },
}

impl UnicastMessage {
    #[inline]
    pub fn message(&self) -> &DirectMessage {
        match self {
            Self::Direct(message) | Self::Rerouted { message, .. } => message,
        }
    }

    #[inline]
    pub fn patch(&self) -> Option<&ReroutePatch> {
        match self {
            Self::Direct(_) => None,
            Self::Rerouted { patch, .. } => Some(patch),
        }
    }

    #[inline]
    pub fn is_rerouted(&self) -> bool {
        matches!(self, Self::Rerouted { .. })
    }

    /// The route relays must follow: the patch route when present.
    pub fn active_route(&self) -> &[PeerId] {
        match self {
            Self::Direct(message) => &message.route,
            Self::Rerouted { patch, .. } => &patch.new_route,
        }
    }

    /// Final destination, taken from the sender-signed route.
    pub fn target(&self) -> Option<&PeerId> {
        self.message().target()
    }

    /// Length the whole buffer must have, patch included.
    pub fn expected_end(&self) -> usize {
        match self {
            Self::Direct(message) => message.expected_end,
            Self::Rerouted { patch, .. } => patch.expected_end,
        }
    }
}
