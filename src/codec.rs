//! # Wire Codec
//!
//! Bit-exact framing for gossip and unicast messages. All integers are
//! little-endian; every signature covers the bytes that precede it.
//!
//! ## Frame Layouts
//!
//! ```text
//! header  = marker(1) | dataType(1) | neighborCount(1) | timestamp(8)
//!         | dataLength(4) | pubkey(32)                               (47 bytes)
//!
//! gossip  = header | neighbors(n*idLen) | data | signature(64) | hops(1)
//! unicast = header | neighbors(n*idLen) | data | routeLength(1)
//!         | route(r*idLen) | signature(64)
//! patch   = unicast | rerouterPubkey(32) | newRoute(m*idLen) | rerouterSignature(64)
//! ```
//!
//! `hops` sits after the gossip signature so relays can decrement it without
//! the originator's key. A re-route patch has no length byte: `m` follows
//! from the bytes remaining after the original frame.
//!
//! Decoding never verifies signatures; that is the Arbiter's job, using the
//! `signature_start` offsets recorded on the decoded messages.

use crate::crypto::{self, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use crate::identity::{IdentityConfig, IdentityError, Keypair, PeerId};
use crate::messages::{
    DirectMessage, GOSSIP_MARKER_MIN, GossipMessage, MessageData, ProtocolTable, ReroutePatch,
    UNICAST_MARKER_MAX, UnicastMessage,
};
use crate::node::ConfigError;

/// Fixed header length shared by both frame kinds.
pub const HEADER_LEN: usize = 3 + 8 + 4 + PUBLIC_KEY_LEN;

/// Bytes a gossip frame adds after its data: signature plus the hops byte.
pub const GOSSIP_TRAILER_LEN: usize = SIGNATURE_LEN + 1;

/// Fixed overhead of a re-route patch, excluding the new route itself.
pub const PATCH_OVERHEAD: usize = PUBLIC_KEY_LEN + SIGNATURE_LEN;

/// Informational neighbor lists are truncated to what the count byte holds.
pub const MAX_NEIGHBORS: usize = u8::MAX as usize;

/// Default maximum number of ids in a route.
pub const DEFAULT_MAX_ROUTE_LENGTH: usize = 8;

/// Default maximum payload size.
pub const DEFAULT_MAX_DATA_LEN: usize = 64 * 1024;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct CodecConfig {
    /// Maximum number of ids in a route or re-route continuation.
    pub max_route_length: usize,
    /// Maximum accepted payload size in bytes.
    pub max_data_len: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_route_length: DEFAULT_MAX_ROUTE_LENGTH,
            max_data_len: DEFAULT_MAX_DATA_LEN,
        }
    }
}

impl CodecConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_route_length < 2 || self.max_route_length > u8::MAX as usize {
            return Err(ConfigError::new(format!(
                "max_route_length must be within 2..=255, got {}",
                self.max_route_length
            )));
        }
        if self.max_data_len == 0 || self.max_data_len > u32::MAX as usize {
            return Err(ConfigError::new("max_data_len must fit in the u32 length field"));
        }
        Ok(())
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Reasons a frame could not be built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Gossip topic has no marker mapping.
    UnknownTopic(String),
    /// Unicast type has no marker mapping.
    UnknownType(String),
    /// Routes need at least a sender and a target.
    RouteTooShort(usize),
    RouteTooLong { len: usize, max: usize },
    /// The first id of the route is not the local node.
    NotRouteOrigin,
    DataTooLarge { len: usize, max: usize },
    /// Only direct frames can receive a re-route patch.
    AlreadyRerouted,
    /// The frame handed to the re-router does not decode.
    InvalidOriginal(DecodeError),
    InvalidPeerId(IdentityError),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownTopic(topic) => write!(f, "unknown gossip topic: {topic}"),
            Self::UnknownType(kind) => write!(f, "unknown unicast type: {kind}"),
            Self::RouteTooShort(len) => write!(f, "route has {len} ids, need at least 2"),
            Self::RouteTooLong { len, max } => write!(f, "route has {len} ids, limit is {max}"),
            Self::NotRouteOrigin => write!(f, "route does not start at the local node"),
            Self::DataTooLarge { len, max } => write!(f, "payload of {len} bytes exceeds {max}"),
            Self::AlreadyRerouted => write!(f, "message was already re-routed once"),
            Self::InvalidOriginal(e) => write!(f, "original frame is invalid: {e}"),
            Self::InvalidPeerId(e) => write!(f, "cannot encode peer id: {e}"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Reasons a buffer could not be parsed. Always local; never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    Truncated { needed: usize, got: usize },
    /// Marker outside the family's range or not in the table.
    UnknownMarker(u8),
    UnknownDataType(u8),
    /// Payload bytes do not match their declared type.
    InvalidData,
    DataTooLarge { len: usize, max: usize },
    /// Route or re-route length arithmetic does not add up.
    MalformedRoute,
    InvalidPeerId(IdentityError),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated { needed, got } => write!(f, "truncated frame: need {needed} bytes, got {got}"),
            Self::UnknownMarker(m) => write!(f, "unknown marker byte {m}"),
            Self::UnknownDataType(t) => write!(f, "unknown data type code {t}"),
            Self::InvalidData => write!(f, "payload does not match its data type"),
            Self::DataTooLarge { len, max } => write!(f, "declared payload of {len} bytes exceeds {max}"),
            Self::MalformedRoute => write!(f, "malformed route length"),
            Self::InvalidPeerId(e) => write!(f, "invalid peer id: {e}"),
        }
    }
}

impl std::error::Error for DecodeError {}

// ============================================================================
// Reader
// ============================================================================

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).ok_or(DecodeError::MalformedRoute)?;
        if end > self.buf.len() {
            return Err(DecodeError::Truncated { needed: end, got: self.buf.len() });
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

struct Header {
    marker: u8,
    data_type: u8,
    neighbor_count: usize,
    timestamp: u64,
    data_len: usize,
    pubkey: [u8; PUBLIC_KEY_LEN],
}

// ============================================================================
// Codec
// ============================================================================

/// Frames, signs and parses messages on behalf of the local identity.
pub struct Codec {
    keypair: Keypair,
    self_id: PeerId,
    identity: IdentityConfig,
    table: ProtocolTable,
    config: CodecConfig,
}

impl Codec {
    pub fn new(keypair: Keypair, identity: IdentityConfig, table: ProtocolTable, config: CodecConfig) -> Self {
        let self_id = keypair.peer_id(&identity);
        Self { keypair, self_id, identity, table, config }
    }

    #[inline]
    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    #[inline]
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.keypair.public_key_bytes()
    }

    #[inline]
    pub fn identity(&self) -> &IdentityConfig {
        &self.identity
    }

    #[inline]
    pub fn table(&self) -> &ProtocolTable {
        &self.table
    }

    #[inline]
    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Build and sign a gossip frame. `hops` is clamped to 255.
    pub fn encode_gossip(
        &self,
        topic: &str,
        data: &MessageData,
        hops: u32,
        neighbors: &[PeerId],
        timestamp: u64,
    ) -> Result<Vec<u8>, EncodeError> {
        let marker = self
            .table
            .gossip_topic(topic)
            .map(|t| t.marker)
            .ok_or_else(|| EncodeError::UnknownTopic(topic.to_string()))?;

        let mut out = self.encode_body(marker, data, neighbors, timestamp)?;
        let signature = crypto::sign(&out, &self.keypair);
        out.extend_from_slice(&signature);
        out.push(hops.min(u8::MAX as u32) as u8);
        Ok(out)
    }

    /// Copy a gossip frame with its trailing hops byte decremented.
    ///
    /// The signed region is untouched, so the copy verifies like the original.
    pub fn decrement_hops(frame: &[u8]) -> Vec<u8> {
        let mut out = frame.to_vec();
        if let Some(hops) = out.last_mut() {
            *hops = hops.saturating_sub(1);
        }
        out
    }

    /// Build and sign a unicast frame along `route`.
    pub fn encode_unicast(
        &self,
        kind: &str,
        data: &MessageData,
        route: &[PeerId],
        neighbors: &[PeerId],
        timestamp: u64,
    ) -> Result<Vec<u8>, EncodeError> {
        let marker = self
            .table
            .unicast_marker(kind)
            .ok_or_else(|| EncodeError::UnknownType(kind.to_string()))?;
        self.check_route(route)?;

        let mut out = self.encode_body(marker, data, neighbors, timestamp)?;
        out.push(route.len() as u8);
        self.write_ids(route, &mut out)?;
        let signature = crypto::sign(&out, &self.keypair);
        out.extend_from_slice(&signature);
        Ok(out)
    }

    /// Append a re-route patch to an untouched direct frame.
    ///
    /// `new_route` runs from the local node to the original target. The
    /// local signature covers the whole buffer preceding it, binding the
    /// patch to this exact message; the sender's signature is unaffected.
    pub fn encode_rerouted(&self, original: &[u8], new_route: &[PeerId]) -> Result<Vec<u8>, EncodeError> {
        let message = match self.decode_unicast(original).map_err(EncodeError::InvalidOriginal)? {
            UnicastMessage::Direct(message) => message,
            UnicastMessage::Rerouted { .. } => return Err(EncodeError::AlreadyRerouted),
        };
        self.check_route(new_route)?;

        let mut out = original[..message.expected_end].to_vec();
        out.extend_from_slice(&self.keypair.public_key_bytes());
        self.write_ids(new_route, &mut out)?;
        let signature = crypto::sign(&out, &self.keypair);
        out.extend_from_slice(&signature);
        Ok(out)
    }

    /// Parse a gossip frame. Trailing bytes are tolerated here and caught by
    /// the Arbiter's length check via `expected_end`.
    pub fn decode_gossip(&self, raw: &[u8]) -> Result<GossipMessage, DecodeError> {
        let mut reader = Reader::new(raw);
        let header = self.read_header(&mut reader)?;
        if header.marker < GOSSIP_MARKER_MIN {
            return Err(DecodeError::UnknownMarker(header.marker));
        }
        let topic = self
            .table
            .gossip_topic_by_marker(header.marker)
            .ok_or(DecodeError::UnknownMarker(header.marker))?
            .name
            .clone();

        let neighbors = self.read_ids(&mut reader, header.neighbor_count)?;
        let data = self.read_data(&mut reader, &header)?;
        let signature_start = reader.pos;
        let signature = reader.array::<SIGNATURE_LEN>()?;
        let hops = reader.u8()?;

        Ok(GossipMessage {
            topic,
            timestamp: header.timestamp,
            neighbors,
            hops,
            sender_id: PeerId::from_public_key(&header.pubkey, &self.identity),
            pubkey: header.pubkey,
            data,
            signature,
            signature_start,
            expected_end: reader.pos,
        })
    }

    /// Parse a unicast frame, classifying it as direct or re-routed.
    pub fn decode_unicast(&self, raw: &[u8]) -> Result<UnicastMessage, DecodeError> {
        let mut reader = Reader::new(raw);
        let header = self.read_header(&mut reader)?;
        if header.marker > UNICAST_MARKER_MAX {
            return Err(DecodeError::UnknownMarker(header.marker));
        }
        let kind = self
            .table
            .unicast_type_by_marker(header.marker)
            .ok_or(DecodeError::UnknownMarker(header.marker))?
            .to_string();

        let neighbors = self.read_ids(&mut reader, header.neighbor_count)?;
        let data = self.read_data(&mut reader, &header)?;
        let route_len = reader.u8()? as usize;
        if route_len < 2 {
            return Err(DecodeError::MalformedRoute);
        }
        let route = self.read_ids(&mut reader, route_len)?;
        let signature_start = reader.pos;
        let signature = reader.array::<SIGNATURE_LEN>()?;

        let message = DirectMessage {
            kind,
            timestamp: header.timestamp,
            neighbors,
            route,
            sender_id: PeerId::from_public_key(&header.pubkey, &self.identity),
            pubkey: header.pubkey,
            data,
            signature,
            signature_start,
            expected_end: reader.pos,
        };

        // Fewer trailing bytes than a patch header: leave them for the
        // Arbiter's length check.
        let remaining = raw.len() - reader.pos;
        if remaining < PATCH_OVERHEAD {
            return Ok(UnicastMessage::Direct(message));
        }

        let id_len = self.identity.wire_len();
        let route_bytes = remaining - PATCH_OVERHEAD;
        if route_bytes % id_len != 0 || route_bytes / id_len < 2 {
            return Err(DecodeError::MalformedRoute);
        }
        let rerouter_pubkey = reader.array::<PUBLIC_KEY_LEN>()?;
        let new_route = self.read_ids(&mut reader, route_bytes / id_len)?;
        let patch_signature_start = reader.pos;
        let patch_signature = reader.array::<SIGNATURE_LEN>()?;

        let patch = ReroutePatch {
            rerouter_pubkey,
            rerouter_id: PeerId::from_public_key(&rerouter_pubkey, &self.identity),
            new_route,
            signature: patch_signature,
            signature_start: patch_signature_start,
            expected_end: reader.pos,
        };
        Ok(UnicastMessage::Rerouted { message, patch })
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Header, neighbors and data: the part both frame kinds share.
    fn encode_body(
        &self,
        marker: u8,
        data: &MessageData,
        neighbors: &[PeerId],
        timestamp: u64,
    ) -> Result<Vec<u8>, EncodeError> {
        let payload = data.to_bytes();
        if payload.len() > self.config.max_data_len {
            return Err(EncodeError::DataTooLarge { len: payload.len(), max: self.config.max_data_len });
        }
        let neighbors = &neighbors[..neighbors.len().min(MAX_NEIGHBORS)];
        let id_len = self.identity.wire_len();

        let mut out = Vec::with_capacity(
            HEADER_LEN + neighbors.len() * id_len + payload.len() + SIGNATURE_LEN + 1,
        );
        out.push(marker);
        out.push(data.type_code());
        out.push(neighbors.len() as u8);
        out.extend_from_slice(&timestamp.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.keypair.public_key_bytes());
        self.write_ids(neighbors, &mut out)?;
        out.extend_from_slice(&payload);
        Ok(out)
    }

    fn check_route(&self, route: &[PeerId]) -> Result<(), EncodeError> {
        if route.len() < 2 {
            return Err(EncodeError::RouteTooShort(route.len()));
        }
        if route.len() > self.config.max_route_length {
            return Err(EncodeError::RouteTooLong { len: route.len(), max: self.config.max_route_length });
        }
        if route[0] != self.self_id {
            return Err(EncodeError::NotRouteOrigin);
        }
        Ok(())
    }

    fn write_ids(&self, ids: &[PeerId], out: &mut Vec<u8>) -> Result<(), EncodeError> {
        for id in ids {
            id.write_wire(&self.identity, out).map_err(EncodeError::InvalidPeerId)?;
        }
        Ok(())
    }

    fn read_header(&self, reader: &mut Reader<'_>) -> Result<Header, DecodeError> {
        let marker = reader.u8()?;
        let data_type = reader.u8()?;
        let neighbor_count = reader.u8()? as usize;
        let timestamp = u64::from_le_bytes(reader.array::<8>()?);
        let data_len = u32::from_le_bytes(reader.array::<4>()?) as usize;
        let pubkey = reader.array::<PUBLIC_KEY_LEN>()?;
        Ok(Header { marker, data_type, neighbor_count, timestamp, data_len, pubkey })
    }

    fn read_ids(&self, reader: &mut Reader<'_>, count: usize) -> Result<Vec<PeerId>, DecodeError> {
        let id_len = self.identity.wire_len();
        let bytes = reader.take(count * id_len)?;
        bytes
            .chunks_exact(id_len)
            .map(|chunk| PeerId::from_wire(chunk, &self.identity).map_err(DecodeError::InvalidPeerId))
            .collect()
    }

    fn read_data(&self, reader: &mut Reader<'_>, header: &Header) -> Result<MessageData, DecodeError> {
        if header.data_len > self.config.max_data_len {
            return Err(DecodeError::DataTooLarge { len: header.data_len, max: self.config.max_data_len });
        }
        if !matches!(header.data_type, 1..=3) {
            return Err(DecodeError::UnknownDataType(header.data_type));
        }
        let bytes = reader.take(header.data_len)?;
        MessageData::decode(header.data_type, bytes).ok_or(DecodeError::InvalidData)
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("self_id", &self.self_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
