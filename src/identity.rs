//! # Identity and Proof-of-Work
//!
//! This module defines the identity types used throughout hivemesh:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`PeerId`]: short fixed-length id derived from the public key
//! - [`IdentityConfig`]: id encoding, id length, role prefix and PoW parameters
//!
//! ## Identity Model
//!
//! A peer id is a deterministic prefix of the peer's public key. Two encodings
//! exist, chosen once per deployment:
//!
//! | Encoding | Textual id | Wire bytes |
//! |----------|-----------|------------|
//! | `Hex` | first `id_length` hex chars of the key | `id_length / 2` |
//! | `Raw` | first `id_length` key bytes folded into printable ASCII | `id_length` |
//!
//! The leading characters of the id carry the node role: ids starting with
//! the configured public prefix belong to public (bootstrap) nodes.
//!
//! ## Proof-of-Work
//!
//! An identity is admissible when `Argon2id(public_key)` has at least
//! `PowConfig::difficulty` leading zero bits. The hash is memory-hard on
//! purpose: minting identities in bulk costs memory bandwidth, and receivers
//! only re-check it on a sampled subset of messages (see `arbiter`).
//!
//! ## Invariants
//!
//! - `PeerId::from_public_key(pk)` is deterministic
//! - id length is fixed and even
//! - `PeerId::from_wire(id.to_wire())` round-trips

use argon2::{Algorithm, Argon2, Params, Version};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::node::ConfigError;

// ============================================================================
// Constants
// ============================================================================

/// Default textual id length (16 hex chars = 8 wire bytes).
pub const DEFAULT_ID_LENGTH: usize = 16;

/// Default prefix marking public nodes.
pub const DEFAULT_PUBLIC_PREFIX: &str = "0";

/// Default number of leading zero bits required in the PoW hash.
pub const DEFAULT_POW_DIFFICULTY: u32 = 6;

/// Default Argon2 memory cost in KiB (16 MiB).
pub const DEFAULT_POW_MEMORY_KIB: u32 = 16 * 1024;

/// Default Argon2 iteration count.
pub const DEFAULT_POW_ITERATIONS: u32 = 1;

/// Salt for the PoW hash. Argon2 requires at least 8 bytes.
const POW_SALT: &[u8] = b"hivemesh-pow-v1";

/// Maximum keypairs tried by [`Keypair::generate_for_role`] before giving up.
const MAX_KEYPAIR_ATTEMPTS: u32 = 1 << 22;

/// Printable ASCII range used by the raw encoding ('!'..='~').
const RAW_FIRST: u8 = 0x21;
const RAW_SPAN: u8 = 94;

// ============================================================================
// Configuration
// ============================================================================

/// How ids are derived from public keys and laid out on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdEncoding {
    Hex,
    Raw,
}

/// Role advertised by the id prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeRole {
    /// Publicly reachable node (bootstrap / relay-capable).
    Public,
    /// Regular node.
    Standard,
}

/// Memory-hard PoW parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PowConfig {
    /// Required leading zero bits. Zero disables the check.
    pub difficulty: u32,
    /// Argon2 memory cost in KiB.
    pub memory_kib: u32,
    /// Argon2 time cost.
    pub iterations: u32,
}

impl PowConfig {
    /// PoW that every key satisfies. Used by tests and closed deployments.
    pub fn disabled() -> Self {
        Self { difficulty: 0, ..Self::default() }
    }
}

impl Default for PowConfig {
    fn default() -> Self {
        Self {
            difficulty: DEFAULT_POW_DIFFICULTY,
            memory_kib: DEFAULT_POW_MEMORY_KIB,
            iterations: DEFAULT_POW_ITERATIONS,
        }
    }
}

#[derive(Clone, Debug)]
pub struct IdentityConfig {
    pub encoding: IdEncoding,
    /// Length of the textual id. Must be even.
    pub id_length: usize,
    /// Ids starting with this prefix belong to public nodes.
    pub public_prefix: String,
    pub pow: PowConfig,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            encoding: IdEncoding::Hex,
            id_length: DEFAULT_ID_LENGTH,
            public_prefix: DEFAULT_PUBLIC_PREFIX.to_string(),
            pow: PowConfig::default(),
        }
    }
}

impl IdentityConfig {
    /// Number of bytes one id occupies inside a frame.
    #[inline]
    pub fn wire_len(&self) -> usize {
        match self.encoding {
            IdEncoding::Hex => self.id_length / 2,
            IdEncoding::Raw => self.id_length,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id_length == 0 || self.id_length % 2 != 0 {
            return Err(ConfigError::new(format!(
                "id_length must be a positive even number, got {}",
                self.id_length
            )));
        }
        let max = match self.encoding {
            IdEncoding::Hex => 64,
            IdEncoding::Raw => 32,
        };
        if self.id_length > max {
            return Err(ConfigError::new(format!(
                "id_length {} exceeds the {:?} maximum of {}",
                self.id_length, self.encoding, max
            )));
        }
        if self.public_prefix.is_empty() || self.public_prefix.len() >= self.id_length {
            return Err(ConfigError::new("public_prefix must be non-empty and shorter than the id"));
        }
        if self.encoding == IdEncoding::Hex
            && !self.public_prefix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            return Err(ConfigError::new("public_prefix must be lowercase hex in Hex mode"));
        }
        if self.pow.difficulty > 0 && self.pow.memory_kib < 8 {
            return Err(ConfigError::new("pow.memory_kib must be at least 8"));
        }
        Ok(())
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error type for identity encoding and generation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// Textual id has the wrong length for the configuration.
    InvalidLength { expected: usize, got: usize },
    /// Id contains characters the configured encoding cannot carry.
    InvalidCharacters,
    /// No keypair satisfied the role and PoW constraints.
    PowExhausted { attempts: u32, difficulty: u32 },
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidLength { expected, got } => {
                write!(f, "peer id has length {got}, expected {expected}")
            }
            Self::InvalidCharacters => write!(f, "peer id contains invalid characters"),
            Self::PowExhausted { attempts, difficulty } => write!(
                f,
                "no identity found after {attempts} keypairs (difficulty={difficulty})"
            ),
        }
    }
}

impl std::error::Error for IdentityError {}

// ============================================================================
// PeerId
// ============================================================================

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap an existing textual id without validation.
    ///
    /// Useful for ids read from configuration or peer lists; frames are
    /// validated again when encoded.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the id of a public key.
    pub fn from_public_key(public_key: &[u8; 32], config: &IdentityConfig) -> Self {
        match config.encoding {
            IdEncoding::Hex => {
                let mut hex = hex::encode(public_key);
                hex.truncate(config.id_length);
                Self(hex)
            }
            IdEncoding::Raw => Self(
                public_key[..config.id_length]
                    .iter()
                    .map(|b| (RAW_FIRST + b % RAW_SPAN) as char)
                    .collect(),
            ),
        }
    }

    /// Append the wire form of this id to `out`.
    pub fn write_wire(&self, config: &IdentityConfig, out: &mut Vec<u8>) -> Result<(), IdentityError> {
        if self.0.len() != config.id_length {
            return Err(IdentityError::InvalidLength { expected: config.id_length, got: self.0.len() });
        }
        match config.encoding {
            IdEncoding::Hex => {
                let bytes = hex::decode(&self.0).map_err(|_| IdentityError::InvalidCharacters)?;
                out.extend_from_slice(&bytes);
            }
            IdEncoding::Raw => {
                if !self.0.bytes().all(is_raw_char) {
                    return Err(IdentityError::InvalidCharacters);
                }
                out.extend_from_slice(self.0.as_bytes());
            }
        }
        Ok(())
    }

    /// Parse one id from exactly `config.wire_len()` bytes.
    pub fn from_wire(bytes: &[u8], config: &IdentityConfig) -> Result<Self, IdentityError> {
        if bytes.len() != config.wire_len() {
            return Err(IdentityError::InvalidLength { expected: config.wire_len(), got: bytes.len() });
        }
        match config.encoding {
            IdEncoding::Hex => Ok(Self(hex::encode(bytes))),
            IdEncoding::Raw => {
                if !bytes.iter().copied().all(is_raw_char) {
                    return Err(IdentityError::InvalidCharacters);
                }
                // All bytes are printable ASCII, so this is valid UTF-8.
                Ok(Self(bytes.iter().map(|b| *b as char).collect()))
            }
        }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn role(&self, config: &IdentityConfig) -> NodeRole {
        if self.0.starts_with(&config.public_prefix) {
            NodeRole::Public
        } else {
            NodeRole::Standard
        }
    }

    /// Abbreviated form for log fields: the first eight characters.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

#[inline]
fn is_raw_char(b: u8) -> bool {
    (RAW_FIRST..RAW_FIRST + RAW_SPAN).contains(&b)
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Keypair
// ============================================================================

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a keypair without any role or PoW constraint.
    pub fn generate() -> Self {
        Self { signing_key: SigningKey::generate(&mut OsRng) }
    }

    /// Generate a keypair whose id carries `role` and whose public key
    /// satisfies the configured PoW.
    ///
    /// The role check is cheap and runs first; the Argon2 hash only runs on
    /// candidates with the right prefix.
    pub fn generate_for_role(config: &IdentityConfig, role: NodeRole) -> Result<Self, IdentityError> {
        for _ in 0..MAX_KEYPAIR_ATTEMPTS {
            let candidate = Self::generate();
            let public_key = candidate.public_key_bytes();
            if PeerId::from_public_key(&public_key, config).role(config) != role {
                continue;
            }
            if verify_pow(&public_key, &config.pow) {
                return Ok(candidate);
            }
        }
        Err(IdentityError::PowExhausted {
            attempts: MAX_KEYPAIR_ATTEMPTS,
            difficulty: config.pow.difficulty,
        })
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self { signing_key: SigningKey::from_bytes(bytes) }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn peer_id(&self, config: &IdentityConfig) -> PeerId {
        PeerId::from_public_key(&self.public_key_bytes(), config)
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Proof-of-Work
// ============================================================================

/// Argon2id hash of a public key. `None` if the parameters are rejected.
pub fn pow_hash(public_key: &[u8; 32], config: &PowConfig) -> Option<[u8; 32]> {
    let params = Params::new(config.memory_kib, config.iterations, 1, Some(32)).ok()?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = [0u8; 32];
    argon.hash_password_into(public_key, POW_SALT, &mut out).ok()?;
    Some(out)
}

/// Check that the public key's PoW hash has the required leading zero bits.
///
/// This is deliberately expensive; callers on the receive path must offload
/// it (see `Arbiter::take_pow_checks`).
pub fn verify_pow(public_key: &[u8; 32], config: &PowConfig) -> bool {
    if config.difficulty == 0 {
        return true;
    }
    match pow_hash(public_key, config) {
        Some(hash) => count_leading_zeros(&hash) >= config.difficulty,
        None => false,
    }
}

/// Count leading zero bits in a hash.
#[inline]
fn count_leading_zeros(hash: &[u8; 32]) -> u32 {
    let mut zeros = 0u32;
    for byte in hash {
        if *byte == 0 {
            zeros += 8;
        } else {
            zeros += byte.leading_zeros();
            break;
        }
    }
    zeros
}
