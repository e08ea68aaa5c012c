//! # Signing Primitives
//!
//! Ed25519 signing and verification for hivemesh frames.
//!
//! Frames are signed over their raw byte prefix: everything that precedes the
//! signature field on the wire. There is no domain prefix because the byte
//! layout itself is the contract; the marker byte at offset 0 already
//! separates gossip frames (128..=255) from unicast frames (0..=127).
//!
//! Verification uses `verify_strict`, which rejects small-order public keys
//! and non-canonical signatures.

use ed25519_dalek::{Signature, VerifyingKey};

use crate::identity::Keypair;

/// Length of an Ed25519 public key on the wire.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of an Ed25519 signature on the wire.
pub const SIGNATURE_LEN: usize = 64;

// ============================================================================
// Signature Error Types
// ============================================================================

/// Why a frame signature was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Zero-length signature field.
    Missing,
    /// Signature field is not 64 bytes.
    InvalidLength,
    /// Well-formed signature that does not match the signed prefix.
    VerificationFailed,
    /// Header public key does not decode to a usable Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => write!(f, "frame carries no signature"),
            Self::InvalidLength => write!(f, "frame signature must be {SIGNATURE_LEN} bytes"),
            Self::VerificationFailed => write!(f, "frame signature does not match its signed prefix"),
            Self::InvalidPublicKey => write!(f, "frame public key is not a valid Ed25519 point"),
        }
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Sign / Verify
// ============================================================================

/// Sign `data` with the local keypair, returning the 64-byte signature.
pub fn sign(data: &[u8], keypair: &Keypair) -> [u8; SIGNATURE_LEN] {
    keypair.sign(data).to_bytes()
}

/// Verify a signature, reporting why it failed.
pub fn check_signature(
    public_key: &[u8; PUBLIC_KEY_LEN],
    signed_region: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; SIGNATURE_LEN] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;

    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|_| SignatureError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(&sig_bytes);

    verifying_key
        .verify_strict(signed_region, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

/// Boolean form of [`check_signature`].
#[inline]
pub fn verify_signature(
    public_key: &[u8; PUBLIC_KEY_LEN],
    signed_region: &[u8],
    signature: &[u8],
) -> bool {
    check_signature(public_key, signed_region, signature).is_ok()
}
