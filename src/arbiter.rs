//! # Trust Arbiter
//!
//! Turns protocol observations into admission decisions for both engines.
//!
//! ## Trust Model
//!
//! Every peer has a signed balance, in milliseconds, starting at zero:
//!
//! | Balance | Meaning |
//! |---------|---------|
//! | `< 0` | Banished: traffic from or signed by this peer is dropped |
//! | `0..max_trust` | Normal; decays toward zero by `decay_step` per tick |
//! | `max_trust` | Fully trusted; the cap, never exceeded |
//!
//! Negative balances recover by `recovery_step` per tick, so bans last
//! `|balance| / recovery_step` ticks. Penalties scale with what the offence
//! costs an attacker: flooding is cheap and moderately punished, a forged
//! proof-of-work identity is punished for an hour.
//!
//! ## Proof-of-Work Sampling
//!
//! Identity PoW is memory-hard, so checking it inline would turn the receive
//! path into a DoS vector. Instead [`Arbiter::digest_message`] samples
//! senders at `pow_sample_rate` and queues a [`PowCheck`]. The host drains the
//! queue with [`Arbiter::take_pow_checks`], runs [`PowCheck::verify`] off the
//! hot path, and reports back through [`Arbiter::complete_pow_check`].

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use rand::Rng;
use rand::rngs::StdRng;
use tracing::{debug, trace, warn};

use crate::codec::Codec;
use crate::crypto::{self, PUBLIC_KEY_LEN};
use crate::identity::{PeerId, PowConfig, verify_pow};
use crate::messages::{GossipMessage, UnicastMessage};
use crate::node::ConfigError;

/// One hour, in trust milliseconds.
pub const DEFAULT_MAX_TRUST: i64 = 3_600_000;

pub const DEFAULT_DECAY_STEP: i64 = 10;

pub const DEFAULT_RECOVERY_STEP: i64 = 1_000;

pub const DEFAULT_SIGNATURE_REWARD: i64 = 50;

pub const DEFAULT_VALID_POW_REWARD: i64 = 300_000;

pub const DEFAULT_INVALID_SIGNATURE_PENALTY: i64 = 60_000;

pub const DEFAULT_LENGTH_MISMATCH_PENALTY: i64 = 60_000;

pub const DEFAULT_LIMIT_PENALTY: i64 = 60_000;

pub const DEFAULT_MALFORMED_PENALTY: i64 = 30_000;

pub const DEFAULT_ROUTING_PENALTY: i64 = 30_000;

pub const DEFAULT_FLOOD_PENALTY: i64 = 120_000;

/// A forged identity key costs the sender a full hour.
pub const DEFAULT_INVALID_POW_PENALTY: i64 = 3_600_000;

/// Length of one byte-counting period.
pub const DEFAULT_BYTE_PERIOD: Duration = Duration::from_secs(10);

/// Per-peer gossip bytes allowed per period. Lower than unicast because
/// every accepted gossip frame is re-broadcast.
pub const DEFAULT_GOSSIP_BYTE_CAP: u64 = 256 * 1024;

pub const DEFAULT_UNICAST_BYTE_CAP: u64 = 1024 * 1024;

pub const DEFAULT_POW_SAMPLE_RATE: f64 = 0.01;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct ArbiterConfig {
    pub max_trust: i64,
    /// Per-tick decay of positive balances below the cap.
    pub decay_step: i64,
    /// Per-tick recovery of negative balances.
    pub recovery_step: i64,
    pub signature_reward: i64,
    pub valid_pow_reward: i64,
    pub invalid_signature_penalty: i64,
    pub length_mismatch_penalty: i64,
    pub limit_penalty: i64,
    pub malformed_penalty: i64,
    pub routing_penalty: i64,
    pub flood_penalty: i64,
    pub invalid_pow_penalty: i64,
    pub byte_period: Duration,
    pub gossip_byte_cap: u64,
    pub unicast_byte_cap: u64,
    /// Probability in [0, 1] of queueing a PoW check for an unproven sender.
    pub pow_sample_rate: f64,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            max_trust: DEFAULT_MAX_TRUST,
            decay_step: DEFAULT_DECAY_STEP,
            recovery_step: DEFAULT_RECOVERY_STEP,
            signature_reward: DEFAULT_SIGNATURE_REWARD,
            valid_pow_reward: DEFAULT_VALID_POW_REWARD,
            invalid_signature_penalty: DEFAULT_INVALID_SIGNATURE_PENALTY,
            length_mismatch_penalty: DEFAULT_LENGTH_MISMATCH_PENALTY,
            limit_penalty: DEFAULT_LIMIT_PENALTY,
            malformed_penalty: DEFAULT_MALFORMED_PENALTY,
            routing_penalty: DEFAULT_ROUTING_PENALTY,
            flood_penalty: DEFAULT_FLOOD_PENALTY,
            invalid_pow_penalty: DEFAULT_INVALID_POW_PENALTY,
            byte_period: DEFAULT_BYTE_PERIOD,
            gossip_byte_cap: DEFAULT_GOSSIP_BYTE_CAP,
            unicast_byte_cap: DEFAULT_UNICAST_BYTE_CAP,
            pow_sample_rate: DEFAULT_POW_SAMPLE_RATE,
        }
    }
}

impl ArbiterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_trust <= 0 {
            return Err(ConfigError::new("max_trust must be positive"));
        }
        let amounts = [
            self.decay_step,
            self.recovery_step,
            self.signature_reward,
            self.valid_pow_reward,
            self.invalid_signature_penalty,
            self.length_mismatch_penalty,
            self.limit_penalty,
            self.malformed_penalty,
            self.routing_penalty,
            self.flood_penalty,
            self.invalid_pow_penalty,
        ];
        if amounts.iter().any(|v| *v < 0) {
            return Err(ConfigError::new("trust steps, rewards and penalties are magnitudes and must be >= 0"));
        }
        if self.byte_period.is_zero() {
            return Err(ConfigError::new("byte_period must be positive"));
        }
        if self.gossip_byte_cap == 0 || self.gossip_byte_cap >= self.unicast_byte_cap {
            return Err(ConfigError::new("gossip_byte_cap must be positive and below unicast_byte_cap"));
        }
        if !(0.0..=1.0).contains(&self.pow_sample_rate) {
            return Err(ConfigError::new("pow_sample_rate must be within [0, 1]"));
        }
        Ok(())
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Trust-affecting protocol violations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Violation {
    InvalidSignature,
    /// Declared frame length differs from the buffer length.
    LengthMismatch,
    /// Hops above the topic maximum, or a route longer than allowed.
    LimitExceeded,
    /// Frame could not be decoded.
    Malformed,
    /// Route integrity broken: not on the route, wrong previous hop, and so on.
    Routing,
    Flood,
    InvalidPow,
}

impl Violation {
    fn penalty(self, config: &ArbiterConfig) -> i64 {
        match self {
            Self::InvalidSignature => config.invalid_signature_penalty,
            Self::LengthMismatch => config.length_mismatch_penalty,
            Self::LimitExceeded => config.limit_penalty,
            Self::Malformed => config.malformed_penalty,
            Self::Routing => config.routing_penalty,
            Self::Flood => config.flood_penalty,
            Self::InvalidPow => config.invalid_pow_penalty,
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InvalidSignature => "invalid signature",
            Self::LengthMismatch => "length mismatch",
            Self::LimitExceeded => "limit exceeded",
            Self::Malformed => "malformed frame",
            Self::Routing => "routing integrity",
            Self::Flood => "byte flood",
            Self::InvalidPow => "invalid proof-of-work",
        };
        f.write_str(s)
    }
}

/// Result of [`Arbiter::digest_message`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// Rejected and penalised.
    Rejected(Violation),
    /// Rejected because the named peer is currently banished.
    Banished(PeerId),
}

impl Admission {
    #[inline]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Which byte counter a frame is charged to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrafficKind {
    Gossip,
    Unicast,
}

/// A decoded message handed to [`Arbiter::digest_message`].
#[derive(Clone, Copy, Debug)]
pub enum Inbound<'a> {
    Gossip(&'a GossipMessage),
    Unicast(&'a UnicastMessage),
}

/// A sampled identity awaiting memory-hard verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PowCheck {
    pub peer: PeerId,
    pub public_key: [u8; PUBLIC_KEY_LEN],
}

impl PowCheck {
    /// Run the Argon2id derivation. Expensive: call off the message path.
    pub fn verify(&self, config: &PowConfig) -> bool {
        verify_pow(&self.public_key, config)
    }
}

// ============================================================================
// Arbiter
// ============================================================================

pub struct Arbiter {
    config: ArbiterConfig,
    self_id: PeerId,
    pow: PowConfig,
    /// Per-topic maximum hops accepted from peers.
    topic_hops: HashMap<String, u8>,
    max_route_length: usize,
    trust: HashMap<PeerId, i64>,
    gossip_bytes: HashMap<PeerId, u64>,
    unicast_bytes: HashMap<PeerId, u64>,
    period_start_ms: Option<u64>,
    pending_pow: Vec<PowCheck>,
    pow_in_flight: HashSet<PeerId>,
    /// Senders whose proof passed, kept while they hold positive trust.
    pow_verified: HashSet<PeerId>,
    rng: StdRng,
}

impl Arbiter {
    /// Build an Arbiter whose limits match what `codec` produces and accepts.
    pub fn new(config: ArbiterConfig, codec: &Codec, rng: StdRng) -> Self {
        let topic_hops = codec
            .table()
            .gossip_topics()
            .map(|t| (t.name.clone(), t.hops))
            .collect();
        Self {
            config,
            self_id: codec.self_id().clone(),
            pow: codec.identity().pow.clone(),
            topic_hops,
            max_route_length: codec.config().max_route_length,
            trust: HashMap::new(),
            gossip_bytes: HashMap::new(),
            unicast_bytes: HashMap::new(),
            period_start_ms: None,
            pending_pow: Vec::new(),
            pow_in_flight: HashSet::new(),
            pow_verified: HashSet::new(),
            rng,
        }
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    pub fn pow_config(&self) -> &PowConfig {
        &self.pow
    }

    /// Periodic maintenance: decay, recovery and byte-period rollover.
    pub fn tick(&mut self, now_ms: u64) {
        let max = self.config.max_trust;
        let decay = self.config.decay_step;
        let recovery = self.config.recovery_step;

        for (peer, balance) in self.trust.iter_mut() {
            if *balance < 0 {
                *balance = (*balance + recovery).min(0);
                if *balance == 0 {
                    debug!(peer = %peer, "ban lifted");
                }
            } else if *balance > 0 && *balance < max {
                *balance = (*balance - decay).max(0);
            }
        }
        self.trust.retain(|_, balance| *balance != 0);
        let trust = &self.trust;
        self.pow_verified.retain(|peer| trust.get(peer).is_some_and(|b| *b > 0));

        match self.period_start_ms {
            Some(start) if now_ms.saturating_sub(start) < self.config.byte_period.as_millis() as u64 => {}
            _ => {
                self.gossip_bytes.clear();
                self.unicast_bytes.clear();
                self.period_start_ms = Some(now_ms);
            }
        }
    }

    /// Add `delta` to a peer's balance, capped at `max_trust`. No-op for self.
    pub fn adjust_trust(&mut self, peer: &PeerId, delta: i64, reason: &str) {
        if *peer == self.self_id || delta == 0 {
            return;
        }
        let max = self.config.max_trust;
        let balance = self.trust.entry(peer.clone()).or_insert(0);
        let before = *balance;
        *balance = balance.saturating_add(delta).min(max);

        if before >= 0 && *balance < 0 {
            warn!(peer = %peer, balance = *balance, reason = reason, "peer banished");
        } else {
            trace!(peer = %peer, delta = delta, balance = *balance, reason = reason, "trust adjusted");
        }
    }

    /// Apply the configured penalty for `violation`.
    pub fn report(&mut self, peer: &PeerId, violation: Violation) {
        let penalty = violation.penalty(&self.config);
        debug!(peer = %peer, violation = %violation, penalty = penalty, "violation reported");
        self.adjust_trust(peer, -penalty, &violation.to_string());
    }

    #[inline]
    pub fn is_banished(&self, peer: &PeerId) -> bool {
        self.trust_balance(peer) < 0
    }

    pub fn trust_balance(&self, peer: &PeerId) -> i64 {
        self.trust.get(peer).copied().unwrap_or(0)
    }

    pub fn banished_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .trust
            .iter()
            .filter(|(_, balance)| **balance < 0)
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Charge `len` bytes to the peer's counter for this period.
    ///
    /// Returns `false`, after applying a flood penalty, once the counter
    /// exceeds the kind's cap.
    pub fn count_message_bytes(&mut self, peer: &PeerId, len: usize, kind: TrafficKind) -> bool {
        let (counters, cap) = match kind {
            TrafficKind::Gossip => (&mut self.gossip_bytes, self.config.gossip_byte_cap),
            TrafficKind::Unicast => (&mut self.unicast_bytes, self.config.unicast_byte_cap),
        };
        let total = counters.entry(peer.clone()).or_insert(0);
        *total = total.saturating_add(len as u64);
        if *total > cap {
            let total = *total;
            debug!(peer = %peer, bytes = total, cap = cap, ?kind, "byte cap exceeded");
            self.report(peer, Violation::Flood);
            return false;
        }
        true
    }

    /// Full admission check for a decoded message received from `from`.
    pub fn digest_message(&mut self, from: &PeerId, message: Inbound<'_>, raw: &[u8]) -> Admission {
        let verdict = match message {
            Inbound::Gossip(msg) => self.check_gossip(msg, raw),
            Inbound::Unicast(msg) => self.check_unicast(msg, raw),
        };
        if let Err(violation) = verdict {
            self.report(from, violation);
            return Admission::Rejected(violation);
        }
        self.adjust_trust(from, self.config.signature_reward, "valid signature");

        let (sender, pubkey) = match message {
            Inbound::Gossip(msg) => (&msg.sender_id, msg.pubkey),
            Inbound::Unicast(msg) => (&msg.message().sender_id, msg.message().pubkey),
        };
        if self.is_banished(from) {
            return Admission::Banished(from.clone());
        }
        if self.is_banished(sender) {
            return Admission::Banished(sender.clone());
        }
        if let Inbound::Unicast(msg) = message
            && let Some(patch) = msg.patch()
            && self.is_banished(&patch.rerouter_id)
        {
            return Admission::Banished(patch.rerouter_id.clone());
        }

        self.sample_pow(sender, pubkey);
        Admission::Accepted
    }

    /// Drain queued PoW checks for off-path verification.
    pub fn take_pow_checks(&mut self) -> Vec<PowCheck> {
        std::mem::take(&mut self.pending_pow)
    }

    /// Record the result of a [`PowCheck`] taken from this Arbiter.
    pub fn complete_pow_check(&mut self, check: &PowCheck, valid: bool) {
        self.pow_in_flight.remove(&check.peer);
        if valid {
            self.adjust_trust(&check.peer, self.config.valid_pow_reward, "valid proof-of-work");
            self.pow_verified.insert(check.peer.clone());
        } else {
            self.pow_verified.remove(&check.peer);
            self.report(&check.peer, Violation::InvalidPow);
        }
    }

    /// Verify every queued check inline. For hosts without a blocking pool.
    pub fn run_pow_checks(&mut self) {
        for check in self.take_pow_checks() {
            let valid = check.verify(&self.pow);
            self.complete_pow_check(&check, valid);
        }
    }

    // ------------------------------------------------------------------------
    // Checks
    // ------------------------------------------------------------------------

    fn check_gossip(&self, msg: &GossipMessage, raw: &[u8]) -> Result<(), Violation> {
        let signed = raw.get(..msg.signature_start).ok_or(Violation::LengthMismatch)?;
        crypto::check_signature(&msg.pubkey, signed, &msg.signature)
            .map_err(|_| Violation::InvalidSignature)?;
        if msg.expected_end != raw.len() {
            return Err(Violation::LengthMismatch);
        }
        let max_hops = self.topic_hops.get(&msg.topic).copied().unwrap_or(0);
        if msg.hops > max_hops {
            return Err(Violation::LimitExceeded);
        }
        Ok(())
    }

    fn check_unicast(&self, msg: &UnicastMessage, raw: &[u8]) -> Result<(), Violation> {
        let direct = msg.message();
        let signed = raw.get(..direct.signature_start).ok_or(Violation::LengthMismatch)?;
        crypto::check_signature(&direct.pubkey, signed, &direct.signature)
            .map_err(|_| Violation::InvalidSignature)?;
        if let Some(patch) = msg.patch() {
            let signed = raw.get(..patch.signature_start).ok_or(Violation::LengthMismatch)?;
            crypto::check_signature(&patch.rerouter_pubkey, signed, &patch.signature)
                .map_err(|_| Violation::InvalidSignature)?;
        }
        if msg.expected_end() != raw.len() {
            return Err(Violation::LengthMismatch);
        }
        let too_long = direct.route.len() > self.max_route_length
            || msg.patch().is_some_and(|p| p.new_route.len() > self.max_route_length);
        if too_long {
            return Err(Violation::LimitExceeded);
        }
        Ok(())
    }

    fn sample_pow(&mut self, sender: &PeerId, public_key: [u8; PUBLIC_KEY_LEN]) {
        if self.pow.difficulty == 0 || *sender == self.self_id {
            return;
        }
        if self.pow_verified.contains(sender)
            || self.pow_in_flight.contains(sender)
            || self.trust_balance(sender) >= self.config.valid_pow_reward
        {
            return;
        }
        if !self.rng.gen_bool(self.config.pow_sample_rate) {
            return;
        }
        trace!(peer = %sender, "sampling identity proof-of-work");
        self.pow_in_flight.insert(sender.clone());
        self.pending_pow.push(PowCheck { peer: sender.clone(), public_key });
    }
}

impl std::fmt::Debug for Arbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arbiter")
            .field("self_id", &self.self_id)
            .field("tracked_peers", &self.trust.len())
            .field("pending_pow", &self.pending_pow.len())
            .finish_non_exhaustive()
    }
}
