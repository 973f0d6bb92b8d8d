//! Core protocol types for Lambdadelta
//!
//! All types here are designed for deterministic serialization via postcard.
//! Field order matters for canonical encoding.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-byte fixed-size array used for hashes and identifiers.
pub type Bytes32 = [u8; 32];

/// Unix time in milliseconds.
pub type Timestamp = u64;

// =============================================================================
// IDENTITY TYPES (newtypes for type safety)
// =============================================================================

/// Event identifier: SHA256(topic || eventType || claimed || payloadHash)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub Bytes32);

impl EventId {
    /// Lowercase hex rendering, used as the RLN signal for event proofs.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        parse_bytes32(s).map(Self)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Pseudonymous member identifier.
///
/// Equal to the internal nullifier of the member's MemberCID proof, so it is
/// stable for one membership epoch and unlinkable across epochs.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(pub Bytes32);

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

fn parse_bytes32(s: &str) -> Result<Bytes32> {
    let bytes = hex::decode(s).map_err(|_| Error::InvalidHex(s.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| Error::InvalidHex(s.to_string()))
}

// =============================================================================
// EVENT HEADER
// =============================================================================

/// Immutable event header. Its hash (with the topic) is the event identity.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventHeader {
    pub event_type: String,
    /// Author-asserted creation time
    pub claimed: Timestamp,
    /// Lowercase hex SHA256 of the payload
    pub payload_hash: String,
}

// =============================================================================
// RATE LIMITS
// =============================================================================

/// One rate-limit window for an event type.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NullifierSpec {
    /// Window length in seconds
    pub epoch_secs: u64,
    /// Messages allowed per window
    pub message_limit: u32,
}

impl NullifierSpec {
    pub fn new(epoch_secs: u64, message_limit: u32) -> Self {
        Self {
            epoch_secs,
            message_limit,
        }
    }

    /// Window index containing `at`.
    pub fn epoch_at(&self, at: Timestamp) -> u64 {
        crate::crypto::epoch(at, self.epoch_secs)
    }
}

/// Prover input for one rate-limit slot.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NullifierInput {
    /// Epoch index of the window
    pub nullifier: u64,
    pub message_limit: u32,
    pub message_id: u32,
}

impl NullifierInput {
    pub fn external(&self) -> ExternalNullifier {
        ExternalNullifier {
            nullifier: self.nullifier,
            message_limit: self.message_limit,
        }
    }
}

/// Public half of a nullifier input, carried in proofs.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ExternalNullifier {
    pub nullifier: u64,
    pub message_limit: u32,
}

// =============================================================================
// RLN PROOFS
// =============================================================================

/// Public outputs of an RLN proof for one external nullifier.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RlnShare {
    /// Shamir share evaluated at the signal hash
    pub y: u64,
    /// Slot identifier; reuse with a different signal reveals the secret
    pub internal_nullifier: Bytes32,
}

/// Full RLN proof bound to a signal.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RlnProof {
    /// Event ID hex, or the peer public key hex for membership proofs
    pub signal: String,
    pub rln_identifier: String,
    pub external_nullifiers: Vec<ExternalNullifier>,
    /// One share per external nullifier, same order
    pub shares: Vec<RlnShare>,
    /// Group root the proof was generated against
    pub root: Bytes32,
    /// Backend-specific proof bytes
    pub snark_proof: Vec<u8>,
}

impl RlnProof {
    /// Pseudonym derived from the first share's internal nullifier.
    pub fn member_id(&self) -> Option<MemberId> {
        self.shares.first().map(|s| MemberId(s.internal_nullifier))
    }

    /// Digest over the canonical encoding, used for caching and signatures.
    pub fn digest(&self) -> Result<Bytes32> {
        let bytes = crate::canonical::canonical_bytes(self)?;
        Ok(*blake3::hash(&bytes).as_bytes())
    }
}

/// Outcome of submitting a proof to an RLN verifier.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum VerificationResult {
    Valid,
    Invalid,
    MissingRoot,
    OutOfRange,
    /// Same nullifier and signal seen before
    Duplicate,
    /// Same nullifier with a different signal: the author was slashed
    Breach,
}

impl VerificationResult {
    /// Valid or a repeat of something already valid.
    pub fn is_acceptable(&self) -> bool {
        matches!(self, Self::Valid | Self::Duplicate)
    }
}

// =============================================================================
// EVENTS
// =============================================================================

/// Header, proof and (optionally) payload of one event.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedEvent {
    pub header: EventHeader,
    pub proof: RlnProof,
    pub payload: Option<Vec<u8>>,
}

/// A published event with this node's received-time vote.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishedEvent {
    pub event_id: EventId,
    pub event: SignedEvent,
    pub received: Timestamp,
}

// =============================================================================
// WIRE MESSAGES
// =============================================================================

/// Event carried through the Dandelion++ stem phase.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayedEvent {
    pub topic: String,
    pub event_id: EventId,
    pub header: EventHeader,
    pub proof: RlnProof,
    pub payload: Option<Vec<u8>>,
}

impl RelayedEvent {
    pub fn into_signed(self) -> SignedEvent {
        SignedEvent {
            header: self.header,
            proof: self.proof,
            payload: self.payload,
        }
    }
}

/// An event together with the sender's membership proof and vote.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventMessage {
    pub membership: RlnProof,
    pub event: SignedEvent,
    /// Sender's received time for the event
    pub received: Timestamp,
}

/// A bare membership announcement.
///
/// `sent` makes every announcement a distinct message, so repeats within
/// one epoch are not dropped as duplicates by the pubsub layer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MembershipRenewal {
    pub membership: RlnProof,
    pub sent: Timestamp,
}

/// Messages exchanged over the topic pubsub and direct sync streams.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum PeerMessage {
    Event(EventMessage),
    MembershipRenewal(MembershipRenewal),
}

/// Opening message of every direct protocol stream.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Handshake {
    /// Sender's transport public key
    pub pubkey: Bytes32,
    pub membership: RlnProof,
    /// Ed25519 signature by `pubkey` over the membership proof digest
    pub signature: Vec<u8>,
}
