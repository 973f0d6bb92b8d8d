//! Hash derivations for Lambdadelta
//!
//! Event identity uses SHA256 over the concatenated header fields so that
//! every implementation agrees on it. Internal derivations (RLN shares,
//! group roots) use BLAKE3 with domain separation prefixes.

use crate::types::*;
use sha2::{Digest, Sha256};

// =============================================================================
// DOMAIN SEPARATION PREFIXES
// =============================================================================

/// Domain prefix for identity commitments
pub const DOMAIN_COMMITMENT: &[u8] = b"rln-commitment";
/// Domain prefix for group roots
pub const DOMAIN_ROOT: &[u8] = b"rln-root";
/// Domain prefix for signal hashing
pub const DOMAIN_SIGNAL: &[u8] = b"rln-signal";
/// Domain prefix for external nullifier hashing
pub const DOMAIN_EXTERNAL: &[u8] = b"rln-external";
/// Domain prefix for the per-slot polynomial coefficient
pub const DOMAIN_COEFFICIENT: &[u8] = b"rln-a1";
/// Domain prefix for internal nullifiers
pub const DOMAIN_INTERNAL: &[u8] = b"rln-internal";
/// Domain prefix for identity secrets derived from seeds
pub const DOMAIN_SECRET: &[u8] = b"rln-secret";

// =============================================================================
// EVENT IDENTITY
// =============================================================================

/// Derive the event identity.
///
/// `eventID = SHA256(topic || eventType || claimed || payloadHash)` where
/// `claimed` is rendered in decimal.
pub fn event_id(topic: &str, header: &EventHeader) -> EventId {
    let mut hasher = Sha256::new();
    hasher.update(topic.as_bytes());
    hasher.update(header.event_type.as_bytes());
    hasher.update(header.claimed.to_string().as_bytes());
    hasher.update(header.payload_hash.as_bytes());
    EventId(hasher.finalize().into())
}

/// Lowercase hex SHA256 of a payload.
pub fn payload_hash(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Hex SHA256 of a topic, used to scope datastore keys.
pub fn topic_hash(topic: &str) -> String {
    hex::encode(Sha256::digest(topic.as_bytes()))
}

/// RLN identifier for events of `event_type` on `topic`.
pub fn rln_identifier(topic: &str, event_type: &str) -> String {
    format!("{topic}.{event_type}")
}

// =============================================================================
// EPOCHS
// =============================================================================

/// Index of the `epoch_secs`-long window containing `at`.
pub fn epoch(at: Timestamp, epoch_secs: u64) -> u64 {
    (at / 1000).checked_div(epoch_secs).unwrap_or(0)
}
