//! Event header protocol
//!
//! An event is admitted by an RLN proof whose signal is the hex event id and
//! whose identifier is `{topic}.{eventType}`. Verification checks that the
//! proof really covers this header and the configured rate-limit windows
//! before handing it to the RLN verifier.

use crate::clock::Clock;
use crate::config::EventTypeSpecs;
use lambdadelta_core::crypto::{event_id, rln_identifier};
use lambdadelta_core::{
    EventHeader, EventId, NullifierInput, Rln, RlnError, RlnProof, VerificationResult,
};
use thiserror::Error;
use tracing::trace;

/// Header verification failures that precede RLN verification
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderVerificationError {
    #[error("Hash mismatch: computed {computed}, proof signal {transmitted}")]
    HashMismatch { computed: String, transmitted: String },
    #[error("Unexpected RLN identifier: expected {expected}, got {found}")]
    UnexpectedRlnIdentifier { expected: String, found: String },
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
    #[error("Expected {expected} nullifiers, got {found}")]
    NullifierCountMismatch { expected: usize, found: usize },
    #[error("Nullifier {index}: expected message limit {expected}, got {found}")]
    UnexpectedMessageLimit { index: usize, expected: u32, found: u32 },
    #[error("Nullifier {index}: expected epoch {expected}, got {found}")]
    UnexpectedNullifier { index: usize, expected: u64, found: u64 },
}

/// Outcome of a header that passed the structural checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderVerification {
    pub event_id: EventId,
    pub result: VerificationResult,
}

/// Build the header for a payload and prove it.
///
/// `claimed` is the current time; `nullifiers` come from the message id
/// registry for the same event type.
pub fn create_event(
    rln: &dyn Rln,
    clock: &dyn Clock,
    topic: &str,
    event_type: &str,
    nullifiers: &[NullifierInput],
    payload_hash: String,
) -> Result<(EventHeader, RlnProof, EventId), RlnError> {
    let header = EventHeader {
        event_type: event_type.to_string(),
        claimed: clock.now_ms(),
        payload_hash,
    };
    let id = event_id(topic, &header);
    let proof = rln.create_proof(
        &id.to_hex(),
        nullifiers,
        &rln_identifier(topic, event_type),
        true,
    )?;
    Ok((header, proof, id))
}

/// Verify that `proof` admits `header` on `topic`.
///
/// Structural mismatches are errors. Otherwise the proof is submitted to
/// the RLN verifier and its result returned; `Duplicate` and `Breach` are
/// results, not errors.
pub fn verify_event_header(
    proof: &RlnProof,
    header: &EventHeader,
    topic: &str,
    specs: &EventTypeSpecs,
    rln: &dyn Rln,
) -> Result<HeaderVerification, HeaderVerificationError> {
    let id = event_id(topic, header);
    let computed = id.to_hex();
    if proof.signal != computed {
        return Err(HeaderVerificationError::HashMismatch {
            computed,
            transmitted: proof.signal.clone(),
        });
    }

    let expected = rln_identifier(topic, &header.event_type);
    if proof.rln_identifier != expected {
        return Err(HeaderVerificationError::UnexpectedRlnIdentifier {
            expected,
            found: proof.rln_identifier.clone(),
        });
    }

    let windows = specs
        .get(&header.event_type)
        .ok_or_else(|| HeaderVerificationError::UnknownEventType(header.event_type.clone()))?;
    if proof.external_nullifiers.len() != windows.len() {
        return Err(HeaderVerificationError::NullifierCountMismatch {
            expected: windows.len(),
            found: proof.external_nullifiers.len(),
        });
    }

    for (index, (window, external)) in windows.iter().zip(&proof.external_nullifiers).enumerate() {
        if external.message_limit != window.message_limit {
            return Err(HeaderVerificationError::UnexpectedMessageLimit {
                index,
                expected: window.message_limit,
                found: external.message_limit,
            });
        }
        let epoch = window.epoch_at(header.claimed);
        if external.nullifier != epoch {
            return Err(HeaderVerificationError::UnexpectedNullifier {
                index,
                expected: epoch,
                found: external.nullifier,
            });
        }
    }

    let result = rln.submit_proof(proof, Some(header.claimed));
    trace!("Header {} verified: {:?}", id, result);
    Ok(HeaderVerification { event_id: id, result })
}
