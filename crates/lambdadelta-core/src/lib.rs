//! Lambdadelta Core Library
//!
//! This crate provides the core types, canonical encoding, timestamp
//! consensus and RLN boundary for the Lambdadelta event feed protocol.
//!
//! # Modules
//!
//! - [`types`]: Protocol types (EventHeader, RlnProof, wire messages, etc.)
//! - [`canonical`]: Deterministic serialization for hashing and the wire
//! - [`crypto`]: Event identity, topic hashing and epoch derivations
//! - [`consensus`]: Peer-voted consensus time calculation
//! - [`rln`]: Rate-Limiting Nullifier prover/verifier boundary
//! - [`error`]: Error types

pub mod canonical;
pub mod consensus;
pub mod crypto;
pub mod error;
pub mod rln;
pub mod types;

#[cfg(test)]
mod test_vectors;

pub use consensus::{calculate_consensus_time, ConsensusTime, DEFAULT_QUORUM};
pub use error::{Error, Result};
pub use rln::{Rln, RlnError, RlnGroup, RlnIdentity, TransparentRln};
pub use types::*;
