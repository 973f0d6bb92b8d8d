//! Canonical encoding for Lambdadelta
//!
//! All hashed, persisted and transmitted objects use postcard serialization:
//! - No maps/hashmaps in encoded types
//! - Field order is Rust struct field order
//! - Decoding rejects trailing bytes

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serialize a value to canonical bytes using postcard.
///
/// This is the normative encoding for hashing, storage and the wire.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Decode a value previously produced by [`canonical_bytes`].
pub fn from_canonical_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, rest) = postcard::take_from_bytes(bytes)?;
    if !rest.is_empty() {
        return Err(Error::Serialization(postcard::Error::DeserializeBadEncoding));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;

    fn header() -> EventHeader {
        EventHeader {
            event_type: "POST".into(),
            claimed: 1_700_000_000_000,
            payload_hash: "ab".repeat(32),
        }
    }

    #[test]
    fn test_canonical_bytes_deterministic() {
        let bytes1 = canonical_bytes(&header()).unwrap();
        let bytes2 = canonical_bytes(&header()).unwrap();
        assert_eq!(bytes1, bytes2);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = canonical_bytes(&header()).unwrap();
        bytes.push(0);
        assert!(from_canonical_bytes::<EventHeader>(&bytes).is_err());
    }

    #[test]
    fn test_peer_message_variants_decode() {
        let proof = RlnProof {
            signal: "00".into(),
            rln_identifier: "MEMBERCID".into(),
            external_nullifiers: vec![ExternalNullifier {
                nullifier: 7,
                message_limit: 1,
            }],
            shares: vec![RlnShare {
                y: 42,
                internal_nullifier: [9; 32],
            }],
            root: [1; 32],
            snark_proof: vec![],
        };
        let msg = PeerMessage::MembershipRenewal(MembershipRenewal {
            membership: proof,
            sent: 1_700_000_000_000,
        });
        let bytes = canonical_bytes(&msg).unwrap();
        let decoded: PeerMessage = from_canonical_bytes(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }
}
