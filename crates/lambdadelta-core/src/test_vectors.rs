//! Test vectors for cross-implementation validation
//!
//! These vectors MUST be reproduced exactly by any other implementation of
//! the event identity derivation.

use crate::canonical::canonical_bytes;
use crate::crypto::*;
use crate::types::*;
use serde::Serialize;

/// Test vector output format (JSON serializable)
#[derive(Serialize)]
pub struct TestVector {
    pub name: String,
    pub description: String,
    pub inputs: serde_json::Value,
    pub canonical_bytes_hex: String,
    pub hash_hex: String,
}

/// Generate all test vectors as JSON
pub fn generate_test_vectors() -> Vec<TestVector> {
    vec![event_id_vector(), topic_hash_vector()]
}

fn vector_header() -> EventHeader {
    EventHeader {
        event_type: "POST".into(),
        claimed: 1_700_000_000_000,
        payload_hash: payload_hash(b"hello lambdadelta"),
    }
}

fn event_id_vector() -> TestVector {
    let header = vector_header();
    let id = event_id("board", &header);

    TestVector {
        name: "event_id_derivation".into(),
        description: "eventID = SHA256(topic || eventType || claimed || payloadHash)".into(),
        inputs: serde_json::json!({
            "topic": "board",
            "event_type": header.event_type,
            "claimed": header.claimed,
            "payload_hash": header.payload_hash,
        }),
        canonical_bytes_hex: hex::encode(canonical_bytes(&header).unwrap()),
        hash_hex: id.to_hex(),
    }
}

fn topic_hash_vector() -> TestVector {
    TestVector {
        name: "topic_hash".into(),
        description: "topicHash = hex(SHA256(topic))".into(),
        inputs: serde_json::json!({ "topic": "board" }),
        canonical_bytes_hex: hex::encode(b"board"),
        hash_hex: topic_hash("board"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vectors_stable() {
        let first = serde_json::to_string(&generate_test_vectors()).unwrap();
        let second = serde_json::to_string(&generate_test_vectors()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_event_id_matches_manual_concatenation() {
        use sha2::{Digest, Sha256};

        let header = vector_header();
        let manual = Sha256::digest(
            format!(
                "board{}{}{}",
                header.event_type, header.claimed, header.payload_hash
            )
            .as_bytes(),
        );
        assert_eq!(event_id("board", &header).0.as_slice(), manual.as_slice());
    }

    #[test]
    fn test_known_payload_hash() {
        assert_eq!(
            payload_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
