//! Rate-Limiting Nullifier boundary
//!
//! [`Rln`] is the contract the rest of the protocol relies on: create a
//! proof for a signal under a set of rate-limit slots, and submit a proof
//! for verification, which also performs double-signal (Sybil) detection.
//!
//! [`TransparentRln`] is a development backend. It implements the Shamir
//! share arithmetic of RLN over the prime field `2^61 - 1` so duplicate
//! detection, breach detection and slashing behave exactly as with a real
//! prover, but its proof bytes carry the identity commitment in the clear.
//! It is not zero-knowledge.

use crate::canonical::{canonical_bytes, from_canonical_bytes};
use crate::crypto::*;
use crate::types::*;
use blake3::Hasher;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

/// Field modulus (Mersenne prime 2^61 - 1)
const FIELD_PRIME: u64 = (1 << 61) - 1;

/// Number of recent group roots accepted by the verifier
const ROOT_HISTORY: usize = 8;

/// Maximum cached proofs before the cache is reset
const MAX_CACHED_PROOFS: usize = 4096;

/// RLN errors
#[derive(Debug, Error)]
pub enum RlnError {
    #[error("no identity configured for proving")]
    NoIdentity,
    #[error("identity commitment is not a member of the group")]
    NotRegistered,
    #[error("no nullifiers supplied")]
    EmptyNullifiers,
    #[error("message id {message_id} out of range (limit {message_limit})")]
    MessageIdOutOfRange { message_id: u32, message_limit: u32 },
    #[error("group file error: {0}")]
    GroupFile(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] crate::error::Error),
}

/// Prover/verifier contract for anonymous rate-limited proofs.
pub trait Rln: Send + Sync {
    /// Create a proof over `signal` for every slot in `nullifiers`.
    ///
    /// With `check_cache`, an identical earlier request returns the cached
    /// proof instead of proving again.
    fn create_proof(
        &self,
        signal: &str,
        nullifiers: &[NullifierInput],
        rln_identifier: &str,
        check_cache: bool,
    ) -> Result<RlnProof, RlnError>;

    /// Verify a proof and record its nullifiers.
    ///
    /// A second signal on an already used slot yields `Breach` and slashes
    /// the author as a side effect.
    fn submit_proof(&self, proof: &RlnProof, claimed: Option<Timestamp>) -> VerificationResult;

    /// Drop nullifier records for proofs claimed before `before`.
    fn forget_before(&self, _before: Timestamp) -> usize {
        0
    }
}

// =============================================================================
// FIELD ARITHMETIC
// =============================================================================

fn add(a: u64, b: u64) -> u64 {
    ((a as u128 + b as u128) % FIELD_PRIME as u128) as u64
}

fn sub(a: u64, b: u64) -> u64 {
    add(a, FIELD_PRIME - (b % FIELD_PRIME))
}

fn mul(a: u64, b: u64) -> u64 {
    ((a as u128 * b as u128) % FIELD_PRIME as u128) as u64
}

fn pow(mut base: u64, mut exp: u64) -> u64 {
    let mut acc = 1;
    base %= FIELD_PRIME;
    while exp > 0 {
        if exp & 1 == 1 {
            acc = mul(acc, base);
        }
        base = mul(base, base);
        exp >>= 1;
    }
    acc
}

fn inv(a: u64) -> u64 {
    pow(a, FIELD_PRIME - 2)
}

fn hash_to_field(parts: &[&[u8]]) -> u64 {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(word) % FIELD_PRIME
}

fn signal_hash(signal: &str) -> u64 {
    hash_to_field(&[DOMAIN_SIGNAL, signal.as_bytes()])
}

fn external_hash(rln_identifier: &str, nullifier: u64) -> u64 {
    hash_to_field(&[
        DOMAIN_EXTERNAL,
        rln_identifier.as_bytes(),
        &nullifier.to_le_bytes(),
    ])
}

fn commitment_of(secret: u64) -> Bytes32 {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_COMMITMENT);
    hasher.update(&secret.to_le_bytes());
    *hasher.finalize().as_bytes()
}

fn internal_nullifier(a1: u64) -> Bytes32 {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_INTERNAL);
    hasher.update(&a1.to_le_bytes());
    *hasher.finalize().as_bytes()
}

/// Recover the identity secret from two shares on the same line.
fn recover_secret(x1: u64, y1: u64, x2: u64, y2: u64) -> u64 {
    let a1 = mul(sub(y1, y2), inv(sub(x1, x2)));
    sub(y1, mul(a1, x1))
}

// =============================================================================
// IDENTITY AND GROUP
// =============================================================================

/// Secret RLN identity.
#[derive(Clone)]
pub struct RlnIdentity {
    secret: u64,
}

impl RlnIdentity {
    /// Generate a random identity
    pub fn generate() -> Self {
        Self {
            secret: rand::thread_rng().gen_range(1..FIELD_PRIME),
        }
    }

    /// Derive an identity from seed bytes (for deterministic testing)
    pub fn from_seed(seed: &[u8]) -> Self {
        let secret = hash_to_field(&[DOMAIN_SECRET, seed]).max(1);
        Self { secret }
    }

    /// Public identity commitment registered in the group
    pub fn commitment(&self) -> Bytes32 {
        commitment_of(self.secret)
    }
}

impl std::fmt::Debug for RlnIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RlnIdentity({})", hex::encode(&self.commitment()[..8]))
    }
}

/// On-disk group file format
#[derive(Debug, Serialize, Deserialize)]
struct GroupFile {
    commitments: Vec<String>,
}

/// Registered identity commitments.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RlnGroup {
    /// Sorted and deduped
    commitments: Vec<Bytes32>,
}

impl RlnGroup {
    pub fn new(commitments: impl IntoIterator<Item = Bytes32>) -> Self {
        let mut commitments: Vec<Bytes32> = commitments.into_iter().collect();
        commitments.sort();
        commitments.dedup();
        Self { commitments }
    }

    /// Parse a JSON group file: `{"commitments": ["<hex>", ...]}`
    pub fn from_json(json: &str) -> Result<Self, RlnError> {
        let file: GroupFile =
            serde_json::from_str(json).map_err(|e| RlnError::GroupFile(e.to_string()))?;
        let mut commitments = Vec::with_capacity(file.commitments.len());
        for entry in &file.commitments {
            let bytes = hex::decode(entry).map_err(|e| RlnError::GroupFile(e.to_string()))?;
            let commitment: Bytes32 = bytes
                .try_into()
                .map_err(|_| RlnError::GroupFile(format!("bad commitment length: {entry}")))?;
            commitments.push(commitment);
        }
        Ok(Self::new(commitments))
    }

    /// Load a JSON group file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RlnError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Render as a JSON group file
    pub fn to_json(&self) -> String {
        let file = GroupFile {
            commitments: self.commitments.iter().map(hex::encode).collect(),
        };
        serde_json::to_string_pretty(&file).unwrap_or_default()
    }

    /// Root over the sorted commitments
    pub fn root(&self) -> Bytes32 {
        let mut hasher = Hasher::new();
        hasher.update(DOMAIN_ROOT);
        for commitment in &self.commitments {
            hasher.update(commitment);
        }
        *hasher.finalize().as_bytes()
    }

    pub fn contains(&self, commitment: &Bytes32) -> bool {
        self.commitments.binary_search(commitment).is_ok()
    }

    pub fn insert(&mut self, commitment: Bytes32) -> bool {
        match self.commitments.binary_search(&commitment) {
            Ok(_) => false,
            Err(pos) => {
                self.commitments.insert(pos, commitment);
                true
            }
        }
    }

    pub fn remove(&mut self, commitment: &Bytes32) -> bool {
        match self.commitments.binary_search(commitment) {
            Ok(pos) => {
                self.commitments.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.commitments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commitments.is_empty()
    }
}

// =============================================================================
// TRANSPARENT BACKEND
// =============================================================================

/// Proof bytes of the transparent backend
#[derive(Debug, Serialize, Deserialize)]
struct TransparentWitness {
    commitment: Bytes32,
    message_ids: Vec<u32>,
    binding: Bytes32,
}

fn witness_binding(
    commitment: &Bytes32,
    message_ids: &[u32],
    signal: &str,
    rln_identifier: &str,
    external: &[ExternalNullifier],
    shares: &[RlnShare],
    root: &Bytes32,
) -> Result<Bytes32, RlnError> {
    let mut hasher = Hasher::new();
    hasher.update(b"rln-binding");
    hasher.update(commitment);
    hasher.update(&canonical_bytes(&message_ids)?);
    hasher.update(signal.as_bytes());
    hasher.update(rln_identifier.as_bytes());
    hasher.update(&canonical_bytes(&external)?);
    hasher.update(&canonical_bytes(&shares)?);
    hasher.update(root);
    Ok(*hasher.finalize().as_bytes())
}

/// A member removed from the group after a breach
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlashedMember {
    pub commitment: Bytes32,
    pub rln_identifier: String,
}

#[derive(Clone, Copy, Debug)]
struct KnownShare {
    x: u64,
    y: u64,
    claimed: Option<Timestamp>,
}

struct RlnState {
    group: RlnGroup,
    roots: VecDeque<Bytes32>,
    /// internal nullifier -> shares seen for it
    known: HashMap<Bytes32, Vec<KnownShare>>,
    slashed: Vec<SlashedMember>,
    proof_cache: HashMap<Bytes32, RlnProof>,
}

impl RlnState {
    fn push_root(&mut self) {
        let root = self.group.root();
        if self.roots.back() != Some(&root) {
            self.roots.push_back(root);
        }
        while self.roots.len() > ROOT_HISTORY {
            self.roots.pop_front();
        }
    }
}

/// Development RLN prover/verifier with real slashing arithmetic.
///
/// All state (group, recent roots, known nullifiers, proof cache) is owned
/// by the instance and lives as long as it does.
pub struct TransparentRln {
    identity: Option<RlnIdentity>,
    state: Mutex<RlnState>,
}

impl TransparentRln {
    /// Create a prover/verifier for `identity` over `group`
    pub fn new(identity: Option<RlnIdentity>, group: RlnGroup) -> Self {
        let mut state = RlnState {
            group,
            roots: VecDeque::new(),
            known: HashMap::new(),
            slashed: Vec::new(),
            proof_cache: HashMap::new(),
        };
        state.push_root();
        Self {
            identity,
            state: Mutex::new(state),
        }
    }

    /// Verifier-only instance
    pub fn verifier(group: RlnGroup) -> Self {
        Self::new(None, group)
    }

    /// Current group root
    pub fn root(&self) -> Bytes32 {
        self.state.lock().group.root()
    }

    /// Current group
    pub fn group(&self) -> RlnGroup {
        self.state.lock().group.clone()
    }

    /// Register a new member
    pub fn add_member(&self, commitment: Bytes32) {
        let mut state = self.state.lock();
        if state.group.insert(commitment) {
            state.push_root();
        }
    }

    /// Members slashed so far
    pub fn slashed(&self) -> Vec<SlashedMember> {
        self.state.lock().slashed.clone()
    }

    fn cache_key(signal: &str, nullifiers: &[NullifierInput], rln_identifier: &str) -> Result<Bytes32, RlnError> {
        let mut hasher = Hasher::new();
        hasher.update(signal.as_bytes());
        hasher.update(rln_identifier.as_bytes());
        hasher.update(&canonical_bytes(&nullifiers)?);
        Ok(*hasher.finalize().as_bytes())
    }
}

impl Rln for TransparentRln {
    fn create_proof(
        &self,
        signal: &str,
        nullifiers: &[NullifierInput],
        rln_identifier: &str,
        check_cache: bool,
    ) -> Result<RlnProof, RlnError> {
        let identity = self.identity.as_ref().ok_or(RlnError::NoIdentity)?;
        if nullifiers.is_empty() {
            return Err(RlnError::EmptyNullifiers);
        }
        for n in nullifiers {
            if n.message_id >= n.message_limit {
                return Err(RlnError::MessageIdOutOfRange {
                    message_id: n.message_id,
                    message_limit: n.message_limit,
                });
            }
        }

        let key = Self::cache_key(signal, nullifiers, rln_identifier)?;
        let mut state = self.state.lock();
        if check_cache {
            if let Some(proof) = state.proof_cache.get(&key) {
                return Ok(proof.clone());
            }
        }

        let commitment = identity.commitment();
        if !state.group.contains(&commitment) {
            return Err(RlnError::NotRegistered);
        }

        let x = signal_hash(signal);
        let a0 = identity.secret;
        let shares: Vec<RlnShare> = nullifiers
            .iter()
            .map(|n| {
                let ext = external_hash(rln_identifier, n.nullifier);
                let a1 = hash_to_field(&[
                    DOMAIN_COEFFICIENT,
                    &a0.to_le_bytes(),
                    &ext.to_le_bytes(),
                    &n.message_id.to_le_bytes(),
                ]);
                RlnShare {
                    y: add(a0, mul(a1, x)),
                    internal_nullifier: internal_nullifier(a1),
                }
            })
            .collect();

        let external: Vec<ExternalNullifier> = nullifiers.iter().map(|n| n.external()).collect();
        let message_ids: Vec<u32> = nullifiers.iter().map(|n| n.message_id).collect();
        let root = state.group.root();
        let binding = witness_binding(
            &commitment,
            &message_ids,
            signal,
            rln_identifier,
            &external,
            &shares,
            &root,
        )?;
        let witness = TransparentWitness {
            commitment,
            message_ids,
            binding,
        };

        let proof = RlnProof {
            signal: signal.to_string(),
            rln_identifier: rln_identifier.to_string(),
            external_nullifiers: external,
            shares,
            root,
            snark_proof: canonical_bytes(&witness)?,
        };

        if state.proof_cache.len() >= MAX_CACHED_PROOFS {
            state.proof_cache.clear();
        }
        state.proof_cache.insert(key, proof.clone());
        Ok(proof)
    }

    fn submit_proof(&self, proof: &RlnProof, claimed: Option<Timestamp>) -> VerificationResult {
        if proof.shares.is_empty() || proof.shares.len() != proof.external_nullifiers.len() {
            return VerificationResult::Invalid;
        }
        let witness: TransparentWitness = match from_canonical_bytes(&proof.snark_proof) {
            Ok(w) => w,
            Err(_) => return VerificationResult::Invalid,
        };
        if witness.message_ids.len() != proof.shares.len() {
            return VerificationResult::Invalid;
        }
        if witness
            .message_ids
            .iter()
            .zip(&proof.external_nullifiers)
            .any(|(id, ext)| *id >= ext.message_limit)
        {
            return VerificationResult::OutOfRange;
        }
        match witness_binding(
            &witness.commitment,
            &witness.message_ids,
            &proof.signal,
            &proof.rln_identifier,
            &proof.external_nullifiers,
            &proof.shares,
            &proof.root,
        ) {
            Ok(binding) if binding == witness.binding => {}
            _ => return VerificationResult::Invalid,
        }

        let x = signal_hash(&proof.signal);
        let mut state = self.state.lock();

        let all_seen = proof.shares.iter().all(|share| {
            state
                .known
                .get(&share.internal_nullifier)
                .map(|seen| seen.iter().any(|k| k.x == x))
                .unwrap_or(false)
        });
        if all_seen {
            return VerificationResult::Duplicate;
        }
        if !state.roots.contains(&proof.root) {
            return VerificationResult::MissingRoot;
        }
        if !state.group.contains(&witness.commitment) {
            return VerificationResult::Invalid;
        }

        let mut recovered = None;
        for share in &proof.shares {
            let seen = state.known.entry(share.internal_nullifier).or_default();
            if recovered.is_none() {
                if let Some(prev) = seen.iter().find(|k| k.x != x) {
                    recovered = Some(recover_secret(prev.x, prev.y, x, share.y));
                }
            }
            if !seen.iter().any(|k| k.x == x) {
                seen.push(KnownShare {
                    x,
                    y: share.y,
                    claimed,
                });
            }
        }

        match recovered {
            Some(secret) => {
                let commitment = commitment_of(secret);
                if state.group.remove(&commitment) {
                    state.push_root();
                }
                warn!(
                    "RLN breach on {}: slashed member {}",
                    proof.rln_identifier,
                    hex::encode(&commitment[..8])
                );
                state.slashed.push(SlashedMember {
                    commitment,
                    rln_identifier: proof.rln_identifier.clone(),
                });
                VerificationResult::Breach
            }
            None => VerificationResult::Valid,
        }
    }

    fn forget_before(&self, before: Timestamp) -> usize {
        let mut state = self.state.lock();
        let mut removed = 0;
        state.known.retain(|_, seen| {
            let len = seen.len();
            seen.retain(|k| k.claimed.map_or(true, |c| c >= before));
            removed += len - seen.len();
            !seen.is_empty()
        });
        if removed > 0 {
            debug!("Forgot {} nullifier records", removed);
        }
        removed
    }
}
