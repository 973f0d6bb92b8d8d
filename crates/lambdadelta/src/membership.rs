//! Membership tracking and MemberCID proofs
//!
//! A member proves group membership once per membership epoch with an RLN
//! proof under the `MEMBERCID` identifier whose signal is its transport
//! public key. The first internal nullifier of that proof is the member's
//! pseudonym for the epoch. Two different keys proven by one identity in an
//! epoch is a breach and gets the identity slashed.

use crate::clock::Clock;
use crate::storage::{Datastore, DatastoreExt, KeySpace, StorageError};
use lambdadelta_core::{
    Handshake, MemberId, NullifierInput, Rln, RlnError, RlnProof, Timestamp, VerificationResult,
};
use lambdadelta_net::{CryptoError, KeyPair, PeerId};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// RLN identifier of membership proofs
pub const MEMBERCID_IDENTIFIER: &str = "MEMBERCID";

/// Membership errors
#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("Membership proof signal does not match the peer key")]
    WrongSignal,
    #[error("Unexpected RLN identifier: {0}")]
    WrongIdentifier(String),
    #[error("Membership proof must carry a single nullifier with limit 1")]
    WrongMessageLimit,
    #[error("Membership epoch {epoch} outside tolerance of {current}")]
    EpochOutOfRange { epoch: u64, current: u64 },
    #[error("Membership proof has no shares")]
    NoShares,
    #[error("Membership proof rejected: {0:?}")]
    Proof(VerificationResult),
    #[error("Member banned: {0}")]
    Banned(MemberId),
    #[error("Handshake key does not match the connection")]
    KeyMismatch,
    #[error("Handshake signature: {0}")]
    Signature(#[from] CryptoError),
    #[error("RLN error: {0}")]
    Rln(#[from] RlnError),
    #[error("Encoding error: {0}")]
    Encoding(#[from] lambdadelta_core::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl MembershipError {
    /// Whether the error proves misbehaviour by whoever presented the proof
    pub fn is_violation(&self) -> bool {
        !matches!(
            self,
            Self::Rln(_) | Self::Encoding(_) | Self::Storage(_) | Self::Banned(_)
        )
    }
}

/// Epoch window accepted for membership proofs
#[derive(Debug, Clone, Copy)]
pub struct MemberCidPolicy {
    pub epoch_secs: u64,
    pub tolerance: u64,
}

impl MemberCidPolicy {
    pub fn epoch_at(&self, at: Timestamp) -> u64 {
        lambdadelta_core::crypto::epoch(at, self.epoch_secs)
    }

    fn epoch_start(&self, epoch: u64) -> Timestamp {
        epoch.saturating_mul(self.epoch_secs).saturating_mul(1000)
    }
}

/// Prove membership for `pubkey` in `epoch`
pub fn generate_member_cid(pubkey: &PeerId, rln: &dyn Rln, epoch: u64) -> Result<RlnProof, RlnError> {
    let nullifier = NullifierInput {
        nullifier: epoch,
        message_limit: 1,
        message_id: 0,
    };
    rln.create_proof(&pubkey.to_hex(), &[nullifier], MEMBERCID_IDENTIFIER, true)
}

/// Verify a membership proof and return the member pseudonym.
///
/// With `pubkey`, the proof signal must be that key. Gossip messages carry
/// the author's proof through other peers, so there the key is unknown and
/// only the proof itself is checked.
pub fn verify_member_cid_proof(
    proof: &RlnProof,
    pubkey: Option<&PeerId>,
    rln: &dyn Rln,
    policy: MemberCidPolicy,
    now: Timestamp,
) -> Result<MemberId, MembershipError> {
    match pubkey {
        Some(pubkey) if proof.signal != pubkey.to_hex() => return Err(MembershipError::WrongSignal),
        None if hex::decode(&proof.signal).map_or(true, |k| k.len() != 32) => {
            return Err(MembershipError::WrongSignal)
        }
        _ => {}
    }
    if proof.rln_identifier != MEMBERCID_IDENTIFIER {
        return Err(MembershipError::WrongIdentifier(proof.rln_identifier.clone()));
    }
    let [external] = proof.external_nullifiers.as_slice() else {
        return Err(MembershipError::WrongMessageLimit);
    };
    if external.message_limit != 1 {
        return Err(MembershipError::WrongMessageLimit);
    }

    let current = policy.epoch_at(now);
    if external.nullifier.abs_diff(current) > policy.tolerance {
        return Err(MembershipError::EpochOutOfRange {
            epoch: external.nullifier,
            current,
        });
    }

    let member = proof.member_id().ok_or(MembershipError::NoShares)?;
    match rln.submit_proof(proof, Some(policy.epoch_start(external.nullifier))) {
        result if result.is_acceptable() => Ok(member),
        result => Err(MembershipError::Proof(result)),
    }
}

/// This node's membership proof, regenerated once per epoch
pub struct LocalMembership {
    keypair: KeyPair,
    rln: Arc<dyn Rln>,
    clock: Arc<dyn Clock>,
    policy: MemberCidPolicy,
    store: Arc<dyn Datastore>,
    keys: KeySpace,
    current: Mutex<Option<(u64, RlnProof)>>,
}

impl LocalMembership {
    pub fn new(
        keypair: KeyPair,
        rln: Arc<dyn Rln>,
        clock: Arc<dyn Clock>,
        policy: MemberCidPolicy,
        store: Arc<dyn Datastore>,
        topic: &str,
    ) -> Self {
        Self {
            keypair,
            rln,
            clock,
            policy,
            store,
            keys: KeySpace::new("membercid", topic),
            current: Mutex::new(None),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.keypair.peer_id()
    }

    pub fn policy(&self) -> MemberCidPolicy {
        self.policy
    }

    /// Proof for the current epoch, with the epoch it was made for
    pub fn proof(&self) -> Result<(u64, RlnProof), MembershipError> {
        let epoch = self.policy.epoch_at(self.clock.now_ms());
        let mut current = self.current.lock();
        if let Some((cached_epoch, proof)) = current.as_ref() {
            if *cached_epoch == epoch {
                return Ok((epoch, proof.clone()));
            }
        }

        let key = self.keys.key(&["proof", &epoch.to_string()]);
        let proof = match self.store.get_value::<RlnProof>(&key)? {
            Some(proof) => proof,
            None => {
                let proof = generate_member_cid(&self.keypair.peer_id(), self.rln.as_ref(), epoch)?;
                self.store.put_value(&key, &proof)?;
                info!("Generated membership proof for epoch {}", epoch);
                proof
            }
        };
        // Record our own nullifier so a replay under another key is caught.
        let result = self
            .rln
            .submit_proof(&proof, Some(self.policy.epoch_start(epoch)));
        if !result.is_acceptable() {
            return Err(MembershipError::Proof(result));
        }

        *current = Some((epoch, proof.clone()));
        Ok((epoch, proof))
    }

    /// Current pseudonym
    pub fn member_id(&self) -> Result<MemberId, MembershipError> {
        let (_, proof) = self.proof()?;
        proof.member_id().ok_or(MembershipError::NoShares)
    }

    /// Opening message for direct streams
    pub fn handshake(&self) -> Result<Handshake, MembershipError> {
        let (_, membership) = self.proof()?;
        let signature = self.keypair.sign(&membership.digest()?).to_vec();
        Ok(Handshake {
            pubkey: self.keypair.public_key(),
            membership,
            signature,
        })
    }

    /// Verify a handshake received from `from`
    pub fn verify_handshake(&self, handshake: &Handshake, from: &PeerId) -> Result<MemberId, MembershipError> {
        if PeerId::from_public_key(&handshake.pubkey) != *from {
            return Err(MembershipError::KeyMismatch);
        }
        KeyPair::verify(&handshake.pubkey, &handshake.membership.digest()?, &handshake.signature)?;
        verify_member_cid_proof(
            &handshake.membership,
            Some(from),
            self.rln.as_ref(),
            self.policy,
            self.clock.now_ms(),
        )
    }
}

/// Member status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Active,
    Banned,
}

/// Member information
#[derive(Debug, Clone)]
pub struct Member {
    pub id: MemberId,
    pub status: MemberStatus,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    /// Number of events and votes attributed to the member
    pub event_count: u64,
}

/// Members seen on the topic, for the consensus quorum
pub struct MemberTracker {
    clock: Arc<dyn Clock>,
    /// Members seen within this window are active
    active_window_ms: u64,
    members: RwLock<HashMap<MemberId, Member>>,
    banned: RwLock<HashSet<MemberId>>,
}

impl MemberTracker {
    pub fn new(clock: Arc<dyn Clock>, active_window_ms: u64) -> Self {
        Self {
            clock,
            active_window_ms,
            members: RwLock::new(HashMap::new()),
            banned: RwLock::new(HashSet::new()),
        }
    }

    /// Record activity of a verified member
    pub fn observe(&self, id: MemberId) -> Result<(), MembershipError> {
        if self.banned.read().contains(&id) {
            return Err(MembershipError::Banned(id));
        }
        let now = self.clock.now_ms();
        let mut members = self.members.write();
        let member = members.entry(id).or_insert_with(|| {
            debug!("New member {}", id);
            Member {
                id,
                status: MemberStatus::Active,
                first_seen: now,
                last_seen: now,
                event_count: 0,
            }
        });
        member.last_seen = member.last_seen.max(now);
        Ok(())
    }

    /// Update member's event count
    pub fn record_event(&self, id: &MemberId) {
        if let Some(member) = self.members.write().get_mut(id) {
            member.event_count += 1;
        }
    }

    /// Ban a member permanently
    pub fn ban(&self, id: MemberId) {
        if self.banned.write().insert(id) {
            warn!("Banned member {}", id);
        }
        if let Some(member) = self.members.write().get_mut(&id) {
            member.status = MemberStatus::Banned;
        }
    }

    pub fn is_banned(&self, id: &MemberId) -> bool {
        self.banned.read().contains(id)
    }

    pub fn get(&self, id: &MemberId) -> Option<Member> {
        self.members.read().get(id).cloned()
    }

    /// Members seen within the active window, this node included
    pub fn active_count(&self) -> usize {
        let cutoff = self.clock.now_ms().saturating_sub(self.active_window_ms);
        self.members
            .read()
            .values()
            .filter(|m| m.status == MemberStatus::Active && m.last_seen >= cutoff)
            .count()
    }

    /// Forget members idle for more than twice the active window
    pub fn prune(&self) -> usize {
        let cutoff = self
            .clock
            .now_ms()
            .saturating_sub(self.active_window_ms.saturating_mul(2));
        let mut members = self.members.write();
        let before = members.len();
        members.retain(|_, m| m.status == MemberStatus::Banned || m.last_seen >= cutoff);
        before - members.len()
    }

    /// Get membership stats
    pub fn stats(&self) -> MembershipStats {
        let members = self.members.read();
        MembershipStats {
            total: members.len(),
            active: self.active_count_locked(&members),
            banned: self.banned.read().len(),
        }
    }

    fn active_count_locked(&self, members: &HashMap<MemberId, Member>) -> usize {
        let cutoff = self.clock.now_ms().saturating_sub(self.active_window_ms);
        members
            .values()
            .filter(|m| m.status == MemberStatus::Active && m.last_seen >= cutoff)
            .count()
    }
}

/// Membership statistics
#[derive(Debug, Clone)]
pub struct MembershipStats {
    pub total: usize,
    pub active: usize,
    pub banned: usize,
}
