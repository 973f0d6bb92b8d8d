//! Network side of a feed: topic gossip, direct sync and membership renewal
//!
//! Every peer message carries the sender's MemberCID proof and is verified
//! before it reaches the feed. On the gossip path the check runs inside the
//! topic validator, so an invalid message is never propagated by an honest
//! node. On the direct path a subscriber is sent every event we published a
//! vote for, over a stream whose handshake binds the sender's membership to
//! its transport key.

use crate::clock::Clock;
use crate::config::{Config, EventTypeSpecs};
use crate::feed::{FeedError, LambdadeltaFeed, Outgoing, Vote};
use crate::handshake::{self, HandshakeError};
use crate::header::verify_event_header;
use crate::membership::{verify_member_cid_proof, LocalMembership, MemberTracker, MembershipError};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use lambdadelta_core::canonical::{canonical_bytes, from_canonical_bytes};
use lambdadelta_core::crypto::payload_hash;
use lambdadelta_core::{
    EventMessage, MemberId, MembershipRenewal, PeerMessage, PublishedEvent, Rln, RlnProof, SignedEvent, Timestamp,
    VerificationResult,
};
use lambdadelta_net::{
    Frame, FrameError, FrameType, GossipMessage, IncomingStream, Network, PeerEvent, PeerId,
    TopicValidator, TransportError, ValidationResult,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Protocol name of direct sync streams
pub const SYNC_PROTOCOL: &str = "/lambdadelta/sync/1.0.0";

/// Accepted gossip verdicts kept for delivery
const MAX_VALIDATED: usize = 4096;
/// Undelivered verdicts older than this are dropped
const VALIDATED_TTL: Duration = Duration::from_secs(60);

/// Sync protocol errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Encoding error: {0}")]
    Encoding(#[from] lambdadelta_core::Error),
    #[error("Membership error: {0}")]
    Membership(#[from] MembershipError),
    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),
    #[error("Stream error: {0}")]
    Stream(#[from] HandshakeError),
    #[error("Peer {peer} sent an invalid message: {reason}")]
    Rejected { peer: PeerId, reason: String },
}

/// Sync statistics
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub gossip_accepted: u64,
    pub gossip_rejected: u64,
    pub gossip_ignored: u64,
    pub breaches: u64,
    pub bans: u64,
    pub published: u64,
    pub renewals: u64,
    pub sessions: u64,
    pub events_sent: u64,
    pub events_received: u64,
}

/// A message that passed verification
#[derive(Debug, Clone)]
enum Validated {
    Event {
        member: MemberId,
        event: SignedEvent,
        received: Timestamp,
    },
    Renewal(MemberId),
}

#[derive(Debug)]
enum Verdict {
    Accept(Validated),
    /// Drop without penalty
    Ignore(String),
    /// Drop; `ban` is set when the message itself proves who misbehaved
    Reject { ban: Option<MemberId>, reason: String },
}

/// Protocol driver for one topic
pub struct LambdadeltaSync {
    topic: String,
    specs: EventTypeSpecs,
    network: Arc<dyn Network>,
    membership: Arc<LocalMembership>,
    tracker: Arc<MemberTracker>,
    rln: Arc<dyn Rln>,
    feed: Arc<LambdadeltaFeed>,
    clock: Arc<dyn Clock>,
    renewal_interval: Duration,
    active_window_ms: u64,
    dial_timeout: Duration,
    /// Verdicts of accepted gossip, keyed by message digest, awaiting delivery
    validated: Mutex<HashMap<[u8; 32], (Instant, Validated)>>,
    /// Epoch and time of the last message that carried our membership proof
    last_announced: Mutex<Option<(u64, Timestamp)>>,
    stats: RwLock<SyncStats>,
    shutdown_tx: broadcast::Sender<()>,
}

impl LambdadeltaSync {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        network: Arc<dyn Network>,
        membership: Arc<LocalMembership>,
        tracker: Arc<MemberTracker>,
        rln: Arc<dyn Rln>,
        feed: Arc<LambdadeltaFeed>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            topic: config.topic.clone(),
            specs: config.event_types.clone(),
            network,
            membership,
            tracker,
            rln,
            feed,
            clock,
            renewal_interval: config.renewal_interval(),
            active_window_ms: config.member_active_window_ms(),
            dial_timeout: config.dial_timeout(),
            validated: Mutex::new(HashMap::new()),
            last_announced: Mutex::new(None),
            stats: RwLock::new(SyncStats::default()),
            shutdown_tx,
        })
    }

    /// Join the topic and spawn the protocol tasks.
    ///
    /// `outgoing` is the feed's outgoing queue; our votes are gossiped from it.
    pub async fn start(self: &Arc<Self>, outgoing: mpsc::UnboundedReceiver<Outgoing>) -> Result<(), SyncError> {
        let incoming = self.network.handle(SYNC_PROTOCOL);
        let peer_events = self.network.peer_events();
        self.network.set_topic_validator(
            &self.topic,
            Arc::new(GossipValidator {
                sync: Arc::downgrade(self),
            }),
        );
        let gossip = self.network.subscribe(&self.topic).await?;

        self.spawn_accept_loop(incoming);
        self.spawn_peer_loop(peer_events);
        self.spawn_gossip_loop(gossip);
        self.spawn_outgoing_loop(outgoing);
        self.spawn_renewal_loop();
        info!("Sync started for topic {}", self.topic);
        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        self.network.unsubscribe(&self.topic).await;
    }

    fn spawn_accept_loop(self: &Arc<Self>, mut incoming: mpsc::Receiver<IncomingStream>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let sync = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    stream = incoming.recv() => {
                        let Some(stream) = stream else { break };
                        let Some(sync) = sync.upgrade() else { break };
                        tokio::spawn(async move {
                            let from = stream.from;
                            match sync.handle_stream(stream).await {
                                Ok(count) => debug!("Received {} events from {}", count, from),
                                Err(e) => warn!("Sync stream from {} failed: {}", from, e),
                            }
                        });
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    fn spawn_peer_loop(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let sync = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let Some(sync) = sync.upgrade() else { break };
                        if let PeerEvent::Subscribed { peer, topic } = event {
                            if topic != sync.topic {
                                continue;
                            }
                            tokio::spawn(async move {
                                match sync.sync_with(peer).await {
                                    Ok(count) => debug!("Sent {} events to {}", count, peer),
                                    Err(e) => warn!("Direct sync with {} failed: {}", peer, e),
                                }
                            });
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    fn spawn_gossip_loop(self: &Arc<Self>, mut gossip: mpsc::Receiver<GossipMessage>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let sync = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = gossip.recv() => {
                        let Some(message) = message else { break };
                        let Some(sync) = sync.upgrade() else { break };
                        sync.deliver_gossip(message);
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    fn spawn_outgoing_loop(self: &Arc<Self>, mut outgoing: mpsc::UnboundedReceiver<Outgoing>) {
        let sync = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(item) = outgoing.recv().await {
                let Outgoing::Publish(published) = item else { break };
                let Some(sync) = sync.upgrade() else { break };
                let id = published.event_id;
                if let Err(e) = sync.publish_event(published).await {
                    warn!("Publishing {} failed: {}", id, e);
                }
            }
            debug!("Outgoing queue closed");
        });
    }

    fn spawn_renewal_loop(self: &Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let sync = Arc::downgrade(self);
        let mut ticker = tokio::time::interval(self.renewal_interval);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(sync) = sync.upgrade() else { break };
                        if let Err(e) = sync.renew().await {
                            warn!("Membership renewal failed: {}", e);
                        }
                        let pruned = sync.tracker.prune();
                        if pruned > 0 {
                            debug!("Pruned {} idle members", pruned);
                        }
                        let dropped = sync.prune_validated();
                        if dropped > 0 {
                            debug!("Dropped {} undelivered gossip verdicts", dropped);
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    async fn publish_message(&self, message: &PeerMessage) -> Result<(), SyncError> {
        self.network
            .publish(&self.topic, canonical_bytes(message)?)
            .await?;
        Ok(())
    }

    /// Gossip our vote for an event along with our membership proof
    async fn publish_event(&self, published: PublishedEvent) -> Result<(), SyncError> {
        let (epoch, membership) = self.membership.proof()?;
        let message = PeerMessage::Event(EventMessage {
            membership,
            event: published.event,
            received: published.received,
        });
        self.publish_message(&message).await?;
        *self.last_announced.lock() = Some((epoch, self.clock.now_ms()));
        self.stats.write().published += 1;
        trace!("Published vote for {}", published.event_id);
        Ok(())
    }

    /// Broadcast a bare membership proof when peers would otherwise stop
    /// counting us as active before the next renewal tick.
    /// Returns whether a renewal was sent.
    pub async fn renew(&self) -> Result<bool, SyncError> {
        let (epoch, proof) = self.membership.proof()?;
        if let Some(member) = proof.member_id() {
            self.tracker.observe(member)?;
        }
        let now = self.clock.now_ms();
        if !self.renewal_due(epoch, now) {
            return Ok(false);
        }
        let renewal = MembershipRenewal {
            membership: proof,
            sent: now,
        };
        self.publish_message(&PeerMessage::MembershipRenewal(renewal))
            .await?;
        *self.last_announced.lock() = Some((epoch, now));
        self.stats.write().renewals += 1;
        debug!("Renewed membership for epoch {}", epoch);
        Ok(true)
    }

    /// Due on a new epoch, or when the next tick would land outside the
    /// active window opened by our last announcement.
    fn renewal_due(&self, epoch: u64, now: Timestamp) -> bool {
        match *self.last_announced.lock() {
            Some((last_epoch, at)) if last_epoch == epoch => {
                let interval = self.renewal_interval.as_millis() as u64;
                now.saturating_sub(at) + interval >= self.active_window_ms
            }
            _ => true,
        }
    }

    fn stash(&self, key: [u8; 32], validated: Validated) {
        let mut stash = self.validated.lock();
        if stash.len() >= MAX_VALIDATED {
            stash.retain(|_, (at, _)| at.elapsed() < VALIDATED_TTL);
        }
        // Delivery re-validates a message whose verdict was not kept.
        if stash.len() < MAX_VALIDATED {
            stash.insert(key, (Instant::now(), validated));
        }
    }

    /// Drop verdicts of messages the transport never delivered
    fn prune_validated(&self) -> usize {
        let mut stash = self.validated.lock();
        let before = stash.len();
        stash.retain(|_, (at, _)| at.elapsed() < VALIDATED_TTL);
        before - stash.len()
    }

    /// Validator hook: decide whether a gossip message may be delivered and propagated
    fn validate_gossip(&self, from: PeerId, data: &[u8]) -> ValidationResult {
        let message: PeerMessage = match from_canonical_bytes(data) {
            Ok(message) => message,
            Err(e) => {
                debug!("Undecodable gossip from {}: {}", from, e);
                self.stats.write().gossip_rejected += 1;
                return ValidationResult::Reject;
            }
        };
        match self.check_message(message, None) {
            Verdict::Accept(validated) => {
                self.stash(*blake3::hash(data).as_bytes(), validated);
                self.stats.write().gossip_accepted += 1;
                ValidationResult::Accept
            }
            Verdict::Ignore(reason) => {
                trace!("Ignoring gossip from {}: {}", from, reason);
                self.stats.write().gossip_ignored += 1;
                ValidationResult::Ignore
            }
            Verdict::Reject { ban, reason } => {
                debug!("Rejecting gossip from {}: {}", from, reason);
                if let Some(member) = ban {
                    self.ban(member, &reason);
                }
                self.stats.write().gossip_rejected += 1;
                ValidationResult::Reject
            }
        }
    }

    fn deliver_gossip(&self, message: GossipMessage) {
        let key = *blake3::hash(&message.data).as_bytes();
        let stashed = self.validated.lock().remove(&key).map(|(_, v)| v);
        let validated = match stashed {
            Some(validated) => validated,
            None => {
                if self.validate_gossip(message.from, &message.data) != ValidationResult::Accept {
                    return;
                }
                let Some((_, validated)) = self.validated.lock().remove(&key) else {
                    return;
                };
                validated
            }
        };

        match validated {
            Validated::Event {
                member,
                event,
                received,
            } => {
                if let Err(e) = self.feed.recv_event(event, Some(Vote { member, received }), true) {
                    warn!("Feed refused gossiped event: {}", e);
                }
            }
            Validated::Renewal(member) => trace!("Membership renewal from {}", member),
        }
    }

    /// Verify a peer message.
    ///
    /// `peer` is the sender's transport identity on direct streams; gossip
    /// is relayed by third parties, so there the membership proof is checked
    /// on its own.
    fn check_message(&self, message: PeerMessage, peer: Option<&PeerId>) -> Verdict {
        match message {
            PeerMessage::Event(EventMessage {
                membership,
                event,
                received,
            }) => match self.check_membership(&membership, peer) {
                Ok(member) => self.check_event(member, event, received),
                Err(verdict) => verdict,
            },
            PeerMessage::MembershipRenewal(renewal) => {
                let age = renewal.sent.abs_diff(self.clock.now_ms());
                if age > self.active_window_ms {
                    return Verdict::Ignore(format!("renewal sent {age}ms away from now"));
                }
                match self.check_membership(&renewal.membership, peer) {
                    Ok(member) => Verdict::Accept(Validated::Renewal(member)),
                    Err(verdict) => verdict,
                }
            }
        }
    }

    fn check_membership(&self, proof: &RlnProof, peer: Option<&PeerId>) -> Result<MemberId, Verdict> {
        let result = verify_member_cid_proof(
            proof,
            peer,
            self.rln.as_ref(),
            self.membership.policy(),
            self.clock.now_ms(),
        );
        match result {
            Ok(member) => {
                self.tracker.observe(member).map_err(|e| Verdict::Reject {
                    ban: None,
                    reason: e.to_string(),
                })?;
                Ok(member)
            }
            // Only a breach ties the pseudonym to the misbehaviour; any other
            // failure could be a doctored copy of someone else's proof.
            Err(e @ MembershipError::Proof(VerificationResult::Breach)) => {
                self.stats.write().breaches += 1;
                Err(Verdict::Reject {
                    ban: proof.member_id(),
                    reason: e.to_string(),
                })
            }
            Err(e) if e.is_violation() => Err(Verdict::Reject {
                ban: None,
                reason: e.to_string(),
            }),
            Err(e) => Err(Verdict::Ignore(e.to_string())),
        }
    }

    fn check_event(&self, member: MemberId, event: SignedEvent, received: Timestamp) -> Verdict {
        let Some(payload) = &event.payload else {
            return Verdict::Ignore("payload unavailable".into());
        };
        if payload_hash(payload) != event.header.payload_hash {
            return Verdict::Reject {
                ban: None,
                reason: "payload does not match header".into(),
            };
        }

        let verification = match verify_event_header(
            &event.proof,
            &event.header,
            &self.topic,
            &self.specs,
            self.rln.as_ref(),
        ) {
            Ok(verification) => verification,
            Err(e) => {
                return Verdict::Reject {
                    ban: None,
                    reason: e.to_string(),
                }
            }
        };
        match verification.result {
            result if result.is_acceptable() => Verdict::Accept(Validated::Event {
                member,
                event,
                received,
            }),
            VerificationResult::Breach => {
                warn!("Rate limit breach on event {}", verification.event_id);
                self.stats.write().breaches += 1;
                Verdict::Ignore(format!("breach on {}", verification.event_id))
            }
            result => Verdict::Reject {
                ban: None,
                reason: format!("event proof {:?}", result),
            },
        }
    }

    fn ban(&self, member: MemberId, reason: &str) {
        warn!("Banning member {}: {}", member, reason);
        self.tracker.ban(member);
        self.stats.write().bans += 1;
    }

    /// Send `peer` every event we published a vote for. Returns how many were sent.
    pub async fn sync_with(&self, peer: PeerId) -> Result<usize, SyncError> {
        let (mut stream, _) = handshake::initiate(
            self.network.as_ref(),
            peer,
            SYNC_PROTOCOL,
            &self.membership,
            &self.tracker,
            self.dial_timeout,
        )
        .await?;
        let (_, membership) = self.membership.proof()?;
        let published: Vec<PublishedEvent> = self
            .feed
            .published_events()
            .filter_map(|entry| match entry {
                Ok(published) => Some(published),
                Err(e) => {
                    warn!("Skipping unreadable published event: {}", e);
                    None
                }
            })
            .collect();

        let count = published.len();
        for published in published {
            let message = PeerMessage::Event(EventMessage {
                membership: membership.clone(),
                event: published.event,
                received: published.received,
            });
            stream
                .send(Frame::message(FrameType::SyncEvent, &message)?)
                .await?;
        }
        stream.send(Frame::empty(FrameType::SyncDone)).await?;
        stream.close().await?;

        let mut stats = self.stats.write();
        stats.sessions += 1;
        stats.events_sent += count as u64;
        Ok(count)
    }

    /// Receive a peer's published events. Any invalid message bans the peer's member.
    async fn handle_stream(&self, incoming: IncomingStream) -> Result<usize, SyncError> {
        let IncomingStream { from, mut stream, .. } = incoming;
        let sender = handshake::respond(&mut stream, from, &self.membership, &self.tracker).await?;

        let mut count = 0;
        while let Some(frame) = stream.next().await {
            let frame = frame?;
            if frame.frame_type == FrameType::SyncDone {
                break;
            }
            let message: PeerMessage = frame.decode(FrameType::SyncEvent)?;
            match self.check_message(message, Some(&from)) {
                Verdict::Accept(Validated::Event {
                    member,
                    event,
                    received,
                }) => {
                    self.feed
                        .recv_event(event, Some(Vote { member, received }), false)?;
                    count += 1;
                }
                Verdict::Accept(Validated::Renewal(_)) => {}
                Verdict::Ignore(reason) => trace!("Ignoring synced message from {}: {}", from, reason),
                Verdict::Reject { reason, .. } => {
                    self.ban(sender, &reason);
                    return Err(SyncError::Rejected { peer: from, reason });
                }
            }
        }

        let mut stats = self.stats.write();
        stats.sessions += 1;
        stats.events_received += count as u64;
        Ok(count)
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }
}

/// Topic validator holding the sync weakly; the network outlives it.
struct GossipValidator {
    sync: Weak<LambdadeltaSync>,
}

#[async_trait]
impl TopicValidator for GossipValidator {
    async fn validate(&self, from: PeerId, data: &[u8]) -> ValidationResult {
        match self.sync.upgrade() {
            Some(sync) => sync.validate_gossip(from, data),
            None => ValidationResult::Ignore,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::feed::FeedConfig;
    use crate::header::create_event;
    use crate::membership::MemberCidPolicy;
    use crate::storage::MemoryDatastore;
    use lambdadelta_core::{NullifierInput, RlnGroup, RlnIdentity, TransparentRln};
    use lambdadelta_net::{KeyPair, MemoryHub};

    const NOW: u64 = 1_700_000_000_000;

    struct Peer {
        sync: Arc<LambdadeltaSync>,
        feed: Arc<LambdadeltaFeed>,
        tracker: Arc<MemberTracker>,
        membership: Arc<LocalMembership>,
        rln: Arc<TransparentRln>,
        clock: Arc<ManualClock>,
        outgoing: Option<mpsc::UnboundedReceiver<Outgoing>>,
        peer: PeerId,
    }

    fn config() -> Config {
        Config {
            topic: "news".into(),
            ..Config::default()
        }
    }

    fn peer(hub: &MemoryHub, seed: u8, identity: RlnIdentity, group: &RlnGroup, clock: Arc<ManualClock>) -> Peer {
        let config = config();
        let keypair = KeyPair::from_seed(&[seed; 32]);
        let peer = keypair.peer_id();
        let network = hub.join(&keypair);
        let rln = Arc::new(TransparentRln::new(Some(identity), group.clone()));
        let store = Arc::new(MemoryDatastore::new());
        let tracker = Arc::new(MemberTracker::new(clock.clone(), config.member_active_window_ms()));
        let membership = Arc::new(LocalMembership::new(
            keypair,
            rln.clone(),
            clock.clone(),
            MemberCidPolicy {
                epoch_secs: config.membership_epoch_secs,
                tolerance: config.membership_epoch_tolerance,
            },
            store.clone(),
            &config.topic,
        ));
        let (feed, outgoing) = LambdadeltaFeed::new(
            &config.topic,
            FeedConfig::from(&config),
            store,
            clock.clone(),
            tracker.clone(),
            rln.clone(),
        )
        .unwrap();
        feed.start();
        let sync = LambdadeltaSync::new(
            &config,
            network,
            membership.clone(),
            tracker.clone(),
            rln.clone(),
            feed.clone(),
            clock.clone(),
        );
        Peer {
            sync,
            feed,
            tracker,
            membership,
            rln,
            clock,
            outgoing: Some(outgoing),
            peer,
        }
    }

    fn group(seeds: &[&[u8]]) -> (Vec<RlnIdentity>, RlnGroup) {
        let identities: Vec<RlnIdentity> = seeds.iter().map(|s| RlnIdentity::from_seed(s)).collect();
        let group = RlnGroup::new(identities.iter().map(|i| i.commitment()));
        (identities, group)
    }

    fn post(author: &Peer, body: &[u8], message_id: u32) -> SignedEvent {
        let claimed = author.clock.now_ms();
        let nullifiers: Vec<NullifierInput> = config().event_types["POST"]
            .iter()
            .map(|spec| NullifierInput {
                nullifier: spec.epoch_at(claimed),
                message_limit: spec.message_limit,
                message_id: message_id.min(spec.message_limit - 1),
            })
            .collect();
        let (header, proof, _) = create_event(
            author.rln.as_ref(),
            author.clock.as_ref(),
            "news",
            "POST",
            &nullifiers,
            payload_hash(body),
        )
        .unwrap();
        SignedEvent {
            header,
            proof,
            payload: Some(body.to_vec()),
        }
    }

    fn message(author: &Peer, event: SignedEvent) -> PeerMessage {
        PeerMessage::Event(EventMessage {
            membership: author.membership.proof().unwrap().1,
            received: event.header.claimed,
            event,
        })
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_valid_event_is_accepted() {
        let hub = MemoryHub::new();
        let clock = Arc::new(ManualClock::new(NOW));
        let (ids, group) = group(&[b"a", b"b"]);
        let a = peer(&hub, 1, ids[0].clone(), &group, clock.clone());
        let b = peer(&hub, 2, ids[1].clone(), &group, clock);

        let event = post(&a, b"hello", 0);
        let verdict = b.sync.check_message(message(&a, event), None);
        let Verdict::Accept(Validated::Event { member, .. }) = verdict else {
            panic!("expected accept, got {:?}", verdict);
        };
        assert_eq!(member, a.membership.member_id().unwrap());
        assert!(b.tracker.get(&member).is_some());
    }

    #[tokio::test]
    async fn test_invalid_events_are_rejected_without_ban() {
        let hub = MemoryHub::new();
        let clock = Arc::new(ManualClock::new(NOW));
        let (ids, group) = group(&[b"a", b"b"]);
        let a = peer(&hub, 1, ids[0].clone(), &group, clock.clone());
        let b = peer(&hub, 2, ids[1].clone(), &group, clock);
        let a_member = a.membership.member_id().unwrap();

        let mut backdated = post(&a, b"hello", 0);
        backdated.header.claimed -= 1;
        assert!(matches!(
            b.sync.check_message(message(&a, backdated), None),
            Verdict::Reject { ban: None, .. }
        ));

        let mut swapped = post(&a, b"hello", 0);
        swapped.payload = Some(b"other".to_vec());
        assert!(matches!(
            b.sync.check_message(message(&a, swapped), None),
            Verdict::Reject { ban: None, .. }
        ));

        let mut headless = post(&a, b"hello", 0);
        headless.payload = None;
        assert!(matches!(
            b.sync.check_message(message(&a, headless), None),
            Verdict::Ignore(_)
        ));
        assert!(!b.tracker.is_banned(&a_member));
    }

    #[tokio::test]
    async fn test_outsider_membership_is_rejected() {
        let hub = MemoryHub::new();
        let clock = Arc::new(ManualClock::new(NOW));
        let (ids, group) = group(&[b"b"]);
        let (outsider, outsider_group) = group_of(b"mallory");
        let mallory = peer(&hub, 9, outsider, &outsider_group, clock.clone());
        let b = peer(&hub, 2, ids[0].clone(), &group, clock);

        let event = post(&mallory, b"spam", 0);
        assert!(matches!(
            b.sync.check_message(message(&mallory, event), None),
            Verdict::Reject { .. }
        ));
    }

    fn group_of(seed: &[u8]) -> (RlnIdentity, RlnGroup) {
        let identity = RlnIdentity::from_seed(seed);
        let group = RlnGroup::new([identity.commitment()]);
        (identity, group)
    }

    #[tokio::test]
    async fn test_breach_is_ignored_and_counted() {
        let hub = MemoryHub::new();
        let clock = Arc::new(ManualClock::new(NOW));
        let (ids, group) = group(&[b"a", b"b"]);
        let a = peer(&hub, 1, ids[0].clone(), &group, clock.clone());
        let b = peer(&hub, 2, ids[1].clone(), &group, clock);

        // Two posts in one 10s window, both claiming the single slot.
        let first = post(&a, b"one", 0);
        let second = post(&a, b"two", 0);
        assert!(matches!(
            b.sync.check_message(message(&a, first), None),
            Verdict::Accept(_)
        ));
        assert!(matches!(
            b.sync.check_message(message(&a, second), None),
            Verdict::Ignore(_)
        ));
        assert_eq!(b.sync.stats().breaches, 1);
        assert_eq!(b.rln.slashed().len(), 1);
    }

    #[tokio::test]
    async fn test_banned_member_is_rejected() {
        let hub = MemoryHub::new();
        let clock = Arc::new(ManualClock::new(NOW));
        let (ids, group) = group(&[b"a", b"b"]);
        let a = peer(&hub, 1, ids[0].clone(), &group, clock.clone());
        let b = peer(&hub, 2, ids[1].clone(), &group, clock);

        b.tracker.ban(a.membership.member_id().unwrap());
        let event = post(&a, b"hello", 0);
        assert!(matches!(
            b.sync.check_message(message(&a, event), None),
            Verdict::Reject { .. }
        ));
    }

    #[tokio::test]
    async fn test_gossip_delivers_event_and_vote() {
        let hub = MemoryHub::new();
        let clock = Arc::new(ManualClock::new(NOW));
        let (ids, group) = group(&[b"a", b"b"]);
        let mut a = peer(&hub, 1, ids[0].clone(), &group, clock.clone());
        let mut b = peer(&hub, 2, ids[1].clone(), &group, clock);
        hub.connect(a.peer, b.peer);
        a.sync.start(a.outgoing.take().unwrap()).await.unwrap();
        b.sync.start(b.outgoing.take().unwrap()).await.unwrap();

        let event = post(&a, b"hello", 0);
        let id = a
            .feed
            .add_event(event.proof, event.header, event.payload)
            .unwrap()
            .event_id;

        wait_for(|| b.feed.timeline_time(&id).is_some()).await;
        // B's own vote travels back to A.
        let b_member = b.membership.member_id().unwrap();
        wait_for(|| {
            a.feed
                .metadata(&id)
                .is_some_and(|m| m.members_received.contains_key(&b_member))
        })
        .await;
        assert!(b.sync.stats().gossip_accepted >= 1);
    }

    #[tokio::test]
    async fn test_direct_sync_on_subscription() {
        let hub = MemoryHub::new();
        let clock = Arc::new(ManualClock::new(NOW));
        let (ids, group) = group(&[b"a", b"b"]);
        let mut a = peer(&hub, 1, ids[0].clone(), &group, clock.clone());
        let mut b = peer(&hub, 2, ids[1].clone(), &group, clock);

        let event = post(&a, b"before we met", 0);
        let id = a
            .feed
            .add_event(event.proof, event.header, event.payload)
            .unwrap()
            .event_id;

        a.sync.start(a.outgoing.take().unwrap()).await.unwrap();
        b.sync.start(b.outgoing.take().unwrap()).await.unwrap();
        hub.connect(a.peer, b.peer);

        wait_for(|| b.feed.timeline_time(&id).is_some()).await;
        wait_for(|| a.sync.stats().events_sent >= 1).await;
        assert_eq!(b.feed.get_payload(&id).unwrap(), Some(b"before we met".to_vec()));
    }

    #[tokio::test]
    async fn test_renewal_once_per_epoch() {
        let hub = MemoryHub::new();
        let clock = Arc::new(ManualClock::new(NOW));
        let (ids, group) = group(&[b"a", b"b"]);
        let mut a = peer(&hub, 1, ids[0].clone(), &group, clock.clone());
        let mut b = peer(&hub, 2, ids[1].clone(), &group, clock.clone());
        hub.connect(a.peer, b.peer);
        b.sync.start(b.outgoing.take().unwrap()).await.unwrap();
        a.sync.start(a.outgoing.take().unwrap()).await.unwrap();

        // The renewal loop's first tick already announced A.
        let a_member = a.membership.member_id().unwrap();
        wait_for(|| a.sync.stats().renewals == 1).await;
        wait_for(|| b.tracker.get(&a_member).is_some()).await;
        assert!(!a.sync.renew().await.unwrap());

        clock.advance(100_000 * 1000);
        assert!(a.sync.renew().await.unwrap());
        let next = a.membership.member_id().unwrap();
        assert_ne!(next, a_member);
        wait_for(|| b.tracker.get(&next).is_some()).await;
    }

    #[tokio::test]
    async fn test_renewal_keeps_quiet_member_active() {
        let hub = MemoryHub::new();
        let clock = Arc::new(ManualClock::new(NOW));
        let (ids, group) = group(&[b"a", b"b"]);
        let mut a = peer(&hub, 1, ids[0].clone(), &group, clock.clone());
        let mut b = peer(&hub, 2, ids[1].clone(), &group, clock.clone());
        hub.connect(a.peer, b.peer);
        b.sync.start(b.outgoing.take().unwrap()).await.unwrap();
        a.sync.start(a.outgoing.take().unwrap()).await.unwrap();

        let a_member = a.membership.member_id().unwrap();
        let b_member = b.membership.member_id().unwrap();
        wait_for(|| a.sync.stats().renewals == 1).await;
        wait_for(|| b.tracker.get(&a_member).is_some() && b.tracker.get(&b_member).is_some()).await;
        assert_eq!(b.tracker.active_count(), 2);

        // Still well inside the window opened by the first announcement.
        clock.advance(60_000);
        assert!(!a.sync.renew().await.unwrap());

        // The next tick would land past the 15 minute window: announce again.
        clock.advance(5 * 60_000);
        assert!(a.sync.renew().await.unwrap());
        assert!(b.sync.renew().await.unwrap());
        let renewed_at = clock.now_ms();
        wait_for(|| b.tracker.get(&a_member).is_some_and(|m| m.last_seen == renewed_at)).await;

        clock.advance(10 * 60_000);
        assert_eq!(b.tracker.active_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_renewal_is_ignored() {
        let hub = MemoryHub::new();
        let clock = Arc::new(ManualClock::new(NOW));
        let (ids, group) = group(&[b"a", b"b"]);
        let a = peer(&hub, 1, ids[0].clone(), &group, clock.clone());
        let b = peer(&hub, 2, ids[1].clone(), &group, clock.clone());

        clock.advance(30 * 60_000);
        let replayed = PeerMessage::MembershipRenewal(MembershipRenewal {
            membership: a.membership.proof().unwrap().1,
            sent: NOW,
        });
        assert!(matches!(b.sync.check_message(replayed, None), Verdict::Ignore(_)));
        assert!(b.tracker.get(&a.membership.member_id().unwrap()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_undelivered_verdicts_expire() {
        let hub = MemoryHub::new();
        let clock = Arc::new(ManualClock::new(NOW));
        let (ids, group) = group(&[b"a", b"b"]);
        let a = peer(&hub, 1, ids[0].clone(), &group, clock.clone());
        let b = peer(&hub, 2, ids[1].clone(), &group, clock);

        let data = canonical_bytes(&message(&a, post(&a, b"hello", 0))).unwrap();
        assert_eq!(b.sync.validate_gossip(a.peer, &data), ValidationResult::Accept);
        assert_eq!(b.sync.prune_validated(), 0);
        assert_eq!(b.sync.validated.lock().len(), 1);

        tokio::time::advance(VALIDATED_TTL).await;
        assert_eq!(b.sync.prune_validated(), 1);
        assert!(b.sync.validated.lock().is_empty());
    }
}
