//! Dandelion++ event relay
//!
//! An event first travels a random "stem" path, one peer at a time, and is
//! then "fluffed": added to the feed and gossiped like any local event.
//! Each hop fluffs with probability `1 / min(peers, 10)` and otherwise
//! forwards to its routing table destination, arming an embargo timer that
//! fluffs the event anyway if it has not reached the feed by then.
//!
//! Relay streams open with a membership handshake. A handshake-only stream
//! admits the dialer to the active set; any further frames are stemmed
//! events.

use crate::config::{Config, EventTypeSpecs};
use crate::feed::{FeedError, LambdadeltaFeed};
use crate::handshake::{self, HandshakeError};
use crate::header::{verify_event_header, HeaderVerificationError};
use crate::membership::{LocalMembership, MemberTracker};
use crate::routing::RoutingTable;
use futures::{SinkExt, StreamExt};
use lambdadelta_core::crypto::{event_id, payload_hash};
use lambdadelta_core::{EventId, MemberId, RelayedEvent, Rln, VerificationResult};
use lambdadelta_net::{Frame, FrameError, FrameType, IncomingStream, Network, PeerEvent, PeerId};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

/// Protocol name of relay streams
pub const RELAY_PROTOCOL: &str = "/lambdadelta/relay/1.0.0";

/// Peer count above which the fluff probability stops shrinking
const FLUFF_PEER_CAP: usize = 10;

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Relayed event for foreign topic {0}")]
    WrongTopic(String),
    #[error("Relayed event id {0} does not match its header")]
    IdMismatch(EventId),
    #[error("Relayed payload does not match header of {0}")]
    PayloadMismatch(EventId),
    #[error("Header verification failed: {0}")]
    Header(#[from] HeaderVerificationError),
    #[error("Event proof rejected: {0:?}")]
    Proof(VerificationResult),
    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),
    #[error("Stream error: {0}")]
    Stream(#[from] HandshakeError),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
}

impl RelayError {
    /// Whether the peer that stemmed the event should be banned for it.
    ///
    /// A breach is the author's fault and already slashed by the RLN layer.
    fn is_violation(&self) -> bool {
        match self {
            Self::WrongTopic(_) | Self::IdMismatch(_) | Self::PayloadMismatch(_) | Self::Header(_) => true,
            Self::Proof(result) => *result != VerificationResult::Breach,
            Self::Frame(_) => true,
            Self::Stream(e) => e.is_violation(),
            Self::Feed(_) => false,
        }
    }
}

/// What happened to a relayed event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Added to the feed and gossiped
    Fluffed,
    /// Forwarded along the stem to this peer
    Stemmed(PeerId),
    /// Already in the feed
    AlreadyKnown,
    /// Already stemmed through this node
    AlreadyEmbargoed,
}

/// Relay tunables
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub embargo_ms: u64,
    pub embargo_jitter_ms: u64,
    pub max_destinations: usize,
    pub refresh_interval: Duration,
    pub refresh_jitter: Duration,
    pub dial_timeout: Duration,
}

impl From<&Config> for RelayConfig {
    fn from(config: &Config) -> Self {
        Self {
            embargo_ms: config.embargo_time_ms,
            embargo_jitter_ms: config.embargo_jitter_ms,
            max_destinations: config.routing_max_destinations,
            refresh_interval: Duration::from_secs(config.routing_refresh_interval_secs),
            refresh_jitter: Duration::from_secs(config.routing_refresh_jitter_secs),
            dial_timeout: config.dial_timeout(),
        }
    }
}

/// Relay statistics
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub active_peers: usize,
    pub received: u64,
    pub stemmed: u64,
    pub fluffed: u64,
    pub embargo_fluffed: u64,
    pub rejected: u64,
    pub failed_forwards: u64,
}

/// Dandelion++ relay for one topic
pub struct EventRelayer {
    topic: String,
    config: RelayConfig,
    specs: EventTypeSpecs,
    network: Arc<dyn Network>,
    membership: Arc<LocalMembership>,
    tracker: Arc<MemberTracker>,
    rln: Arc<dyn Rln>,
    feed: Arc<LambdadeltaFeed>,
    routing: Mutex<RoutingTable>,
    /// Peers that completed a relay handshake
    active: RwLock<HashMap<PeerId, MemberId>>,
    embargoed: Mutex<HashSet<EventId>>,
    stats: RwLock<RelayStats>,
    shutdown_tx: broadcast::Sender<()>,
}

impl EventRelayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        topic: &str,
        config: RelayConfig,
        specs: EventTypeSpecs,
        network: Arc<dyn Network>,
        membership: Arc<LocalMembership>,
        tracker: Arc<MemberTracker>,
        rln: Arc<dyn Rln>,
        feed: Arc<LambdadeltaFeed>,
    ) -> Arc<Self> {
        let routing = RoutingTable::new(network.local_peer(), config.max_destinations);
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            topic: topic.to_string(),
            config,
            specs,
            network,
            membership,
            tracker,
            rln,
            feed,
            routing: Mutex::new(routing),
            active: RwLock::new(HashMap::new()),
            embargoed: Mutex::new(HashSet::new()),
            stats: RwLock::new(RelayStats::default()),
            shutdown_tx,
        })
    }

    /// Accept relay streams, follow topic peers and refresh the routing table
    pub fn start(self: &Arc<Self>) {
        self.spawn_accept_loop();
        self.spawn_peer_loop();
        self.spawn_refresh_loop();
        for peer in self.network.topic_peers(&self.topic) {
            self.spawn_connect(peer);
        }
        info!("Relay started for topic {}", self.topic);
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    fn spawn_accept_loop(self: &Arc<Self>) {
        let mut incoming = self.network.handle(RELAY_PROTOCOL);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let relayer = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    stream = incoming.recv() => {
                        let Some(stream) = stream else { break };
                        let Some(relayer) = relayer.upgrade() else { break };
                        tokio::spawn(async move {
                            let from = stream.from;
                            if let Err(e) = relayer.handle_stream(stream).await {
                                debug!("Relay stream from {} failed: {}", from, e);
                            }
                        });
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    fn spawn_peer_loop(self: &Arc<Self>) {
        let mut events = self.network.peer_events();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let relayer = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let Some(relayer) = relayer.upgrade() else { break };
                        match event {
                            PeerEvent::Subscribed { peer, topic } if topic == relayer.topic => {
                                relayer.spawn_connect(peer);
                            }
                            PeerEvent::Unsubscribed { peer, topic } if topic == relayer.topic => {
                                relayer.remove_peer(&peer);
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    fn spawn_refresh_loop(self: &Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let relayer = Arc::downgrade(self);
        let interval = self.config.refresh_interval;
        let jitter = self.config.refresh_jitter.as_millis() as i64;
        tokio::spawn(async move {
            loop {
                let offset = rand::thread_rng().gen_range(-jitter..=jitter);
                let delay = (interval.as_millis() as i64 + offset).max(1) as u64;
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(delay)) => {
                        let Some(relayer) = relayer.upgrade() else { break };
                        relayer.routing.lock().refresh();
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    fn spawn_connect(self: &Arc<Self>, peer: PeerId) {
        let relayer = self.clone();
        tokio::spawn(async move {
            if let Err(e) = relayer.connect(peer).await {
                debug!("Relay handshake with {} failed: {}", peer, e);
            }
        });
    }

    /// Handshake with `peer` and add it to the active set
    pub async fn connect(&self, peer: PeerId) -> Result<MemberId, RelayError> {
        let result = handshake::initiate(
            self.network.as_ref(),
            peer,
            RELAY_PROTOCOL,
            &self.membership,
            &self.tracker,
            self.config.dial_timeout,
        )
        .await;
        match result {
            Ok((mut stream, member)) => {
                let _ = stream.close().await;
                self.add_peer(peer, member);
                Ok(member)
            }
            Err(e) => {
                self.remove_peer(&peer);
                Err(e.into())
            }
        }
    }

    fn add_peer(&self, peer: PeerId, member: MemberId) {
        let mut active = self.active.write();
        if active.insert(peer, member).is_none() {
            debug!("Relay peer {} active ({})", peer, member);
            self.routing.lock().update_peers(active.keys().copied());
        }
    }

    fn remove_peer(&self, peer: &PeerId) {
        if self.active.write().remove(peer).is_some() {
            debug!("Relay peer {} removed", peer);
        }
        self.routing.lock().remove_peer(peer);
    }

    async fn handle_stream(self: &Arc<Self>, incoming: IncomingStream) -> Result<(), RelayError> {
        let IncomingStream { from, mut stream, .. } = incoming;
        let member = handshake::respond(&mut stream, from, &self.membership, &self.tracker).await?;
        self.add_peer(from, member);

        while let Some(frame) = stream.next().await {
            let relayed: RelayedEvent = frame?.decode(FrameType::RelayedEvent)?;
            match self.handle_relayed_event(Some(from), relayed).await {
                Ok(outcome) => trace!("Relayed event from {}: {:?}", from, outcome),
                Err(e) if e.is_violation() => {
                    warn!("Banning member {} of peer {}: {}", member, from, e);
                    self.tracker.ban(member);
                    self.remove_peer(&from);
                    return Err(e);
                }
                Err(e) => warn!("Relayed event from {} dropped: {}", from, e),
            }
        }
        Ok(())
    }

    /// Verify a relayed event and either fluff it or pass it along the stem
    pub async fn handle_relayed_event(
        self: &Arc<Self>,
        from: Option<PeerId>,
        relayed: RelayedEvent,
    ) -> Result<RelayOutcome, RelayError> {
        if relayed.topic != self.topic {
            return Err(RelayError::WrongTopic(relayed.topic));
        }
        let id = event_id(&self.topic, &relayed.header);
        if id != relayed.event_id {
            return Err(RelayError::IdMismatch(relayed.event_id));
        }
        if self.feed.has_event(&id) {
            return Ok(RelayOutcome::AlreadyKnown);
        }
        if self.embargoed.lock().contains(&id) {
            return Ok(RelayOutcome::AlreadyEmbargoed);
        }
        if let Some(payload) = &relayed.payload {
            if payload_hash(payload) != relayed.header.payload_hash {
                return Err(RelayError::PayloadMismatch(id));
            }
        }

        let verification = verify_event_header(
            &relayed.proof,
            &relayed.header,
            &self.topic,
            &self.specs,
            self.rln.as_ref(),
        )
        .map_err(|e| {
            self.stats.write().rejected += 1;
            e
        })?;
        if !verification.result.is_acceptable() {
            self.stats.write().rejected += 1;
            return Err(RelayError::Proof(verification.result));
        }
        self.stats.write().received += 1;

        if self.should_fluff() {
            self.fluff(relayed)?;
            return Ok(RelayOutcome::Fluffed);
        }
        self.stem(from, relayed).await
    }

    /// Originate an event anonymously: always start a stem
    pub async fn send_event(self: &Arc<Self>, relayed: RelayedEvent) -> Result<RelayOutcome, RelayError> {
        self.stem(None, relayed).await
    }

    fn should_fluff(&self) -> bool {
        let peers = self.active.read().len().min(FLUFF_PEER_CAP);
        peers == 0 || rand::thread_rng().gen_range(0..peers) == 0
    }

    async fn stem(self: &Arc<Self>, from: Option<PeerId>, relayed: RelayedEvent) -> Result<RelayOutcome, RelayError> {
        let id = relayed.event_id;
        if !self.embargo(&relayed) {
            return Ok(RelayOutcome::AlreadyEmbargoed);
        }
        loop {
            let destination = self.routing.lock().get_destination(from);
            let Some(destination) = destination else {
                debug!("No stem destination for {}, fluffing", id);
                self.fluff(relayed)?;
                return Ok(RelayOutcome::Fluffed);
            };
            match self.forward(destination, &relayed).await {
                Ok(()) => {
                    debug!("Stemmed {} to {}", id, destination);
                    self.stats.write().stemmed += 1;
                    return Ok(RelayOutcome::Stemmed(destination));
                }
                Err(e) => {
                    warn!("Stem to {} failed: {}", destination, e);
                    self.stats.write().failed_forwards += 1;
                    self.remove_peer(&destination);
                }
            }
        }
    }

    async fn forward(&self, peer: PeerId, relayed: &RelayedEvent) -> Result<(), RelayError> {
        let (mut stream, _) = handshake::initiate(
            self.network.as_ref(),
            peer,
            RELAY_PROTOCOL,
            &self.membership,
            &self.tracker,
            self.config.dial_timeout,
        )
        .await?;
        stream
            .send(Frame::message(FrameType::RelayedEvent, relayed)?)
            .await?;
        stream.close().await?;
        Ok(())
    }

    /// Arm the embargo timer for `relayed`. Returns false if it already was.
    pub fn embargo(self: &Arc<Self>, relayed: &RelayedEvent) -> bool {
        let id = relayed.event_id;
        if !self.embargoed.lock().insert(id) {
            return false;
        }
        let delay = self.embargo_delay();
        trace!("Embargo for {} in {:?}", id, delay);

        let relayer: Weak<Self> = Arc::downgrade(self);
        let relayed = relayed.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(relayer) = relayer.upgrade() else { return };
            relayer.embargoed.lock().remove(&id);
            if relayer.feed.has_event(&id) {
                trace!("Embargo for {} lifted, already fluffed", id);
                return;
            }
            info!("Embargo for {} expired, fluffing", id);
            relayer.stats.write().embargo_fluffed += 1;
            if let Err(e) = relayer.fluff(relayed) {
                warn!("Embargo fluff of {} failed: {}", id, e);
            }
        });
        true
    }

    fn embargo_delay(&self) -> Duration {
        let jitter = self.config.embargo_jitter_ms as i64;
        let offset = rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::from_millis((self.config.embargo_ms as i64 + offset).max(0) as u64)
    }

    fn fluff(&self, relayed: RelayedEvent) -> Result<(), RelayError> {
        let id = relayed.event_id;
        let result = self
            .feed
            .add_event(relayed.proof, relayed.header, relayed.payload)?;
        if !result.exists {
            debug!("Fluffed {}", id);
            self.stats.write().fluffed += 1;
        }
        Ok(())
    }

    pub fn is_embargoed(&self, id: &EventId) -> bool {
        self.embargoed.lock().contains(id)
    }

    pub fn active_peers(&self) -> Vec<PeerId> {
        self.active.read().keys().copied().collect()
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            active_peers: self.active.read().len(),
            ..self.stats.read().clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::default_event_types;
    use crate::feed::FeedConfig;
    use crate::header::create_event;
    use crate::membership::MemberCidPolicy;
    use crate::storage::MemoryDatastore;
    use lambdadelta_core::{NullifierInput, RlnGroup, RlnIdentity, TransparentRln};
    use lambdadelta_net::{KeyPair, MemoryHub};

    const TOPIC: &str = "news";
    const NOW: u64 = 1_700_000_000_000;

    struct Node {
        relayer: Arc<EventRelayer>,
        feed: Arc<LambdadeltaFeed>,
        rln: Arc<TransparentRln>,
        clock: Arc<ManualClock>,
        peer: PeerId,
    }

    fn node(hub: &MemoryHub, seed: u8, identity: RlnIdentity, group: &RlnGroup) -> Node {
        let clock = Arc::new(ManualClock::new(NOW));
        let keypair = KeyPair::from_seed(&[seed; 32]);
        let peer = keypair.peer_id();
        let network = hub.join(&keypair);
        let rln = Arc::new(TransparentRln::new(Some(identity), group.clone()));
        let store = Arc::new(MemoryDatastore::new());
        let tracker = Arc::new(MemberTracker::new(clock.clone(), 900_000));
        let membership = Arc::new(LocalMembership::new(
            keypair,
            rln.clone(),
            clock.clone(),
            MemberCidPolicy {
                epoch_secs: 100_000,
                tolerance: 1,
            },
            store.clone(),
            TOPIC,
        ));
        let (feed, _outgoing) = LambdadeltaFeed::new(
            TOPIC,
            FeedConfig::default(),
            store,
            clock.clone(),
            tracker.clone(),
            rln.clone(),
        )
        .unwrap();
        let relayer = EventRelayer::new(
            TOPIC,
            RelayConfig::from(&Config::default()),
            default_event_types(),
            network,
            membership,
            tracker,
            rln.clone(),
            feed.clone(),
        );
        Node {
            relayer,
            feed,
            rln,
            clock,
            peer,
        }
    }

    fn pair() -> (MemoryHub, Node, Node) {
        let (a_id, b_id) = (RlnIdentity::from_seed(b"a"), RlnIdentity::from_seed(b"b"));
        let group = RlnGroup::new([a_id.commitment(), b_id.commitment()]);
        let hub = MemoryHub::new();
        let a = node(&hub, 1, a_id, &group);
        let b = node(&hub, 2, b_id, &group);
        hub.connect(a.peer, b.peer);
        (hub, a, b)
    }

    fn relayed(author: &Node, body: &[u8]) -> RelayedEvent {
        let claimed = author.clock.now_ms();
        let nullifiers: Vec<NullifierInput> = default_event_types()["POST"]
            .iter()
            .map(|spec| NullifierInput {
                nullifier: spec.epoch_at(claimed),
                message_limit: spec.message_limit,
                message_id: 0,
            })
            .collect();
        let (header, proof, event_id) = create_event(
            author.rln.as_ref(),
            author.clock.as_ref(),
            TOPIC,
            "POST",
            &nullifiers,
            payload_hash(body),
        )
        .unwrap();
        RelayedEvent {
            topic: TOPIC.into(),
            event_id,
            header,
            proof,
            payload: Some(body.to_vec()),
        }
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
    async fn test_lone_node_fluffs() {
        let (_hub, a, _b) = pair();
        let event = relayed(&a, b"hello");
        let id = event.event_id;

        assert_eq!(
            a.relayer.handle_relayed_event(None, event.clone()).await.unwrap(),
            RelayOutcome::Fluffed
        );
        assert!(a.feed.has_event(&id));
        assert_eq!(
            a.relayer.handle_relayed_event(None, event).await.unwrap(),
            RelayOutcome::AlreadyKnown
        );
        assert_eq!(a.relayer.stats().fluffed, 1);
    }

    #[tokio::test]
    async fn test_malformed_relays_are_rejected() {
        let (_hub, a, _b) = pair();
        let event = relayed(&a, b"hello");

        let mut foreign = event.clone();
        foreign.topic = "other".into();
        assert!(matches!(
            a.relayer.handle_relayed_event(None, foreign).await,
            Err(RelayError::WrongTopic(_))
        ));

        let mut renamed = event.clone();
        renamed.event_id = EventId([7; 32]);
        assert!(matches!(
            a.relayer.handle_relayed_event(None, renamed).await,
            Err(RelayError::IdMismatch(_))
        ));

        let mut tampered = event;
        tampered.payload = Some(b"bye".to_vec());
        let err = a.relayer.handle_relayed_event(None, tampered).await.unwrap_err();
        assert!(matches!(err, RelayError::PayloadMismatch(_)));
        assert!(err.is_violation());
    }

    #[tokio::test]
    async fn test_handshake_activates_both_sides() {
        let (_hub, a, b) = pair();
        a.relayer.start();
        b.relayer.start();

        a.relayer.connect(b.peer).await.unwrap();
        assert_eq!(a.relayer.active_peers(), vec![b.peer]);
        wait_for(|| b.relayer.active_peers() == vec![a.peer]).await;
    }

    #[tokio::test]
    async fn test_stem_reaches_peer_and_fluffs_there() {
        let (_hub, a, b) = pair();
        a.relayer.start();
        b.relayer.start();
        a.relayer.connect(b.peer).await.unwrap();
        wait_for(|| b.relayer.active_peers().len() == 1).await;

        let event = relayed(&a, b"anonymous");
        let id = event.event_id;
        assert_eq!(
            a.relayer.send_event(event).await.unwrap(),
            RelayOutcome::Stemmed(b.peer)
        );
        assert!(a.relayer.is_embargoed(&id));
        assert!(!a.feed.has_event(&id));

        // B has a single peer, so it fluffs with certainty.
        wait_for(|| b.feed.has_event(&id)).await;
        assert_eq!(b.relayer.stats().fluffed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_embargo_is_single_shot_and_fluffs() {
        let (_hub, a, _b) = pair();
        let event = relayed(&a, b"stuck");
        let id = event.event_id;

        assert!(a.relayer.embargo(&event));
        assert!(!a.relayer.embargo(&event));
        assert_eq!(
            a.relayer.handle_relayed_event(None, event).await.unwrap(),
            RelayOutcome::AlreadyEmbargoed
        );
        assert!(!a.feed.has_event(&id));

        tokio::time::sleep(Duration::from_millis(8_001)).await;
        assert!(a.feed.has_event(&id));
        assert!(!a.relayer.is_embargoed(&id));
        assert_eq!(a.relayer.stats().embargo_fluffed, 1);
    }

    #[tokio::test]
    async fn test_failed_destination_falls_back_to_fluff() {
        let (_hub, a, b) = pair();
        // B never registers a relay handler, so the stem cannot be delivered.
        a.relayer.add_peer(b.peer, MemberId([2; 32]));
        let event = relayed(&a, b"orphan");
        let id = event.event_id;

        assert_eq!(a.relayer.send_event(event).await.unwrap(), RelayOutcome::Fluffed);
        assert!(a.feed.has_event(&id));
        assert!(a.relayer.active_peers().is_empty());
        assert_eq!(a.relayer.stats().failed_forwards, 1);
    }
}
