//! Network contract and in-process transport
//!
//! [`Network`] is what the protocol needs from a peer-to-peer substrate:
//! topic pubsub with a validation hook that runs before a message is
//! propagated, point-to-point protocol streams, and notifications when a
//! neighbour subscribes to or leaves a topic.
//!
//! [`MemoryHub`] implements it in-process. Nodes are linked explicitly, so
//! gossip only travels along links and an invalid message stops at the
//! first honest node that rejects it.

use crate::crypto::KeyPair;
use crate::framing::FrameCodec;
use crate::peer::PeerId;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

/// Fixed timeout for opening a protocol stream
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Buffer size of in-memory duplex pipes
const PIPE_CAPACITY: usize = 256 * 1024;

/// Per-subscription channel depth
const CHANNEL_DEPTH: usize = 1024;

/// Remembered gossip message IDs per node
const MAX_SEEN_MESSAGES: usize = 65_536;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),
    #[error("Not connected to peer: {0}")]
    NotConnected(PeerId),
    #[error("Peer {peer} does not handle protocol {protocol}")]
    NoHandler { peer: PeerId, protocol: String },
    #[error("Dial timeout")]
    Timeout,
}

/// Framed point-to-point protocol stream
pub type FramedStream = Framed<DuplexStream, FrameCodec>;

/// A gossip message delivered after validation
#[derive(Debug, Clone)]
pub struct GossipMessage {
    /// Neighbour the message arrived from (not necessarily its author)
    pub from: PeerId,
    pub topic: String,
    pub data: Vec<u8>,
}

/// Inbound protocol stream
#[derive(Debug)]
pub struct IncomingStream {
    pub from: PeerId,
    pub protocol: String,
    pub stream: FramedStream,
}

/// Subscription-change notifications for neighbouring peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Subscribed { peer: PeerId, topic: String },
    Unsubscribed { peer: PeerId, topic: String },
}

/// Verdict of a topic validator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    /// Deliver locally and propagate
    Accept,
    /// Drop; the message is invalid
    Reject,
    /// Drop without penalty
    Ignore,
}

/// Hook run on every gossip message before delivery and propagation
#[async_trait]
pub trait TopicValidator: Send + Sync {
    async fn validate(&self, from: PeerId, data: &[u8]) -> ValidationResult;
}

/// Peer-to-peer substrate used by the protocol
#[async_trait]
pub trait Network: Send + Sync {
    /// Our peer identifier
    fn local_peer(&self) -> PeerId;

    /// Join a topic and receive its validated messages
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<GossipMessage>, TransportError>;

    /// Leave a topic
    async fn unsubscribe(&self, topic: &str);

    /// Install the validator for a topic
    fn set_topic_validator(&self, topic: &str, validator: Arc<dyn TopicValidator>);

    /// Publish to all neighbours subscribed to the topic
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError>;

    /// Accept inbound streams for a protocol
    fn handle(&self, protocol: &str) -> mpsc::Receiver<IncomingStream>;

    /// Open a protocol stream to a neighbour
    async fn dial(&self, peer: PeerId, protocol: &str) -> Result<FramedStream, TransportError>;

    /// Receive subscription-change notifications
    fn peer_events(&self) -> mpsc::UnboundedReceiver<PeerEvent>;

    /// Neighbours currently subscribed to a topic
    fn topic_peers(&self, topic: &str) -> Vec<PeerId>;
}

// =============================================================================
// IN-MEMORY HUB
// =============================================================================

#[derive(Default)]
struct SeenCache {
    set: HashSet<[u8; 32]>,
    order: VecDeque<[u8; 32]>,
}

impl SeenCache {
    /// Returns false if already seen
    fn insert(&mut self, id: [u8; 32]) -> bool {
        if !self.set.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > MAX_SEEN_MESSAGES {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }
}

struct NodeState {
    id: PeerId,
    subscriptions: RwLock<HashMap<String, mpsc::Sender<GossipMessage>>>,
    validators: RwLock<HashMap<String, Arc<dyn TopicValidator>>>,
    handlers: RwLock<HashMap<String, mpsc::Sender<IncomingStream>>>,
    peer_sinks: Mutex<Vec<mpsc::UnboundedSender<PeerEvent>>>,
    seen: Mutex<SeenCache>,
}

impl NodeState {
    fn new(id: PeerId) -> Self {
        Self {
            id,
            subscriptions: RwLock::new(HashMap::new()),
            validators: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            peer_sinks: Mutex::new(Vec::new()),
            seen: Mutex::new(SeenCache::default()),
        }
    }

    fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.read().contains_key(topic)
    }

    fn topics(&self) -> Vec<String> {
        self.subscriptions.read().keys().cloned().collect()
    }

    fn notify(&self, event: PeerEvent) {
        self.peer_sinks
            .lock()
            .retain(|sink| sink.send(event.clone()).is_ok());
    }
}

#[derive(Default)]
struct HubState {
    nodes: HashMap<PeerId, Arc<NodeState>>,
    links: HashMap<PeerId, HashSet<PeerId>>,
}

impl HubState {
    fn neighbours(&self, id: &PeerId) -> Vec<Arc<NodeState>> {
        self.links
            .get(id)
            .map(|set| {
                set.iter()
                    .filter_map(|peer| self.nodes.get(peer).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// In-process network connecting [`MemoryTransport`] nodes
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<RwLock<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node identified by `keypair`
    pub fn join(&self, keypair: &KeyPair) -> Arc<MemoryTransport> {
        let id = keypair.peer_id();
        let node = Arc::new(NodeState::new(id));
        let mut state = self.state.write();
        state.nodes.insert(id, node.clone());
        state.links.entry(id).or_default();
        Arc::new(MemoryTransport {
            hub: self.clone(),
            node,
        })
    }

    /// Link two nodes; announces their common topic subscriptions
    pub fn connect(&self, a: PeerId, b: PeerId) {
        if a == b {
            return;
        }
        let (node_a, node_b) = {
            let mut state = self.state.write();
            let (Some(node_a), Some(node_b)) =
                (state.nodes.get(&a).cloned(), state.nodes.get(&b).cloned())
            else {
                return;
            };
            if !state.links.entry(a).or_default().insert(b) {
                return;
            }
            state.links.entry(b).or_default().insert(a);
            (node_a, node_b)
        };
        debug!("Linked {} <-> {}", a, b);

        for topic in node_a.topics() {
            if node_b.is_subscribed(&topic) {
                node_a.notify(PeerEvent::Subscribed {
                    peer: b,
                    topic: topic.clone(),
                });
                node_b.notify(PeerEvent::Subscribed { peer: a, topic });
            }
        }
    }

    /// Unlink two nodes; announces them leaving each other's topics
    pub fn disconnect(&self, a: PeerId, b: PeerId) {
        let (node_a, node_b) = {
            let mut state = self.state.write();
            let removed = state.links.get_mut(&a).map(|s| s.remove(&b)).unwrap_or(false);
            if let Some(s) = state.links.get_mut(&b) {
                s.remove(&a);
            }
            if !removed {
                return;
            }
            match (state.nodes.get(&a).cloned(), state.nodes.get(&b).cloned()) {
                (Some(x), Some(y)) => (x, y),
                _ => return,
            }
        };

        for topic in node_a.topics() {
            if node_b.is_subscribed(&topic) {
                node_a.notify(PeerEvent::Unsubscribed {
                    peer: b,
                    topic: topic.clone(),
                });
                node_b.notify(PeerEvent::Unsubscribed { peer: a, topic });
            }
        }
    }

    /// Link every pair of nodes
    pub fn connect_all(&self) {
        let ids: Vec<PeerId> = self.state.read().nodes.keys().copied().collect();
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                self.connect(*a, *b);
            }
        }
    }

    fn node(&self, id: &PeerId) -> Option<Arc<NodeState>> {
        self.state.read().nodes.get(id).cloned()
    }

    fn neighbours(&self, id: &PeerId) -> Vec<Arc<NodeState>> {
        self.state.read().neighbours(id)
    }

    fn is_linked(&self, a: &PeerId, b: &PeerId) -> bool {
        self.state
            .read()
            .links
            .get(a)
            .map(|s| s.contains(b))
            .unwrap_or(false)
    }
}

fn message_id(topic: &str, data: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(topic.as_bytes());
    hasher.update(&[0]);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Deliver one gossip hop; propagates further only on `Accept`.
fn deliver(
    hub: MemoryHub,
    to: Arc<NodeState>,
    from: PeerId,
    topic: Arc<str>,
    data: Arc<Vec<u8>>,
    id: [u8; 32],
) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        if !to.seen.lock().insert(id) {
            return;
        }
        let Some(sink) = to.subscriptions.read().get(topic.as_ref()).cloned() else {
            return;
        };

        let validator = to.validators.read().get(topic.as_ref()).cloned();
        let verdict = match validator {
            Some(v) => v.validate(from, &data).await,
            None => ValidationResult::Accept,
        };
        if verdict != ValidationResult::Accept {
            trace!("{} dropped gossip from {} ({:?})", to.id, from, verdict);
            return;
        }

        let message = GossipMessage {
            from,
            topic: topic.to_string(),
            data: data.as_ref().clone(),
        };
        if sink.send(message).await.is_err() {
            return;
        }

        for next in hub.neighbours(&to.id) {
            if next.id == from || !next.is_subscribed(&topic) {
                continue;
            }
            tokio::spawn(deliver(
                hub.clone(),
                next,
                to.id,
                topic.clone(),
                data.clone(),
                id,
            ));
        }
    })
}

/// A node attached to a [`MemoryHub`]
pub struct MemoryTransport {
    hub: MemoryHub,
    node: Arc<NodeState>,
}

impl MemoryTransport {
    /// The hub this node is attached to
    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }
}

#[async_trait]
impl Network for MemoryTransport {
    fn local_peer(&self) -> PeerId {
        self.node.id
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<GossipMessage>, TransportError> {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        self.node.subscriptions.write().insert(topic.to_string(), tx);

        for neighbour in self.hub.neighbours(&self.node.id) {
            if neighbour.is_subscribed(topic) {
                neighbour.notify(PeerEvent::Subscribed {
                    peer: self.node.id,
                    topic: topic.to_string(),
                });
                self.node.notify(PeerEvent::Subscribed {
                    peer: neighbour.id,
                    topic: topic.to_string(),
                });
            }
        }
        Ok(rx)
    }

    async fn unsubscribe(&self, topic: &str) {
        if self.node.subscriptions.write().remove(topic).is_none() {
            return;
        }
        for neighbour in self.hub.neighbours(&self.node.id) {
            if neighbour.is_subscribed(topic) {
                neighbour.notify(PeerEvent::Unsubscribed {
                    peer: self.node.id,
                    topic: topic.to_string(),
                });
            }
        }
    }

    fn set_topic_validator(&self, topic: &str, validator: Arc<dyn TopicValidator>) {
        self.node
            .validators
            .write()
            .insert(topic.to_string(), validator);
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError> {
        let id = message_id(topic, &data);
        self.node.seen.lock().insert(id);

        let topic: Arc<str> = Arc::from(topic);
        let data = Arc::new(data);
        for neighbour in self.hub.neighbours(&self.node.id) {
            if !neighbour.is_subscribed(&topic) {
                continue;
            }
            tokio::spawn(deliver(
                self.hub.clone(),
                neighbour,
                self.node.id,
                topic.clone(),
                data.clone(),
                id,
            ));
        }
        Ok(())
    }

    fn handle(&self, protocol: &str) -> mpsc::Receiver<IncomingStream> {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        self.node.handlers.write().insert(protocol.to_string(), tx);
        rx
    }

    async fn dial(&self, peer: PeerId, protocol: &str) -> Result<FramedStream, TransportError> {
        let remote = self.hub.node(&peer).ok_or(TransportError::PeerNotFound(peer))?;
        if !self.hub.is_linked(&self.node.id, &peer) {
            return Err(TransportError::NotConnected(peer));
        }
        let handler = remote
            .handlers
            .read()
            .get(protocol)
            .cloned()
            .ok_or_else(|| TransportError::NoHandler {
                peer,
                protocol: protocol.to_string(),
            })?;

        let (local, far) = tokio::io::duplex(PIPE_CAPACITY);
        let incoming = IncomingStream {
            from: self.node.id,
            protocol: protocol.to_string(),
            stream: Framed::new(far, FrameCodec::new()),
        };

        match tokio::time::timeout(DIAL_TIMEOUT, handler.send(incoming)).await {
            Ok(Ok(())) => Ok(Framed::new(local, FrameCodec::new())),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                warn!("Dial {} on {} timed out", peer, protocol);
                Err(TransportError::Timeout)
            }
        }
    }

    fn peer_events(&self) -> mpsc::UnboundedReceiver<PeerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.node.peer_sinks.lock().push(tx);
        rx
    }

    fn topic_peers(&self, topic: &str) -> Vec<PeerId> {
        self.hub
            .neighbours(&self.node.id)
            .into_iter()
            .filter(|n| n.is_subscribed(topic))
            .map(|n| n.id)
            .collect()
    }
}
