//! Lambdadelta node: one topic's feed, registry, sync and relay wired together

use crate::clock::Clock;
use crate::config::Config;
use crate::feed::{FeedConfig, FeedEntry, FeedError, FeedStats, LambdadeltaFeed, Outgoing};
use crate::header::create_event;
use crate::membership::{
    LocalMembership, MemberCidPolicy, MemberTracker, MembershipError, MembershipStats,
};
use crate::message_id::{MessageIdRegistry, RegistryError};
use crate::relayer::{EventRelayer, RelayConfig, RelayError, RelayOutcome, RelayStats};
use crate::storage::{Datastore, MemoryDatastore, SledDatastore, StorageError};
use crate::sync::{LambdadeltaSync, SyncError, SyncStats};
use lambdadelta_core::crypto::payload_hash;
use lambdadelta_core::{
    EventId, MemberId, RelayedEvent, Rln, RlnError, Timestamp, VerificationResult,
};
use lambdadelta_net::{KeyPair, Network, PeerId};
use parking_lot::Mutex;
use std::ops::RangeBounds;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Node errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("RLN error: {0}")]
    Rln(#[from] RlnError),
    #[error("Membership error: {0}")]
    Membership(#[from] MembershipError),
    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),
    #[error("Own event proof rejected: {0:?}")]
    OwnProof(VerificationResult),
    #[error("Node already started")]
    AlreadyStarted,
}

/// Result of publishing a new event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewEvent {
    pub event_id: EventId,
    pub claimed: Timestamp,
    /// The event was already in the feed
    pub exists: bool,
    /// Set when the event went through the Dandelion++ stem
    pub relayed: Option<RelayOutcome>,
}

/// Node statistics
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub feed: FeedStats,
    pub sync: SyncStats,
    pub relay: RelayStats,
    pub members: MembershipStats,
}

/// Open the datastore named by the config: sled under `data_dir`, else in memory
pub fn open_datastore(config: &Config) -> Result<Arc<dyn Datastore>, StorageError> {
    Ok(match &config.data_dir {
        Some(dir) => Arc::new(SledDatastore::open(dir)?),
        None => Arc::new(MemoryDatastore::new()),
    })
}

/// A participant in one topic's feed
pub struct Lambdadelta {
    config: Config,
    clock: Arc<dyn Clock>,
    rln: Arc<dyn Rln>,
    store: Arc<dyn Datastore>,
    registry: Arc<MessageIdRegistry>,
    tracker: Arc<MemberTracker>,
    membership: Arc<LocalMembership>,
    feed: Arc<LambdadeltaFeed>,
    sync: Arc<LambdadeltaSync>,
    relayer: Arc<EventRelayer>,
    outgoing: Mutex<Option<mpsc::UnboundedReceiver<Outgoing>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Lambdadelta {
    pub fn new(
        config: Config,
        keypair: KeyPair,
        rln: Arc<dyn Rln>,
        network: Arc<dyn Network>,
        store: Arc<dyn Datastore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, NodeError> {
        config
            .validate()
            .map_err(|e| NodeError::Config(e.to_string()))?;
        let topic = config.topic.clone();

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
            &topic,
        ));
        let registry = Arc::new(MessageIdRegistry::new(
            store.clone(),
            &topic,
            config.event_types.clone(),
            clock.clone(),
        ));
        let (feed, outgoing) = LambdadeltaFeed::new(
            &topic,
            FeedConfig::from(&config),
            store.clone(),
            clock.clone(),
            tracker.clone(),
            rln.clone(),
        )?;
        let sync = LambdadeltaSync::new(
            &config,
            network.clone(),
            membership.clone(),
            tracker.clone(),
            rln.clone(),
            feed.clone(),
            clock.clone(),
        );
        let relayer = EventRelayer::new(
            &topic,
            RelayConfig::from(&config),
            config.event_types.clone(),
            network,
            membership.clone(),
            tracker.clone(),
            rln.clone(),
            feed.clone(),
        );
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            clock,
            rln,
            store,
            registry,
            tracker,
            membership,
            feed,
            sync,
            relayer,
            outgoing: Mutex::new(Some(outgoing)),
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        })
    }

    /// Start the feed, the relay and the sync protocol
    pub async fn start(&self) -> Result<(), NodeError> {
        let outgoing = self.outgoing.lock().take().ok_or(NodeError::AlreadyStarted)?;
        if let Some(task) = self.feed.start() {
            self.tasks.lock().push(task);
        }
        // Relay first so its stream handler exists before peers learn about us.
        self.relayer.start();
        self.sync.start(outgoing).await?;
        self.spawn_maintenance();
        info!(
            "Lambdadelta node {} started on topic {}",
            self.membership.peer_id(),
            self.config.topic
        );
        Ok(())
    }

    fn spawn_maintenance(&self) {
        let registry = self.registry.clone();
        let feed = self.feed.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.config.renewal_interval());
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match registry.prune() {
                            Ok(0) => {}
                            Ok(n) => debug!("Pruned {} message id counters", n),
                            Err(e) => warn!("Message id pruning failed: {}", e),
                        }
                        if let Err(e) = feed.collect_garbage() {
                            warn!("Garbage collection failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
        self.tasks.lock().push(task);
    }

    /// Publish a new event of `event_type` carrying `payload`.
    ///
    /// Allocates rate-limit slots, proves the header and either adds the
    /// event to the feed or, for anonymous nodes, starts a Dandelion++ stem.
    pub async fn new_event(&self, event_type: &str, payload: Vec<u8>) -> Result<NewEvent, NodeError> {
        let nullifiers = self.registry.create_nullifier(event_type).await?;
        let (header, proof, event_id) = create_event(
            self.rln.as_ref(),
            self.clock.as_ref(),
            &self.config.topic,
            event_type,
            &nullifiers,
            payload_hash(&payload),
        )?;
        let claimed = header.claimed;

        // Record our own nullifiers so the copy coming back is a duplicate.
        let result = self.rln.submit_proof(&proof, Some(claimed));
        if !result.is_acceptable() {
            return Err(NodeError::OwnProof(result));
        }

        if self.config.anonymous {
            let outcome = self
                .relayer
                .send_event(RelayedEvent {
                    topic: self.config.topic.clone(),
                    event_id,
                    header,
                    proof,
                    payload: Some(payload),
                })
                .await?;
            debug!("New event {} relayed: {:?}", event_id, outcome);
            return Ok(NewEvent {
                event_id,
                claimed,
                exists: false,
                relayed: Some(outcome),
            });
        }

        let added = self.feed.add_event(proof, header, Some(payload))?;
        debug!("New event {} (exists: {})", event_id, added.exists);
        Ok(NewEvent {
            event_id,
            claimed,
            exists: added.exists,
            relayed: None,
        })
    }

    /// Confirmed timeline entries within `range`, at most `limit`
    pub fn get_events<R: RangeBounds<Timestamp>>(&self, range: R, limit: usize) -> Result<Vec<FeedEntry>, NodeError> {
        Ok(self.feed.get_events(range, limit)?)
    }

    /// The whole confirmed timeline
    pub fn events(&self) -> Result<Vec<FeedEntry>, NodeError> {
        self.get_events(.., usize::MAX)
    }

    /// Stop every task and flush the datastore
    pub async fn close(&self) -> Result<(), NodeError> {
        let _ = self.shutdown_tx.send(());
        self.relayer.stop();
        self.sync.stop().await;
        self.feed.close();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Node task ended abnormally: {}", e);
            }
        }
        self.store.flush()?;
        info!("Lambdadelta node {} closed", self.membership.peer_id());
        Ok(())
    }

    pub fn peer_id(&self) -> PeerId {
        self.membership.peer_id()
    }

    pub fn member_id(&self) -> Result<MemberId, NodeError> {
        Ok(self.membership.member_id()?)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn feed(&self) -> &Arc<LambdadeltaFeed> {
        &self.feed
    }

    pub fn sync(&self) -> &Arc<LambdadeltaSync> {
        &self.sync
    }

    pub fn relayer(&self) -> &Arc<EventRelayer> {
        &self.relayer
    }

    pub fn tracker(&self) -> &Arc<MemberTracker> {
        &self.tracker
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            feed: self.feed.stats(),
            sync: self.sync.stats(),
            relay: self.relayer.stats(),
            members: self.tracker.stats(),
        }
    }
}
