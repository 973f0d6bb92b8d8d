//! Event store, timelines and consensus state machine
//!
//! Inbound events are batched per event id and processed one at a time by
//! a single consumer task. Each event lives in exactly one of the confirmed
//! `timeline` or the `unconfirmed` timeline, and is keyed into the
//! `deletion` timeline once it is due to expire.
//!
//! Our own received time doubles as our vote: it is persisted, sent to the
//! outgoing queue for gossip, and counted with the peers' votes whenever
//! consensus is recomputed.

use crate::clock::Clock;
use crate::config::Config;
use crate::membership::MemberTracker;
use crate::storage::{Datastore, DatastoreExt, KeySpace, StorageError};
use crate::timeline::Timeline;
use lambdadelta_core::canonical::from_canonical_bytes;
use lambdadelta_core::crypto::{event_id, payload_hash};
use lambdadelta_core::{
    calculate_consensus_time, EventHeader, EventId, MemberId, PublishedEvent, Rln, RlnProof,
    SignedEvent, Timestamp,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::RangeBounds;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Feed errors
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Encoding error: {0}")]
    Encoding(#[from] lambdadelta_core::Error),
    #[error("Payload does not match header hash for {0}")]
    PayloadMismatch(EventId),
    #[error("Stored event missing: {0}")]
    MissingEvent(EventId),
    #[error("Feed closed")]
    Closed,
}

/// Feed tunables, in milliseconds
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub claimed_tolerance_ms: u64,
    pub peer_tolerance_ms: u64,
    pub quorum: f64,
    pub deadlock_prevention_delay: Duration,
    pub unconfirmed_event_deletion_delay_ms: u64,
    pub deletion_delay_ms: u64,
    /// Nullifier records younger than this are never forgotten
    pub nullifier_retention_ms: u64,
}

impl From<&Config> for FeedConfig {
    fn from(config: &Config) -> Self {
        Self {
            claimed_tolerance_ms: config.claimed_tolerance_ms(),
            peer_tolerance_ms: config.peer_tolerance_ms(),
            quorum: config.quorum,
            deadlock_prevention_delay: config.deadlock_prevention_delay(),
            unconfirmed_event_deletion_delay_ms: config.unconfirmed_event_deletion_delay_ms(),
            deletion_delay_ms: config.deletion_delay_ms(),
            nullifier_retention_ms: config.deletion_delay_ms().max(config.membership_retention_ms()),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Timeline notifications
pub trait FeedObserver: Send + Sync {
    fn on_timeline_add(&self, _id: &EventId, _time: Timestamp) {}
    fn on_timeline_remove(&self, _id: &EventId) {}
    fn on_rejected(&self, _id: &EventId) {}
    fn on_deleted(&self, _id: &EventId) {}
}

/// A peer's received time for an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vote {
    pub member: MemberId,
    pub received: Timestamp,
}

/// Consensus verdict of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Pending,
    Confirmed,
    Rejected,
}

/// Per-event state
#[derive(Debug, Clone)]
pub struct EventMetadata {
    pub claimed: Timestamp,
    /// Our received time, set once published
    pub received: Option<Timestamp>,
    pub members_received: HashMap<MemberId, Timestamp>,
    pub status: EventStatus,
    failsafe_armed: bool,
}

impl EventMetadata {
    fn new(claimed: Timestamp) -> Self {
        Self {
            claimed,
            received: None,
            members_received: HashMap::new(),
            status: EventStatus::Pending,
            failsafe_armed: false,
        }
    }

    pub fn published(&self) -> bool {
        self.received.is_some()
    }

    /// Every vote collected, ours included
    fn votes(&self) -> Vec<f64> {
        self.members_received
            .values()
            .chain(self.received.iter())
            .map(|t| *t as f64)
            .collect()
    }
}

/// Result of adding an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddResult {
    pub event_id: EventId,
    pub exists: bool,
}

/// Outgoing queue items
#[derive(Debug, Clone)]
pub enum Outgoing {
    /// Gossip our vote for an event
    Publish(PublishedEvent),
    Closed,
}

/// One timeline entry with its stored event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub time: Timestamp,
    pub event_id: EventId,
    pub header: EventHeader,
    pub payload: Option<Vec<u8>>,
}

/// Feed statistics
#[derive(Debug, Clone, Default)]
pub struct FeedStats {
    pub events: usize,
    pub timeline: usize,
    pub unconfirmed: usize,
    pub scheduled_deletions: usize,
    pub inflight: usize,
    pub votes_received: u64,
    pub confirmed: u64,
    pub rejected: u64,
    pub deleted: u64,
}

#[derive(Serialize, Deserialize)]
struct StoredHeader {
    header: EventHeader,
    proof: RlnProof,
}

enum FeedCommand {
    Event(EventId),
    Failsafe(EventId),
    Close,
}

struct Inflight {
    event: SignedEvent,
    votes: Vec<Vote>,
    /// Earliest live received time reported for the event
    live_received: Option<Timestamp>,
}

enum Notification {
    Added(EventId, Timestamp),
    Removed(EventId),
    Rejected(EventId),
    Deleted(EventId),
}

#[derive(Default)]
struct FeedState {
    metadata: HashMap<EventId, EventMetadata>,
    timeline: Timeline,
    unconfirmed: Timeline,
    deletion: Timeline,
    inflight: HashMap<EventId, Inflight>,
    stats: FeedStats,
}

impl FeedState {
    /// Confirm placement in the timeline; confirmed events expire after `deletion_delay`
    fn place_timeline(&mut self, id: EventId, time: Timestamp, deletion_delay: u64, notes: &mut Vec<Notification>) {
        self.unconfirmed.remove(&id);
        if !self.timeline.contains(&id) {
            let slot = self.timeline.set_time(id, time);
            notes.push(Notification::Added(id, slot));
        }
        if !self.deletion.contains(&id) {
            self.deletion.set_time(id, time.saturating_add(deletion_delay));
        }
    }

    fn park_unconfirmed(&mut self, id: EventId, time: Timestamp, notes: &mut Vec<Notification>) {
        if self.timeline.remove(&id).is_some() {
            notes.push(Notification::Removed(id));
        }
        self.unconfirmed.set_time(id, time);
    }
}

/// Event feed for one topic
pub struct LambdadeltaFeed {
    topic: String,
    config: FeedConfig,
    store: Arc<dyn Datastore>,
    keys: KeySpace,
    clock: Arc<dyn Clock>,
    tracker: Arc<MemberTracker>,
    rln: Arc<dyn Rln>,
    state: Mutex<FeedState>,
    queue_tx: mpsc::UnboundedSender<FeedCommand>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<FeedCommand>>>,
    outgoing_tx: mpsc::UnboundedSender<Outgoing>,
    observers: RwLock<Vec<Arc<dyn FeedObserver>>>,
    closed: AtomicBool,
}

impl LambdadeltaFeed {
    /// Create a feed, restoring stored events, and return it with its outgoing queue
    pub fn new(
        topic: &str,
        config: FeedConfig,
        store: Arc<dyn Datastore>,
        clock: Arc<dyn Clock>,
        tracker: Arc<MemberTracker>,
        rln: Arc<dyn Rln>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<Outgoing>), FeedError> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let feed = Arc::new(Self {
            topic: topic.to_string(),
            config,
            store,
            keys: KeySpace::new("feed", topic),
            clock,
            tracker,
            rln,
            state: Mutex::new(FeedState::default()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            outgoing_tx,
            observers: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        let restored = feed.restore()?;
        if restored > 0 {
            info!("Restored {} events for topic {}", restored, topic);
        }
        Ok((feed, outgoing_rx))
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn add_observer(&self, observer: Arc<dyn FeedObserver>) {
        self.observers.write().push(observer);
    }

    /// Spawn the consumer of the received queue. Only the first call starts it.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.queue_rx.lock().take()?;
        let feed = self.clone();
        Some(tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let result = match command {
                    FeedCommand::Event(id) => feed.process_event(id),
                    FeedCommand::Failsafe(id) => feed.fire_failsafe(id),
                    FeedCommand::Close => {
                        feed.state.lock().inflight.clear();
                        break;
                    }
                };
                if let Err(e) = result {
                    warn!("Feed processing failed: {}", e);
                }
            }
            debug!("Feed consumer for {} stopped", feed.topic);
        }))
    }

    /// Stop the consumer and the outgoing queue
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.queue_tx.send(FeedCommand::Close);
        let _ = self.outgoing_tx.send(Outgoing::Closed);
    }

    /// Queue a verified event from the network.
    ///
    /// `live` is false for events from a bulk sync, which carry a vote but
    /// no timing information about when we saw them.
    pub fn recv_event(&self, event: SignedEvent, vote: Option<Vote>, live: bool) -> Result<(), FeedError> {
        if self.is_closed() {
            return Err(FeedError::Closed);
        }
        let id = event_id(&self.topic, &event.header);
        let live_received = vote.filter(|_| live).map(|v| v.received);

        let mut state = self.state.lock();
        if let Some(inflight) = state.inflight.get_mut(&id) {
            inflight.votes.extend(vote);
            inflight.live_received = match (inflight.live_received, live_received) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            if inflight.event.payload.is_none() {
                inflight.event.payload = event.payload;
            }
            trace!("Batched vote for inflight event {}", id);
            return Ok(());
        }
        state.inflight.insert(
            id,
            Inflight {
                event,
                votes: vote.into_iter().collect(),
                live_received,
            },
        );
        drop(state);

        if self.queue_tx.send(FeedCommand::Event(id)).is_err() {
            self.state.lock().inflight.remove(&id);
            return Err(FeedError::Closed);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Add a locally authored or fluffed event straight into the timeline
    pub fn add_event(
        &self,
        proof: RlnProof,
        header: EventHeader,
        payload: Option<Vec<u8>>,
    ) -> Result<AddResult, FeedError> {
        let id = event_id(&self.topic, &header);
        if let Some(payload) = &payload {
            if payload_hash(payload) != header.payload_hash {
                return Err(FeedError::PayloadMismatch(id));
            }
        }

        let mut notes = Vec::new();
        {
            let mut state = self.state.lock();
            if state.metadata.contains_key(&id) {
                return Ok(AddResult {
                    event_id: id,
                    exists: true,
                });
            }
            let claimed = header.claimed;
            let event = SignedEvent {
                header,
                proof,
                payload,
            };
            self.persist_event(&id, &event)?;
            state.metadata.insert(id, EventMetadata::new(claimed));
            self.publish_locked(&mut state, id, claimed, event)?;
            state.place_timeline(id, claimed, self.config.deletion_delay_ms, &mut notes);
        }
        debug!("Added event {}", id);
        self.notify(notes);
        Ok(AddResult {
            event_id: id,
            exists: false,
        })
    }

    /// Expire an event at `min(claimed + deletion delay, now + max_delay)`
    pub fn schedule_event_deletion(&self, id: &EventId, max_delay: Duration) -> bool {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        let Some(claimed) = state.metadata.get(id).map(|m| m.claimed) else {
            return false;
        };
        let at = claimed
            .saturating_add(self.config.deletion_delay_ms)
            .min(now.saturating_add(max_delay.as_millis() as u64));
        state.deletion.set_time(*id, at);
        true
    }

    fn process_event(&self, id: EventId) -> Result<(), FeedError> {
        let now = self.clock.now_ms();
        let tolerance = self.config.claimed_tolerance_ms;
        let mut notes = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(inflight) = state.inflight.remove(&id) else {
                return Ok(());
            };
            let claimed = inflight.event.header.claimed;

            let is_new = !state.metadata.contains_key(&id);
            if is_new {
                self.persist_event(&id, &inflight.event)?;
                state.metadata.insert(id, EventMetadata::new(claimed));
            } else if let Some(payload) = &inflight.event.payload {
                self.persist_payload(&id, &inflight.event.header, payload)?;
            }

            let mut changed = is_new;
            let published = {
                let Some(meta) = state.metadata.get_mut(&id) else {
                    return Ok(());
                };
                for vote in &inflight.votes {
                    if meta.members_received.insert(vote.member, vote.received) != Some(vote.received) {
                        self.tracker.record_event(&vote.member);
                        state.stats.votes_received += 1;
                        changed = true;
                    }
                }
                meta.published()
            };

            if !published {
                if let Some(peer_received) = inflight.live_received {
                    let received = if peer_received.abs_diff(now) <= self.config.peer_tolerance_ms {
                        peer_received
                    } else {
                        now
                    };
                    self.publish_locked(state, id, received, inflight.event)?;
                    if received.abs_diff(claimed) <= tolerance {
                        state.place_timeline(id, claimed, self.config.deletion_delay_ms, &mut notes);
                    } else {
                        state.park_unconfirmed(id, received, &mut notes);
                    }
                    changed = true;
                } else if is_new {
                    // Bulk sync: place by the votes that came with the event.
                    if inflight.votes.iter().any(|v| v.received.abs_diff(claimed) <= tolerance) {
                        state.place_timeline(id, claimed, self.config.deletion_delay_ms, &mut notes);
                    } else {
                        let at = inflight.votes.first().map_or(claimed, |v| v.received);
                        state.park_unconfirmed(id, at, &mut notes);
                    }
                }
            }

            if changed {
                self.update_consensus(state, id, false, &mut notes);
            }
        }
        self.notify(notes);
        self.collect_garbage()?;
        Ok(())
    }

    fn fire_failsafe(&self, id: EventId) -> Result<(), FeedError> {
        let mut notes = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(meta) = state.metadata.get_mut(&id) else {
                return Ok(());
            };
            meta.failsafe_armed = false;
            if state.timeline.contains(&id) {
                return Ok(());
            }
            debug!("Deadlock failsafe fired for {}", id);
            self.update_consensus(&mut state, id, true, &mut notes);
        }
        self.notify(notes);
        self.collect_garbage()?;
        Ok(())
    }

    /// Recompute consensus for `id`.
    ///
    /// `forced` uses only the votes collected as the peer count.
    fn update_consensus(&self, state: &mut FeedState, id: EventId, forced: bool, notes: &mut Vec<Notification>) {
        let Some(meta) = state.metadata.get(&id) else {
            return;
        };
        let votes = meta.votes();
        let claimed = meta.claimed;
        let total = if forced {
            votes.len()
        } else {
            self.tracker.active_count().max(votes.len())
        };

        let decision = calculate_consensus_time(
            &votes,
            total,
            claimed as f64,
            self.config.claimed_tolerance_ms as f64,
            self.config.quorum,
        );
        trace!("Consensus for {} with {}/{} votes: {:?}", id, votes.len(), total, decision);

        match decision {
            None => {
                if forced {
                    return;
                }
                if let Some(meta) = state.metadata.get_mut(&id) {
                    if !meta.failsafe_armed {
                        meta.failsafe_armed = true;
                        self.arm_failsafe(id);
                    }
                }
            }
            Some(consensus) if consensus.acceptable => {
                if let Some(meta) = state.metadata.get_mut(&id) {
                    if meta.status != EventStatus::Confirmed {
                        meta.status = EventStatus::Confirmed;
                        state.stats.confirmed += 1;
                    }
                }
                state.place_timeline(id, claimed, self.config.deletion_delay_ms, notes);
            }
            Some(consensus) => {
                let first_rejection = match state.metadata.get_mut(&id) {
                    Some(meta) if meta.status != EventStatus::Rejected => {
                        meta.status = EventStatus::Rejected;
                        true
                    }
                    _ => false,
                };
                if first_rejection {
                    state.stats.rejected += 1;
                }
                let was_placed = state.timeline.contains(&id);
                state.park_unconfirmed(id, consensus.consensus_time.max(0.0) as Timestamp, notes);
                if !was_placed && first_rejection {
                    notes.push(Notification::Rejected(id));
                }
            }
        }
    }

    fn arm_failsafe(&self, id: EventId) {
        let tx = self.queue_tx.clone();
        let delay = self.config.deadlock_prevention_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(FeedCommand::Failsafe(id));
        });
    }

    /// Delete matured and stale events; returns how many were removed
    pub fn collect_garbage(&self) -> Result<usize, FeedError> {
        let now = self.clock.now_ms();
        let mut notes = Vec::new();
        let removed = {
            let mut state = self.state.lock();
            let mut expired = state.deletion.before(now.saturating_add(1));
            expired.extend(
                state
                    .unconfirmed
                    .before(now.saturating_sub(self.config.unconfirmed_event_deletion_delay_ms)),
            );
            expired.sort_unstable();
            expired.dedup();
            for id in &expired {
                self.delete_locked(&mut state, id, &mut notes)?;
            }
            expired.len()
        };
        if removed > 0 {
            debug!("Garbage collected {} events", removed);
        }
        let forgotten = self
            .rln
            .forget_before(now.saturating_sub(self.config.nullifier_retention_ms));
        if forgotten > 0 {
            trace!("Forgot {} nullifier records", forgotten);
        }
        self.notify(notes);
        Ok(removed)
    }

    fn delete_locked(&self, state: &mut FeedState, id: &EventId, notes: &mut Vec<Notification>) -> Result<(), FeedError> {
        if state.timeline.remove(id).is_some() {
            notes.push(Notification::Removed(*id));
        }
        state.unconfirmed.remove(id);
        state.deletion.remove(id);
        state.metadata.remove(id);
        let hex = id.to_hex();
        for component in ["header", "payload", "published"] {
            self.store.delete(&self.keys.key(&[component, &hex]))?;
        }
        state.stats.deleted += 1;
        notes.push(Notification::Deleted(*id));
        Ok(())
    }

    fn publish_locked(
        &self,
        state: &mut FeedState,
        id: EventId,
        received: Timestamp,
        event: SignedEvent,
    ) -> Result<(), FeedError> {
        if let Some(meta) = state.metadata.get_mut(&id) {
            meta.received = Some(received);
        }
        self.store
            .put_value(&self.keys.key(&["published", &id.to_hex()]), &received)?;
        let published = PublishedEvent {
            event_id: id,
            event,
            received,
        };
        if self.outgoing_tx.send(Outgoing::Publish(published)).is_err() {
            debug!("No consumer for outgoing event {}", id);
        }
        Ok(())
    }

    fn persist_event(&self, id: &EventId, event: &SignedEvent) -> Result<(), FeedError> {
        let hex = id.to_hex();
        self.store.put_value(
            &self.keys.key(&["header", &hex]),
            &StoredHeader {
                header: event.header.clone(),
                proof: event.proof.clone(),
            },
        )?;
        if let Some(payload) = &event.payload {
            self.persist_payload(id, &event.header, payload)?;
        }
        Ok(())
    }

    fn persist_payload(&self, id: &EventId, header: &EventHeader, payload: &[u8]) -> Result<(), FeedError> {
        if payload_hash(payload) != header.payload_hash {
            warn!("Dropping payload with wrong hash for {}", id);
            return Ok(());
        }
        self.store
            .put(&self.keys.key(&["payload", &id.to_hex()]), payload)?;
        Ok(())
    }

    /// Rebuild in-memory state from the datastore
    fn restore(&self) -> Result<usize, FeedError> {
        let tolerance = self.config.claimed_tolerance_ms;
        let mut state = self.state.lock();
        let mut notes = Vec::new();
        let mut count = 0;
        for entry in self.store.query(&self.keys.prefix(&["header"])) {
            let (key, value) = entry?;
            let id = EventId::from_hex(self.keys.leaf(&key)?)?;
            let stored: StoredHeader = from_canonical_bytes(&value)?;
            let claimed = stored.header.claimed;
            let received: Option<Timestamp> = self
                .store
                .get_value(&self.keys.key(&["published", &id.to_hex()]))?;

            let mut meta = EventMetadata::new(claimed);
            meta.received = received;
            state.metadata.insert(id, meta);
            match received {
                Some(r) if r.abs_diff(claimed) <= tolerance => {
                    state.place_timeline(id, claimed, self.config.deletion_delay_ms, &mut notes)
                }
                Some(r) => state.park_unconfirmed(id, r, &mut notes),
                None => state.park_unconfirmed(id, claimed, &mut notes),
            }
            count += 1;
        }
        Ok(count)
    }

    fn notify(&self, notes: Vec<Notification>) {
        if notes.is_empty() {
            return;
        }
        let observers = self.observers.read().clone();
        for note in notes {
            match note {
                Notification::Added(id, time) => {
                    trace!("Timeline add {} at {}", id, time);
                    observers.iter().for_each(|o| o.on_timeline_add(&id, time));
                }
                Notification::Removed(id) => {
                    debug!("Timeline remove {}", id);
                    observers.iter().for_each(|o| o.on_timeline_remove(&id));
                }
                Notification::Rejected(id) => {
                    debug!("Rejected {}", id);
                    observers.iter().for_each(|o| o.on_rejected(&id));
                }
                Notification::Deleted(id) => {
                    observers.iter().for_each(|o| o.on_deleted(&id));
                }
            }
        }
    }

    /// Whether the event is known or being processed
    pub fn has_event(&self, id: &EventId) -> bool {
        let state = self.state.lock();
        state.metadata.contains_key(id) || state.inflight.contains_key(id)
    }

    pub fn metadata(&self, id: &EventId) -> Option<EventMetadata> {
        self.state.lock().metadata.get(id).cloned()
    }

    /// Time of the event in the confirmed timeline
    pub fn timeline_time(&self, id: &EventId) -> Option<Timestamp> {
        self.state.lock().timeline.get_time(id)
    }

    /// Time of the event in the unconfirmed timeline
    pub fn unconfirmed_time(&self, id: &EventId) -> Option<Timestamp> {
        self.state.lock().unconfirmed.get_time(id)
    }

    pub fn get_event(&self, id: &EventId) -> Result<Option<SignedEvent>, FeedError> {
        let stored: Option<StoredHeader> = self.store.get_value(&self.keys.key(&["header", &id.to_hex()]))?;
        let Some(stored) = stored else {
            return Ok(None);
        };
        Ok(Some(SignedEvent {
            header: stored.header,
            proof: stored.proof,
            payload: self.get_payload(id)?,
        }))
    }

    pub fn get_payload(&self, id: &EventId) -> Result<Option<Vec<u8>>, FeedError> {
        Ok(self.store.get(&self.keys.key(&["payload", &id.to_hex()]))?)
    }

    /// Confirmed timeline entries within `range`, at most `limit`
    pub fn get_events<R: RangeBounds<Timestamp>>(&self, range: R, limit: usize) -> Result<Vec<FeedEntry>, FeedError> {
        let ids: Vec<(Timestamp, EventId)> = self.state.lock().timeline.range(range).take(limit).collect();
        let mut entries = Vec::with_capacity(ids.len());
        for (time, event_id) in ids {
            // Deleted between the snapshot and the read.
            let Some(event) = self.get_event(&event_id)? else {
                continue;
            };
            entries.push(FeedEntry {
                time,
                event_id,
                header: event.header,
                payload: event.payload,
            });
        }
        Ok(entries)
    }

    /// Every event we published a vote for, read lazily from the store
    pub fn published_events(&self) -> impl Iterator<Item = Result<PublishedEvent, FeedError>> + '_ {
        self.store
            .query(&self.keys.prefix(&["published"]))
            .map(move |entry| {
                let (key, value) = entry?;
                let event_id = EventId::from_hex(self.keys.leaf(&key)?)?;
                let received: Timestamp = from_canonical_bytes(&value)?;
                let event = self
                    .get_event(&event_id)?
                    .ok_or(FeedError::MissingEvent(event_id))?;
                Ok(PublishedEvent {
                    event_id,
                    event,
                    received,
                })
            })
    }

    pub fn stats(&self) -> FeedStats {
        let state = self.state.lock();
        FeedStats {
            events: state.metadata.len(),
            timeline: state.timeline.len(),
            unconfirmed: state.unconfirmed.len(),
            scheduled_deletions: state.deletion.len(),
            inflight: state.inflight.len(),
            ..state.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::membership::{generate_member_cid, verify_member_cid_proof, MemberCidPolicy, MembershipError};
    use crate::storage::{MemoryDatastore, SledDatastore};
    use lambdadelta_core::{RlnGroup, RlnIdentity, TransparentRln, VerificationResult};
    use lambdadelta_net::KeyPair;
    use tempfile::tempdir;

    const NOW: u64 = 1_700_000_000_000;
    const TOPIC: &str = "news";

    #[derive(Default)]
    struct Recorder {
        added: Mutex<Vec<EventId>>,
        removed: Mutex<Vec<EventId>>,
        rejected: Mutex<Vec<EventId>>,
        deleted: Mutex<Vec<EventId>>,
    }

    impl FeedObserver for Recorder {
        fn on_timeline_add(&self, id: &EventId, _time: Timestamp) {
            self.added.lock().push(*id);
        }
        fn on_timeline_remove(&self, id: &EventId) {
            self.removed.lock().push(*id);
        }
        fn on_rejected(&self, id: &EventId) {
            self.rejected.lock().push(*id);
        }
        fn on_deleted(&self, id: &EventId) {
            self.deleted.lock().push(*id);
        }
    }

    struct Fixture {
        feed: Arc<LambdadeltaFeed>,
        outgoing: mpsc::UnboundedReceiver<Outgoing>,
        clock: Arc<ManualClock>,
        tracker: Arc<MemberTracker>,
        recorder: Arc<Recorder>,
        store: Arc<dyn Datastore>,
        task: Option<JoinHandle<()>>,
    }

    fn fixture_with(store: Arc<dyn Datastore>, clock: Arc<ManualClock>) -> Fixture {
        let tracker = Arc::new(MemberTracker::new(clock.clone(), 900_000));
        let (feed, outgoing) = LambdadeltaFeed::new(
            TOPIC,
            FeedConfig::default(),
            store.clone(),
            clock.clone(),
            tracker.clone(),
            Arc::new(TransparentRln::verifier(RlnGroup::new([]))),
        )
        .unwrap();
        let recorder = Arc::new(Recorder::default());
        feed.add_observer(recorder.clone());
        let task = feed.start();
        Fixture {
            feed,
            outgoing,
            clock,
            tracker,
            recorder,
            store,
            task,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(MemoryDatastore::new()), Arc::new(ManualClock::new(NOW)))
    }

    fn event(claimed: Timestamp, body: &[u8]) -> SignedEvent {
        let header = EventHeader {
            event_type: "POST".into(),
            claimed,
            payload_hash: payload_hash(body),
        };
        let id = event_id(TOPIC, &header);
        SignedEvent {
            header,
            proof: RlnProof {
                signal: id.to_hex(),
                rln_identifier: format!("{TOPIC}.POST"),
                external_nullifiers: vec![],
                shares: vec![],
                root: [0; 32],
                snark_proof: vec![],
            },
            payload: Some(body.to_vec()),
        }
    }

    fn vote(member: u8, received: Timestamp) -> Vote {
        Vote {
            member: MemberId([member; 32]),
            received,
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_add_event_is_idempotent() {
        let mut fx = fixture();
        let e = event(NOW, b"hello");

        let first = fx
            .feed
            .add_event(e.proof.clone(), e.header.clone(), e.payload.clone())
            .unwrap();
        assert!(!first.exists);
        let second = fx.feed.add_event(e.proof, e.header, e.payload).unwrap();
        assert!(second.exists);
        assert_eq!(first.event_id, second.event_id);

        assert!(matches!(fx.outgoing.try_recv(), Ok(Outgoing::Publish(p)) if p.received == NOW));
        assert!(fx.outgoing.try_recv().is_err());
        assert_eq!(fx.feed.timeline_time(&first.event_id), Some(NOW));
        assert_eq!(fx.feed.published_events().count(), 1);
        assert_eq!(*fx.recorder.added.lock(), vec![first.event_id]);
    }

    #[tokio::test]
    async fn test_add_event_rejects_wrong_payload() {
        let fx = fixture();
        let e = event(NOW, b"hello");
        assert!(matches!(
            fx.feed.add_event(e.proof, e.header, Some(b"other".to_vec())),
            Err(FeedError::PayloadMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_live_event_adopts_close_peer_time() {
        let mut fx = fixture();
        let e = event(NOW - 500, b"live");
        let id = event_id(TOPIC, &e.header);

        fx.feed.recv_event(e, Some(vote(1, NOW - 400)), true).unwrap();
        wait_for(|| fx.feed.timeline_time(&id).is_some()).await;

        let meta = fx.feed.metadata(&id).unwrap();
        assert_eq!(meta.received, Some(NOW - 400));
        assert_eq!(meta.status, EventStatus::Confirmed);
        match fx.outgoing.try_recv() {
            Ok(Outgoing::Publish(p)) => {
                assert_eq!(p.event_id, id);
                assert_eq!(p.received, NOW - 400);
            }
            other => panic!("expected publish, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_distant_peer_time_is_replaced_by_ours() {
        let fx = fixture();
        let e = event(NOW, b"skewed");
        let id = event_id(TOPIC, &e.header);

        fx.feed.recv_event(e, Some(vote(1, NOW - 60_000)), true).unwrap();
        wait_for(|| fx.feed.metadata(&id).map_or(false, |m| m.published())).await;
        assert_eq!(fx.feed.metadata(&id).unwrap().received, Some(NOW));
    }

    #[tokio::test]
    async fn test_backdated_event_is_rejected() {
        let fx = fixture();
        let e = event(NOW - 60_000, b"backdated");
        let id = event_id(TOPIC, &e.header);

        fx.feed.recv_event(e, Some(vote(1, NOW)), true).unwrap();
        wait_for(|| !fx.recorder.rejected.lock().is_empty()).await;

        assert_eq!(fx.feed.timeline_time(&id), None);
        assert_eq!(fx.feed.unconfirmed_time(&id), Some(NOW));
        assert_eq!(fx.feed.metadata(&id).unwrap().status, EventStatus::Rejected);
        assert!(fx.recorder.added.lock().is_empty());
    }

    #[tokio::test]
    async fn test_votes_can_evict_optimistic_placement() {
        let fx = fixture();
        let e = event(NOW, b"contested");
        let id = event_id(TOPIC, &e.header);
        for m in 1..=4 {
            fx.tracker.observe(MemberId([m; 32])).unwrap();
        }

        fx.feed.recv_event(e.clone(), Some(vote(1, NOW)), true).unwrap();
        wait_for(|| fx.feed.timeline_time(&id).is_some()).await;

        // Three more members saw it a minute later.
        for m in 2..=4 {
            fx.feed.recv_event(e.clone(), Some(vote(m, NOW + 60_000)), true).unwrap();
        }
        wait_for(|| !fx.recorder.removed.lock().is_empty()).await;

        assert_eq!(fx.feed.timeline_time(&id), None);
        assert!(fx.feed.unconfirmed_time(&id).is_some());
        assert!(fx.recorder.rejected.lock().is_empty());
        assert_eq!(fx.feed.stats().votes_received, 4);
    }

    #[tokio::test]
    async fn test_bulk_event_placed_by_votes() {
        let mut fx = fixture();
        let fresh = event(NOW, b"fresh");
        let stale = event(NOW - 3_600_000, b"stale");
        let fresh_id = event_id(TOPIC, &fresh.header);
        let stale_id = event_id(TOPIC, &stale.header);

        fx.feed.recv_event(fresh, Some(vote(1, NOW + 100)), false).unwrap();
        fx.feed.recv_event(stale, Some(vote(1, NOW)), false).unwrap();
        wait_for(|| fx.feed.stats().events == 2).await;

        assert_eq!(fx.feed.timeline_time(&fresh_id), Some(NOW));
        assert_eq!(fx.feed.timeline_time(&stale_id), None);
        // Bulk arrivals carry no timing for us, so nothing is published.
        assert!(!fx.feed.metadata(&fresh_id).unwrap().published());
        assert!(fx.outgoing.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failsafe_forces_decision() {
        let fx = fixture();
        for m in 1..=5 {
            fx.tracker.observe(MemberId([m; 32])).unwrap();
        }
        let e = event(NOW - 60_000, b"stuck");
        let id = event_id(TOPIC, &e.header);

        // One bulk vote against five active members: no quorum.
        fx.feed.recv_event(e, Some(vote(1, NOW)), false).unwrap();
        wait_for(|| fx.feed.stats().events == 1).await;
        assert_eq!(fx.feed.metadata(&id).unwrap().status, EventStatus::Pending);

        tokio::time::sleep(Duration::from_secs(301)).await;
        wait_for(|| fx.feed.metadata(&id).map_or(false, |m| m.status == EventStatus::Rejected)).await;
        assert_eq!(*fx.recorder.rejected.lock(), vec![id]);
    }

    #[tokio::test]
    async fn test_garbage_collection() {
        let fx = fixture();
        let kept = event(NOW, b"kept");
        let kept_id = fx
            .feed
            .add_event(kept.proof, kept.header, kept.payload)
            .unwrap()
            .event_id;
        let spam = event(NOW - 60_000, b"spam");
        let spam_id = event_id(TOPIC, &spam.header);
        fx.feed.recv_event(spam, Some(vote(1, NOW)), true).unwrap();
        wait_for(|| fx.feed.unconfirmed_time(&spam_id).is_some()).await;

        fx.clock.advance(601_000);
        assert_eq!(fx.feed.collect_garbage().unwrap(), 1);
        assert!(!fx.feed.has_event(&spam_id));
        assert!(fx.feed.get_event(&spam_id).unwrap().is_none());
        assert!(fx.feed.has_event(&kept_id));

        assert!(fx.feed.schedule_event_deletion(&kept_id, Duration::from_secs(1)));
        fx.clock.advance(1_000);
        assert_eq!(fx.feed.collect_garbage().unwrap(), 1);
        assert!(fx.feed.get_events(.., usize::MAX).unwrap().is_empty());
        assert_eq!(fx.recorder.deleted.lock().len(), 2);
        assert_eq!(*fx.recorder.removed.lock(), vec![kept_id]);
    }

    #[tokio::test]
    async fn test_get_events_orders_collisions() {
        let fx = fixture();
        let mut ids = Vec::new();
        for body in [b"a", b"b", b"c"] {
            let e = event(NOW, body);
            ids.push(fx.feed.add_event(e.proof, e.header, e.payload).unwrap().event_id);
        }
        let entries = fx.feed.get_events(.., 10).unwrap();
        let times: Vec<_> = entries.iter().map(|e| e.time).collect();
        assert_eq!(times, vec![NOW, NOW + 1, NOW + 2]);
        assert_eq!(entries.iter().map(|e| e.event_id).collect::<Vec<_>>(), ids);
        assert_eq!(fx.feed.get_events(NOW + 1.., 1).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_restore_from_store() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(NOW));
        let id = {
            let store = Arc::new(SledDatastore::open(dir.path()).unwrap());
            let fx = fixture_with(store, clock.clone());
            let e = event(NOW, b"durable");
            let id = fx.feed.add_event(e.proof, e.header, e.payload).unwrap().event_id;
            fx.feed.close();
            fx.task.unwrap().await.unwrap();
            fx.store.flush().unwrap();
            id
        };

        let store = Arc::new(SledDatastore::open(dir.path()).unwrap());
        let fx = fixture_with(store, clock);
        assert_eq!(fx.feed.timeline_time(&id), Some(NOW));
        assert_eq!(fx.feed.get_payload(&id).unwrap(), Some(b"durable".to_vec()));
        let published: Vec<_> = fx.feed.published_events().map(|p| p.unwrap()).collect();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].received, NOW);
    }

    #[tokio::test]
    async fn test_closed_feed_refuses_events() {
        let fx = fixture();
        fx.feed.close();
        assert!(fx.feed.is_closed());
        assert!(matches!(
            fx.feed.recv_event(event(NOW, b"late"), None, false),
            Err(FeedError::Closed)
        ));
        // A second vote for the same event is refused too, not batched.
        assert!(matches!(
            fx.feed.recv_event(event(NOW, b"late"), None, false),
            Err(FeedError::Closed)
        ));
        assert_eq!(fx.feed.stats().inflight, 0);
        fx.task.unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn test_gc_keeps_membership_slots_while_accepted() {
        let alice = RlnIdentity::from_seed(b"alice");
        let group = RlnGroup::new([alice.commitment()]);
        let prover = TransparentRln::new(Some(alice), group.clone());
        let verifier = Arc::new(TransparentRln::verifier(group));
        let clock = Arc::new(ManualClock::new(NOW));
        let config = Config::default();
        let policy = MemberCidPolicy {
            epoch_secs: config.membership_epoch_secs,
            tolerance: config.membership_epoch_tolerance,
        };
        let (feed, _outgoing) = LambdadeltaFeed::new(
            TOPIC,
            FeedConfig::from(&config),
            Arc::new(MemoryDatastore::new()),
            clock.clone(),
            Arc::new(MemberTracker::new(clock.clone(), 900_000)),
            verifier.clone(),
        )
        .unwrap();

        // Late in the epoch a proof for the previous one is still in tolerance,
        // and its epoch started longer ago than the event deletion delay.
        let previous = policy.epoch_at(NOW) - 1;
        clock.advance(99_000_000);
        assert!(config.deletion_delay_ms() < clock.now_ms() - NOW + config.membership_epoch_secs * 1000);

        let a = KeyPair::from_seed(&[1; 32]).peer_id();
        let b = KeyPair::from_seed(&[2; 32]).peer_id();
        let first = generate_member_cid(&a, &prover, previous).unwrap();
        verify_member_cid_proof(&first, Some(&a), verifier.as_ref(), policy, clock.now_ms()).unwrap();

        feed.collect_garbage().unwrap();

        let reused = generate_member_cid(&b, &prover, previous).unwrap();
        assert!(matches!(
            verify_member_cid_proof(&reused, Some(&b), verifier.as_ref(), policy, clock.now_ms()),
            Err(MembershipError::Proof(VerificationResult::Breach))
        ));
        assert_eq!(verifier.slashed().len(), 1);
    }

    #[tokio::test]
    async fn test_gc_forgets_slots_past_acceptance() {
        let alice = RlnIdentity::from_seed(b"alice");
        let group = RlnGroup::new([alice.commitment()]);
        let prover = TransparentRln::new(Some(alice), group.clone());
        let verifier = Arc::new(TransparentRln::verifier(group));
        let clock = Arc::new(ManualClock::new(NOW));
        let config = Config::default();
        let (feed, _outgoing) = LambdadeltaFeed::new(
            TOPIC,
            FeedConfig::from(&config),
            Arc::new(MemoryDatastore::new()),
            clock.clone(),
            Arc::new(MemberTracker::new(clock.clone(), 900_000)),
            verifier.clone(),
        )
        .unwrap();
        let policy = MemberCidPolicy {
            epoch_secs: config.membership_epoch_secs,
            tolerance: config.membership_epoch_tolerance,
        };
        let a = KeyPair::from_seed(&[1; 32]).peer_id();
        let proof = generate_member_cid(&a, &prover, policy.epoch_at(NOW)).unwrap();
        verify_member_cid_proof(&proof, Some(&a), verifier.as_ref(), policy, NOW).unwrap();

        clock.advance(config.membership_retention_ms());
        feed.collect_garbage().unwrap();
        // Still remembered at the edge of the window, so the proof is a duplicate.
        assert_eq!(verifier.submit_proof(&proof, Some(NOW)), VerificationResult::Duplicate);

        clock.advance(1);
        feed.collect_garbage().unwrap();
        assert_eq!(verifier.submit_proof(&proof, Some(NOW)), VerificationResult::Valid);
    }
}
