//! Time-ordered event index

use lambdadelta_core::{EventId, Timestamp};
use std::collections::{BTreeMap, HashMap};
use std::ops::RangeBounds;

/// Events ordered by time.
///
/// Times are unique keys: an insert at an occupied time moves forward one
/// millisecond at a time until it finds a free slot, so events that collide
/// keep their insertion order.
#[derive(Debug, Default, Clone)]
pub struct Timeline {
    by_time: BTreeMap<Timestamp, EventId>,
    by_id: HashMap<EventId, Timestamp>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `id` at `time`, moving it if already present. Returns the slot used.
    pub fn set_time(&mut self, id: EventId, time: Timestamp) -> Timestamp {
        if let Some(current) = self.by_id.get(&id) {
            if *current == time {
                return time;
            }
        }
        self.remove(&id);

        let mut slot = time;
        while self.by_time.contains_key(&slot) {
            slot = slot.saturating_add(1);
        }
        self.by_time.insert(slot, id);
        self.by_id.insert(id, slot);
        slot
    }

    pub fn get_time(&self, id: &EventId) -> Option<Timestamp> {
        self.by_id.get(id).copied()
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn remove(&mut self, id: &EventId) -> Option<Timestamp> {
        let time = self.by_id.remove(id)?;
        self.by_time.remove(&time);
        Some(time)
    }

    /// Entries within `range`, in time order
    pub fn range<R: RangeBounds<Timestamp>>(&self, range: R) -> impl Iterator<Item = (Timestamp, EventId)> + '_ {
        self.by_time.range(range).map(|(t, id)| (*t, *id))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Timestamp, EventId)> + '_ {
        self.range(..)
    }

    /// Ids of entries strictly before `time`
    pub fn before(&self, time: Timestamp) -> Vec<EventId> {
        self.by_time.range(..time).map(|(_, id)| *id).collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
