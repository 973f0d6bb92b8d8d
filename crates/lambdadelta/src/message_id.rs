//! RLN message id registry
//!
//! Hands out the next message id for every rate-limit window of an event
//! type. Counters persist in the datastore so a restarted node never reuses
//! a slot (which would be a breach and get it slashed).

use crate::clock::Clock;
use crate::config::EventTypeSpecs;
use crate::storage::{Datastore, DatastoreExt, KeySpace, StorageError};
use lambdadelta_core::NullifierInput;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
    #[error("Message limit {limit} reached for {event_type} window {index} (epoch {epoch})")]
    MessageLimitReached {
        event_type: String,
        index: usize,
        epoch: u64,
        limit: u32,
    },
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

struct Slot {
    key: String,
    index: usize,
    epoch: u64,
    limit: u32,
}

/// Per-window message id counters
pub struct MessageIdRegistry {
    store: Arc<dyn Datastore>,
    keys: KeySpace,
    specs: EventTypeSpecs,
    clock: Arc<dyn Clock>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MessageIdRegistry {
    pub fn new(
        store: Arc<dyn Datastore>,
        topic: &str,
        specs: EventTypeSpecs,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            keys: KeySpace::new("messageid", topic),
            specs,
            clock,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Allocate the next message id in every window of `event_type`.
    ///
    /// Either all windows advance or none do.
    pub async fn create_nullifier(
        &self,
        event_type: &str,
    ) -> Result<Vec<NullifierInput>, RegistryError> {
        let specs = self
            .specs
            .get(event_type)
            .ok_or_else(|| RegistryError::UnknownEventType(event_type.to_string()))?;
        let now = self.clock.now_ms();

        let slots: Vec<Slot> = specs
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                let epoch = spec.epoch_at(now);
                Slot {
                    key: self.keys.key(&[event_type, &index.to_string(), &epoch.to_string()]),
                    index,
                    epoch,
                    limit: spec.message_limit,
                }
            })
            .collect();

        // Locks are taken in window order so concurrent callers cannot deadlock.
        let mut guards = Vec::with_capacity(slots.len());
        for slot in &slots {
            guards.push(self.lock_for(&slot.key).lock_owned().await);
        }

        let result = self.allocate(event_type, &slots);

        drop(guards);
        self.locks.lock().retain(|_, lock| Arc::strong_count(lock) > 1);
        result
    }

    fn allocate(&self, event_type: &str, slots: &[Slot]) -> Result<Vec<NullifierInput>, RegistryError> {
        let mut next = Vec::with_capacity(slots.len());
        for slot in slots {
            let last: Option<u32> = self.store.get_value(&slot.key)?;
            let id = last.map_or(0, |l| l + 1);
            if id >= slot.limit {
                return Err(RegistryError::MessageLimitReached {
                    event_type: event_type.to_string(),
                    index: slot.index,
                    epoch: slot.epoch,
                    limit: slot.limit,
                });
            }
            next.push(id);
        }

        for (slot, id) in slots.iter().zip(&next) {
            self.store.put_value(&slot.key, id)?;
        }
        debug!("Allocated message ids {:?} for {}", next, event_type);

        Ok(slots
            .iter()
            .zip(next)
            .map(|(slot, message_id)| NullifierInput {
                nullifier: slot.epoch,
                message_limit: slot.limit,
                message_id,
            })
            .collect())
    }

    /// Delete counters of windows that have already ended
    pub fn prune(&self) -> Result<usize, RegistryError> {
        let now = self.clock.now_ms();
        let mut removed = 0;
        for (event_type, specs) in &self.specs {
            for (index, spec) in specs.iter().enumerate() {
                let current = spec.epoch_at(now);
                let prefix = self.keys.prefix(&[event_type, &index.to_string()]);
                let stale: Vec<String> = self
                    .store
                    .query(&prefix)
                    .filter_map(|entry| entry.ok())
                    .map(|(key, _)| key)
                    .filter(|key| {
                        self.keys
                            .leaf(key)
                            .ok()
                            .and_then(|e| e.parse::<u64>().ok())
                            .map_or(false, |epoch| epoch < current)
                    })
                    .collect();
                for key in stale {
                    self.store.delete(&key)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::default_event_types;
    use crate::storage::{MemoryDatastore, SledDatastore};
    use lambdadelta_core::NullifierSpec;
    use tempfile::tempdir;

    fn registry(store: Arc<dyn Datastore>, clock: Arc<ManualClock>) -> MessageIdRegistry {
        MessageIdRegistry::new(store, "news", default_event_types(), clock)
    }

    #[tokio::test]
    async fn test_first_allocation_starts_at_zero() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let reg = registry(Arc::new(MemoryDatastore::new()), clock);

        let inputs = reg.create_nullifier("POST").await.unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[0].message_id, 0);
        assert_eq!(inputs[0].message_limit, 1);
        assert_eq!(inputs[0].nullifier, 100);
        assert_eq!(inputs[1].message_limit, 2048);
        assert_eq!(inputs[1].nullifier, 0);
    }

    #[tokio::test]
    async fn test_limit_failure_advances_nothing() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let reg = registry(Arc::new(MemoryDatastore::new()), clock.clone());

        reg.create_nullifier("POST").await.unwrap();
        let err = reg.create_nullifier("POST").await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::MessageLimitReached { index: 0, limit: 1, .. }
        ));

        // Daily window must not have moved on the failed attempt.
        clock.advance(10_000);
        let inputs = reg.create_nullifier("POST").await.unwrap();
        assert_eq!(inputs[0].message_id, 0);
        assert_eq!(inputs[1].message_id, 1);
    }

    #[tokio::test]
    async fn test_unknown_event_type() {
        let reg = registry(Arc::new(MemoryDatastore::new()), Arc::new(ManualClock::new(0)));
        assert!(matches!(
            reg.create_nullifier("VOTE").await,
            Err(RegistryError::UnknownEventType(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_allocations_are_unique() {
        let mut specs = EventTypeSpecs::new();
        specs.insert("CHAT".into(), vec![NullifierSpec::new(60, 5)]);
        let reg = Arc::new(MessageIdRegistry::new(
            Arc::new(MemoryDatastore::new()),
            "news",
            specs,
            Arc::new(ManualClock::new(0)),
        ));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let reg = reg.clone();
                tokio::spawn(async move { reg.create_nullifier("CHAT").await })
            })
            .collect();

        let mut ids = Vec::new();
        let mut failures = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(inputs) => ids.push(inputs[0].message_id),
                Err(RegistryError::MessageLimitReached { .. }) => failures += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert_eq!(failures, 5);
    }

    #[tokio::test]
    async fn test_counters_survive_restart() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_000_000));
        {
            let store = Arc::new(SledDatastore::open(dir.path()).unwrap());
            let reg = registry(store.clone(), clock.clone());
            reg.create_nullifier("POST").await.unwrap();
            store.flush().unwrap();
        }
        let store = Arc::new(SledDatastore::open(dir.path()).unwrap());
        let reg = registry(store, clock);
        assert!(reg.create_nullifier("POST").await.is_err());
    }

    #[tokio::test]
    async fn test_prune_drops_ended_windows() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let reg = registry(Arc::new(MemoryDatastore::new()), clock.clone());
        reg.create_nullifier("POST").await.unwrap();

        clock.advance(20_000);
        assert_eq!(reg.prune().unwrap(), 1);
    }
}
