//! Key-value datastore
//!
//! Every component persists under `/lambdadelta/{component}/{topicHash}/...`
//! so several topics can share one store. [`SledDatastore`] is the durable
//! backend, [`MemoryDatastore`] is used for ephemeral nodes and tests.

use lambdadelta_core::canonical::{canonical_bytes, from_canonical_bytes};
use lambdadelta_core::crypto::topic_hash;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::Db;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Key namespace root
pub const PROTOCOL: &str = "lambdadelta";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] lambdadelta_core::Error),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

/// Entries returned by a prefix query
pub type QueryIter<'a> = Box<dyn Iterator<Item = Result<(String, Vec<u8>), StorageError>> + 'a>;

/// Byte-oriented key-value store
pub trait Datastore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    fn delete(&self, key: &str) -> Result<(), StorageError>;

    fn has(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key)?.is_some())
    }

    /// All entries whose key starts with `prefix`, in key order
    fn query(&self, prefix: &str) -> QueryIter<'_>;

    fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StorageError> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Typed access over canonical encoding
pub trait DatastoreExt: Datastore {
    fn get_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(from_canonical_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_value<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        self.put(key, &canonical_bytes(value)?)
    }
}

impl<D: Datastore + ?Sized> DatastoreExt for D {}

/// Key builder for one component on one topic
#[derive(Clone, Debug)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(component: &str, topic: &str) -> Self {
        Self {
            prefix: format!("/{PROTOCOL}/{component}/{}", topic_hash(topic)),
        }
    }

    /// Full key for `parts` under this namespace
    pub fn key(&self, parts: &[&str]) -> String {
        let mut key = self.prefix.clone();
        for part in parts {
            key.push('/');
            key.push_str(part);
        }
        key
    }

    /// Prefix matching every key under `parts`
    pub fn prefix(&self, parts: &[&str]) -> String {
        let mut prefix = self.key(parts);
        prefix.push('/');
        prefix
    }

    /// Last path segment of a key from this namespace
    pub fn leaf<'a>(&self, key: &'a str) -> Result<&'a str, StorageError> {
        key.strip_prefix(&self.prefix)
            .and_then(|rest| rest.rsplit('/').next())
            .filter(|leaf| !leaf.is_empty())
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))
    }
}

/// Durable datastore backed by sled
pub struct SledDatastore {
    db: Db,
}

impl SledDatastore {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }
}

impl Datastore for SledDatastore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.db.remove(key)?;
        Ok(())
    }

    fn has(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.db.contains_key(key)?)
    }

    fn query(&self, prefix: &str) -> QueryIter<'_> {
        Box::new(self.db.scan_prefix(prefix).map(|entry| {
            let (key, value) = entry?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| StorageError::InvalidKey(e.to_string()))?;
            Ok((key, value.to_vec()))
        }))
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Ephemeral datastore
#[derive(Default)]
pub struct MemoryDatastore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Datastore for MemoryDatastore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn query(&self, prefix: &str) -> QueryIter<'_> {
        let matched: Vec<_> = self
            .entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| Ok((k.clone(), v.clone())))
            .collect();
        Box::new(matched.into_iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exercise(store: &dyn Datastore) {
        let keys = KeySpace::new("feed", "news");
        let a = keys.key(&["header", "aa"]);
        let b = keys.key(&["header", "bb"]);
        let other = keys.key(&["payload", "aa"]);

        assert_eq!(store.get(&a).unwrap(), None);
        store.put(&a, b"one").unwrap();
        store.put(&b, b"two").unwrap();
        store.put(&other, b"three").unwrap();
        assert!(store.has(&a).unwrap());

        let listed: Vec<_> = store
            .query(&keys.prefix(&["header"]))
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].1, b"one".to_vec());
        assert_eq!(keys.leaf(&listed[1].0).unwrap(), "bb");

        let many = store.get_many(&[a.clone(), "missing".into()]).unwrap();
        assert_eq!(many, vec![Some(b"one".to_vec()), None]);

        store.delete(&a).unwrap();
        assert!(!store.has(&a).unwrap());
    }

    #[test]
    fn test_memory_datastore() {
        exercise(&MemoryDatastore::new());
    }

    #[test]
    fn test_sled_datastore() {
        let dir = tempdir().unwrap();
        exercise(&SledDatastore::open(dir.path()).unwrap());
    }

    #[test]
    fn test_typed_values_and_key_layout() {
        let store = MemoryDatastore::new();
        let keys = KeySpace::new("messageid", "news");
        let key = keys.key(&["POST", "0", "17"]);
        assert!(key.starts_with("/lambdadelta/messageid/"));
        assert!(key.ends_with("/POST/0/17"));

        store.put_value(&key, &41u32).unwrap();
        assert_eq!(store.get_value::<u32>(&key).unwrap(), Some(41));
    }

    #[test]
    fn test_topics_do_not_share_keys() {
        let a = KeySpace::new("feed", "a");
        let b = KeySpace::new("feed", "b");
        assert_ne!(a.key(&["x"]), b.key(&["x"]));
        assert!(a.leaf(&b.key(&["x"])).is_err());
    }
}
