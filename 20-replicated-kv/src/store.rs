//! In-memory key-value state for one replica.
//!
//! Writes arrive from three places: local eventual writes, gossip, and
//! committed two-phase transactions. All of them go through [`KvStore::apply`],
//! which keeps the newest version per key so replicas converge no matter in
//! which order writes arrive.

use std::collections::BTreeMap;

use crate::message::{Version, Versioned, WriteOp};

/// Versioned key-value map. Deleted keys keep a tombstone so that an older
/// put arriving late cannot resurrect them.
///
/// BTreeMap keeps `keys()` and `snapshot()` deterministic, which keeps the
/// STATUS output and the tests stable.
#[derive(Debug, Default)]
pub struct KvStore {
    data: BTreeMap<String, Versioned>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a write if it is newer than what the key currently holds.
    ///
    /// Returns whether the store changed. Re-applying the same write is a no-op.
    pub fn apply(&mut self, write: &WriteOp) -> bool {
        if let Some(current) = self.data.get(&write.key) {
            if current.version >= write.version {
                return false;
            }
        }
        self.data.insert(
            write.key.clone(),
            Versioned {
                value: write.value.clone(),
                version: write.version,
            },
        );
        true
    }

    /// Current value, or `None` if absent or deleted.
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).and_then(|entry| entry.value.clone())
    }

    /// Raw entry including tombstones, as served to strong reads.
    pub fn entry(&self, key: &str) -> Option<&Versioned> {
        self.data.get(key)
    }

    /// Live keys in order.
    pub fn keys(&self) -> Vec<String> {
        self.data
            .iter()
            .filter(|(_, entry)| entry.value.is_some())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Live key-value pairs, cloned so callers hold no borrow on the store.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data
            .iter()
            .filter_map(|(key, entry)| entry.value.clone().map(|value| (key.clone(), value)))
            .collect()
    }

    /// Highest version held for any key.
    pub fn max_version(&self) -> Option<Version> {
        self.data.values().map(|entry| entry.version).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(key: &str, value: Option<&str>, timestamp: u64, origin: u64) -> WriteOp {
        WriteOp {
            key: key.to_string(),
            value: value.map(str::to_string),
            version: Version { timestamp, origin },
        }
    }

    #[test]
    fn newer_write_wins_regardless_of_arrival_order() {
        let mut a = KvStore::new();
        let mut b = KvStore::new();
        let first = write("k", Some("one"), 10, 1);
        let second = write("k", Some("two"), 20, 2);

        assert!(a.apply(&first));
        assert!(a.apply(&second));
        assert!(b.apply(&second));
        assert!(!b.apply(&first));

        assert_eq!(a.get("k").as_deref(), Some("two"));
        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn duplicate_write_is_idempotent() {
        let mut store = KvStore::new();
        let op = write("k", Some("v"), 5, 1);
        assert!(store.apply(&op));
        assert!(!store.apply(&op));
        assert_eq!(store.keys(), vec!["k".to_string()]);
    }

    #[test]
    fn tombstone_hides_key_and_blocks_older_put() {
        let mut store = KvStore::new();
        store.apply(&write("k", Some("v"), 5, 1));
        store.apply(&write("k", None, 7, 2));
        assert_eq!(store.get("k"), None);
        assert!(store.keys().is_empty());
        assert!(store.entry("k").is_some());

        assert!(!store.apply(&write("k", Some("stale"), 6, 3)));
        assert_eq!(store.get("k"), None);

        assert!(store.apply(&write("k", Some("back"), 8, 1)));
        assert_eq!(store.get("k").as_deref(), Some("back"));
        assert_eq!(
            store.max_version(),
            Some(Version {
                timestamp: 8,
                origin: 1
            })
        );
    }
}
