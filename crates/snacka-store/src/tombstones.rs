//! Short-lived deletion markers.
//!
//! A tombstone stops a stale push event from resurrecting an entity that was
//! deleted locally. Markers expire after a TTL; expired markers are purged
//! lazily on insert.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Tombstone {
    expires: Instant,
    /// Event time of the deletion, when known. Only events at or before it
    /// are blocked.
    deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Tombstones<K> {
    ttl: Duration,
    entries: HashMap<K, Tombstone>,
}

impl<K: Hash + Eq> Tombstones<K> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Block every event for `key` until the marker expires.
    pub fn insert(&mut self, key: K) {
        self.put(key, None);
    }

    /// Block events for `key` that are not newer than `deleted_at`.
    pub fn insert_at(&mut self, key: K, deleted_at: DateTime<Utc>) {
        self.put(key, Some(deleted_at));
    }

    fn put(&mut self, key: K, deleted_at: Option<DateTime<Utc>>) {
        self.purge_expired();
        self.entries.insert(
            key,
            Tombstone {
                expires: Instant::now() + self.ttl,
                deleted_at,
            },
        );
    }

    fn live(&self, key: &K) -> Option<&Tombstone> {
        self.entries
            .get(key)
            .filter(|t| t.expires > Instant::now())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.live(key).is_some()
    }

    /// Whether an event for `key` stamped `event_at` must be dropped.
    pub fn blocks(&self, key: &K, event_at: DateTime<Utc>) -> bool {
        match self.live(key) {
            Some(t) => t.deleted_at.map_or(true, |deleted| event_at <= deleted),
            None => false,
        }
    }

    /// Remove a marker early (rollback of a local delete).
    pub fn lift(&mut self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn purge_expired(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, t| t.expires > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_tombstone_expires() {
        let mut tombstones = Tombstones::new(Duration::from_secs(300));
        tombstones.insert(7u32);
        assert!(tombstones.contains(&7));

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(tombstones.contains(&7));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!tombstones.contains(&7));

        tombstones.insert(8);
        assert_eq!(tombstones.len(), 1);
    }

    #[test]
    fn test_timed_tombstone_blocks_only_older_events() {
        let mut tombstones = Tombstones::new(Duration::from_secs(60));
        let deleted_at = Utc::now();
        tombstones.insert_at("alice", deleted_at);

        assert!(tombstones.blocks(&"alice", deleted_at - chrono::Duration::seconds(5)));
        assert!(tombstones.blocks(&"alice", deleted_at));
        assert!(!tombstones.blocks(&"alice", deleted_at + chrono::Duration::seconds(5)));
        assert!(!tombstones.blocks(&"bob", deleted_at));
    }

    #[test]
    fn test_lift() {
        let mut tombstones = Tombstones::new(Duration::from_secs(60));
        tombstones.insert(1u8);
        assert!(tombstones.lift(&1));
        assert!(!tombstones.contains(&1));
        assert!(!tombstones.lift(&1));
    }
}
