//! Generic keyed, ordered container with change notifications.
//!
//! [`EntityStore`] is the leaf every domain store is built on. Entries live in
//! an [`IndexMap`] so iteration order is stable: insertion order by default,
//! or an explicit comparator applied after every batch. Each logical operation
//! (a [`EntityStore::batch`] call, or a single upsert/remove) produces at most
//! one [`ChangeSet`] notification, and a no-op produces none.
//!
//! Listeners get a read-only view of the entries. A listener that wants to
//! mutate the store queues the mutation on the [`Notification`]; queued
//! mutations are applied as a follow-up batch once the current dispatch has
//! finished.

use std::cmp::Ordering;
use std::hash::Hash;

use indexmap::IndexMap;
use tracing::warn;

/// Follow-up batches allowed per logical operation before deferred
/// mutations are dropped.
const MAX_FLUSH_ROUNDS: usize = 8;

/// Handle returned by [`EntityStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Keys touched by one logical operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet<K> {
    /// Inserted or modified keys, in the order they were touched.
    pub upserted: Vec<K>,
    /// Removed keys, including entries evicted by the capacity limit.
    pub removed: Vec<K>,
}

impl<K: PartialEq> ChangeSet<K> {
    fn new() -> Self {
        Self {
            upserted: Vec::new(),
            removed: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.upserted.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.upserted.len() + self.removed.len()
    }

    fn record_upsert(&mut self, key: K) {
        self.removed.retain(|k| k != &key);
        if !self.upserted.contains(&key) {
            self.upserted.push(key);
        }
    }

    fn record_remove(&mut self, key: K) {
        self.upserted.retain(|k| k != &key);
        if !self.removed.contains(&key) {
            self.removed.push(key);
        }
    }
}

enum Deferred<K, V> {
    Upsert(K, V),
    Remove(K),
}

/// What a listener sees during dispatch.
pub struct Notification<'a, K, V> {
    changes: &'a ChangeSet<K>,
    entries: &'a IndexMap<K, V>,
    deferred: &'a mut Vec<Deferred<K, V>>,
}

impl<'a, K: Hash + Eq, V> Notification<'a, K, V> {
    pub fn changes(&self) -> &ChangeSet<K> {
        self.changes
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> + '_ {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue an upsert to run after the current dispatch completes.
    pub fn defer_upsert(&mut self, key: K, value: V) {
        self.deferred.push(Deferred::Upsert(key, value));
    }

    /// Queue a removal to run after the current dispatch completes.
    pub fn defer_remove(&mut self, key: K) {
        self.deferred.push(Deferred::Remove(key));
    }
}

pub type Listener<K, V> = Box<dyn FnMut(&mut Notification<'_, K, V>) + Send>;

type Comparator<V> = Box<dyn Fn(&V, &V) -> Ordering + Send>;

/// Mutable access to the entries for the duration of one logical operation.
pub struct Batch<'a, K, V> {
    entries: &'a mut IndexMap<K, V>,
    changes: &'a mut ChangeSet<K>,
}

impl<'a, K, V> Batch<'a, K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
{
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or replace. Replacing keeps the entry's slot. Returns `false`
    /// when the stored value is already equal.
    pub fn upsert(&mut self, key: K, value: V) -> bool {
        if self.entries.get(&key) == Some(&value) {
            return false;
        }
        self.entries.insert(key.clone(), value);
        self.changes.record_upsert(key);
        true
    }

    /// Modify an entry in place. Returns `true` if the value changed.
    pub fn update<F: FnOnce(&mut V)>(&mut self, key: &K, f: F) -> bool {
        let Some(current) = self.entries.get_mut(key) else {
            return false;
        };
        let before = current.clone();
        f(current);
        if *current == before {
            return false;
        }
        self.changes.record_upsert(key.clone());
        true
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let removed = self.entries.shift_remove(key);
        if removed.is_some() {
            self.changes.record_remove(key.clone());
        }
        removed
    }

    /// Replace the entry at `old` with `value` under `new`, in the same slot.
    /// Falls back to a plain upsert when `old` is absent.
    ///
    /// A stray entry already stored under `new` is replaced. Its key stays
    /// present, so the change set reports it as upserted and only `old` as
    /// removed.
    pub fn rekey(&mut self, old: &K, new: K, value: V) -> bool {
        if old == &new || !self.entries.contains_key(old) {
            return self.upsert(new, value);
        }
        if self.entries.shift_remove(&new).is_some() {
            self.changes.record_remove(new.clone());
        }

        let Some(index) = self.entries.get_index_of(old) else {
            return self.upsert(new, value);
        };

        self.entries.shift_remove_index(index);
        self.entries.shift_insert(index, new.clone(), value);
        self.changes.record_remove(old.clone());
        self.changes.record_upsert(new);
        true
    }
}

/// Keyed, ordered entity container. See the module docs.
pub struct EntityStore<K, V> {
    entries: IndexMap<K, V>,
    order: Option<Comparator<V>>,
    capacity: Option<usize>,
    listeners: Vec<(SubscriptionId, Listener<K, V>)>,
    next_subscription: u64,
}

impl<K, V> EntityStore<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
{
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
            order: None,
            capacity: None,
            listeners: Vec::new(),
            next_subscription: 0,
        }
    }

    /// Keep entries sorted by `cmp` (stable) after every batch.
    pub fn with_order(mut self, cmp: impl Fn(&V, &V) -> Ordering + Send + 'static) -> Self {
        self.order = Some(Box::new(cmp));
        self
    }

    /// Bound the number of entries; overflow is evicted from the tail.
    pub fn with_capacity_limit(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn capacity_limit(&self) -> Option<usize> {
        self.capacity
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn position(&self, key: &K) -> Option<usize> {
        self.entries.get_index_of(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.entries.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> + '_ {
        self.entries.values()
    }

    /// Ordered snapshot of every entity.
    pub fn get_all(&self) -> Vec<V> {
        self.entries.values().cloned().collect()
    }

    pub fn upsert(&mut self, key: K, value: V) -> bool {
        self.batch(|b| b.upsert(key, value))
    }

    pub fn update<F: FnOnce(&mut V)>(&mut self, key: &K, f: F) -> bool {
        self.batch(|b| b.update(key, f))
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.batch(|b| b.remove(key))
    }

    pub fn rekey(&mut self, old: &K, new: K, value: V) -> bool {
        self.batch(|b| b.rekey(old, new, value))
    }

    /// Run several mutations as one logical operation with one notification.
    pub fn batch<R>(&mut self, f: impl FnOnce(&mut Batch<'_, K, V>) -> R) -> R {
        let mut changes = ChangeSet::new();
        let result = {
            let mut batch = Batch {
                entries: &mut self.entries,
                changes: &mut changes,
            };
            f(&mut batch)
        };
        self.finish(changes);
        result
    }

    /// Drop every entry, notifying once.
    pub fn clear(&mut self) {
        let changes = ChangeSet {
            upserted: Vec::new(),
            removed: self.entries.keys().cloned().collect(),
        };
        self.entries.clear();
        self.finish(changes);
    }

    pub fn subscribe(
        &mut self,
        listener: impl FnMut(&mut Notification<'_, K, V>) + Send + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(sid, _)| *sid != id);
        self.listeners.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }

    /// Apply ordering and the capacity limit after a batch.
    fn settle(&mut self, changes: &mut ChangeSet<K>) {
        if changes.is_empty() {
            return;
        }
        if let Some(order) = &self.order {
            self.entries.sort_by(|_, a, _, b| order(a, b));
        }
        if let Some(capacity) = self.capacity {
            while self.entries.len() > capacity {
                match self.entries.pop() {
                    Some((key, _)) => changes.record_remove(key),
                    None => break,
                }
            }
        }
    }

    fn finish(&mut self, mut changes: ChangeSet<K>) {
        let mut rounds = 0;
        loop {
            self.settle(&mut changes);
            if changes.is_empty() {
                return;
            }

            let mut deferred = Vec::new();
            for (_, listener) in self.listeners.iter_mut() {
                let mut notification = Notification {
                    changes: &changes,
                    entries: &self.entries,
                    deferred: &mut deferred,
                };
                listener(&mut notification);
            }

            if deferred.is_empty() {
                return;
            }
            rounds += 1;
            if rounds >= MAX_FLUSH_ROUNDS {
                warn!(
                    rounds,
                    dropped = deferred.len(),
                    "Dropping deferred store mutations after repeated flush rounds"
                );
                return;
            }

            changes = ChangeSet::new();
            let mut batch = Batch {
                entries: &mut self.entries,
                changes: &mut changes,
            };
            for op in deferred {
                match op {
                    Deferred::Upsert(key, value) => {
                        batch.upsert(key, value);
                    }
                    Deferred::Remove(key) => {
                        batch.remove(&key);
                    }
                }
            }
        }
    }
}

impl<K, V> Default for EntityStore<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<ChangeSet<u32>>>>;

    fn recorder(store: &mut EntityStore<u32, String>) -> Log {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        store.subscribe(move |n| sink.lock().unwrap().push(n.changes().clone()));
        log
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let mut store = EntityStore::new();
        let log = recorder(&mut store);

        assert!(store.upsert(1, "a".to_string()));
        assert!(!store.upsert(1, "a".to_string()));

        assert_eq!(store.len(), 1);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_batch_notifies_once() {
        let mut store = EntityStore::new();
        store.upsert(9, "gone".to_string());
        let log = recorder(&mut store);

        store.batch(|b| {
            b.upsert(1, "a".to_string());
            b.upsert(2, "b".to_string());
            b.remove(&9);
        });

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].upserted, vec![1, 2]);
        assert_eq!(log[0].removed, vec![9]);
    }

    #[test]
    fn test_update_keeps_slot() {
        let mut store = EntityStore::new();
        store.upsert(1, "a".to_string());
        store.upsert(2, "b".to_string());
        store.upsert(3, "c".to_string());

        assert!(store.update(&2, |v| v.push('!')));
        assert!(!store.update(&2, |_| {}));
        assert_eq!(store.get_all(), vec!["a", "b!", "c"]);
    }

    #[test]
    fn test_explicit_order() {
        let mut store: EntityStore<u32, String> =
            EntityStore::new().with_order(|a: &String, b: &String| a.cmp(b));
        store.upsert(1, "charlie".to_string());
        store.upsert(2, "alpha".to_string());
        store.upsert(3, "bravo".to_string());

        assert_eq!(store.get_all(), vec!["alpha", "bravo", "charlie"]);
    }

    #[test]
    fn test_capacity_evicts_from_tail() {
        let mut store: EntityStore<u32, u32> = EntityStore::new()
            .with_order(|a: &u32, b: &u32| b.cmp(a))
            .with_capacity_limit(3);

        for i in 0..5 {
            store.upsert(i, i);
        }

        assert_eq!(store.get_all(), vec![4, 3, 2]);
        assert!(!store.contains(&0));
    }

    #[test]
    fn test_eviction_reported_in_same_change_set() {
        let mut store: EntityStore<u32, String> = EntityStore::new().with_capacity_limit(1);
        store.upsert(1, "old".to_string());
        let log = recorder(&mut store);

        // Insertion order: the new entry lands last and is the one evicted.
        store.upsert(2, "new".to_string());

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].upserted.is_empty());
        assert_eq!(log[0].removed, vec![2]);
    }

    #[test]
    fn test_rekey_keeps_slot_and_notifies_once() {
        let mut store = EntityStore::new();
        store.upsert(1, "a".to_string());
        store.upsert(2, "pending".to_string());
        store.upsert(3, "c".to_string());
        let log = recorder(&mut store);

        assert!(store.rekey(&2, 20, "confirmed".to_string()));

        assert_eq!(store.position(&20), Some(1));
        assert!(!store.contains(&2));
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].removed, vec![2]);
        assert_eq!(log[0].upserted, vec![20]);
    }

    #[test]
    fn test_rekey_onto_existing_key_replaces_it() {
        let mut store = EntityStore::new();
        store.upsert(20, "echo".to_string());
        store.upsert(1, "a".to_string());
        store.upsert(2, "pending".to_string());
        let log = recorder(&mut store);

        assert!(store.rekey(&2, 20, "confirmed".to_string()));

        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&20).map(String::as_str), Some("confirmed"));
        assert_eq!(store.position(&20), Some(1));
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].removed, vec![2]);
        assert_eq!(log[0].upserted, vec![20]);
    }

    #[test]
    fn test_rekey_without_old_entry_keeps_existing_slot() {
        let mut store = EntityStore::new();
        store.upsert(20, "echo".to_string());
        store.upsert(1, "a".to_string());
        let log = recorder(&mut store);

        assert!(!store.rekey(&2, 20, "echo".to_string()));
        assert!(store.rekey(&2, 20, "edited".to_string()));

        assert_eq!(store.position(&20), Some(0));
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].removed.is_empty());
        assert_eq!(log[0].upserted, vec![20]);
    }

    #[test]
    fn test_listener_mutations_are_deferred() {
        let mut store: EntityStore<u32, String> = EntityStore::new();
        let log = recorder(&mut store);

        // Mirror every new key k < 100 under k + 100.
        store.subscribe(|n| {
            let mirrors: Vec<(u32, String)> = n
                .changes()
                .upserted
                .iter()
                .filter(|k| **k < 100)
                .filter_map(|k| n.get(k).map(|v| (k + 100, v.clone())))
                .collect();
            for (k, v) in mirrors {
                n.defer_upsert(k, v);
            }
        });

        store.upsert(1, "a".to_string());

        assert_eq!(store.get(&101).map(String::as_str), Some("a"));
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].upserted, vec![101]);
    }

    #[test]
    fn test_runaway_deferral_is_bounded() {
        let mut store: EntityStore<u32, u32> = EntityStore::new();
        store.subscribe(|n| {
            let next = n.changes().upserted.iter().max().copied().unwrap_or(0) + 1;
            n.defer_upsert(next, next);
        });

        store.upsert(0, 0);

        assert_eq!(store.len(), MAX_FLUSH_ROUNDS);
    }

    #[test]
    fn test_unsubscribe() {
        let mut store = EntityStore::new();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let id = store.subscribe(move |n| sink.lock().unwrap().push(n.changes().clone()));

        store.upsert(1, "a".to_string());
        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));
        store.upsert(2, "b".to_string());

        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[test]
    fn test_clear_notifies_once() {
        let mut store = EntityStore::new();
        store.upsert(1, "a".to_string());
        store.upsert(2, "b".to_string());
        let log = recorder(&mut store);

        store.clear();
        store.clear();

        assert!(store.is_empty());
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].removed, vec![1, 2]);
    }
}
