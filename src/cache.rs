//! Subscribable key/value cache
//!
//! Each key owns a slot holding the latest value. Writes go through
//! [`CacheStore::update`], which computes the next value from the current one
//! while holding the slot's lock, so two writers to the same key never
//! interleave and no reader sees half of one write and half of another.
//!
//! ```text
//! update(key, f) ──► Slot { current: watch, changes: broadcast }
//!                          │                  │
//!                          ▼                  ▼
//!                   watch(key) (latest)   subscribe(key) (every write, in order)
//! ```

use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::trace;

/// Default capacity of a slot's change channel
pub const DEFAULT_CHANGE_CAPACITY: usize = 256;

/// Key of a cache slot
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key of the progress record for an operation kind
    pub fn progress(kind: &str) -> Self {
        Self(format!("progress:{}", kind))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct Slot<V> {
    current: watch::Sender<V>,
    changes: broadcast::Sender<V>,
}

impl<V: Clone> Slot<V> {
    fn new(initial: V, capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity);
        Self {
            current: watch::Sender::new(initial),
            changes,
        }
    }
}

/// Subscribable key/value store
pub struct CacheStore<V> {
    slots: DashMap<CacheKey, Arc<Slot<V>>>,
    capacity: usize,
}

impl<V> CacheStore<V>
where
    V: Clone + PartialEq + Default + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANGE_CAPACITY)
    }

    /// Create a store whose change channels buffer `capacity` writes per key
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn slot(&self, key: &CacheKey, initial: impl FnOnce() -> V) -> Arc<Slot<V>> {
        // Clone the Arc out so the shard lock is not held while the caller runs
        if let Some(slot) = self.slots.get(key) {
            return Arc::clone(slot.value());
        }
        let entry = self
            .slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Slot::new(initial(), self.capacity)));
        Arc::clone(entry.value())
    }

    /// Read the value, establishing `initial` if the key has never been written
    pub fn get_or_init(&self, key: &CacheKey, initial: V) -> V {
        self.slot(key, || initial).current.borrow().clone()
    }

    pub fn get(&self, key: &CacheKey) -> Option<V> {
        self.slots.get(key).map(|slot| slot.current.borrow().clone())
    }

    /// Atomically replace the value with `updater(current)`.
    ///
    /// A missing key starts from `V::default()`. Every write is published to
    /// `subscribe` receivers exactly once; `watch` receivers are only woken
    /// when the value changed. Returns `true` if the value changed.
    pub fn update<F>(&self, key: &CacheKey, updater: F) -> bool
    where
        F: FnOnce(&V) -> V,
    {
        let slot = self.slot(key, V::default);
        let changes = &slot.changes;

        let changed = slot.current.send_if_modified(|current| {
            let next = updater(current);
            // Published under the slot lock, so subscribers see writes in order
            let _ = changes.send(next.clone());
            if next == *current {
                return false;
            }
            *current = next;
            true
        });

        trace!(key = %key, changed = changed, "Cache update");
        changed
    }

    /// Overwrite the value
    pub fn set(&self, key: &CacheKey, value: V) -> bool {
        self.update(key, |_| value)
    }

    /// Receive every write to `key`, in write order
    pub fn subscribe(&self, key: &CacheKey) -> broadcast::Receiver<V> {
        self.slot(key, V::default).changes.subscribe()
    }

    /// Observe the latest value of `key`
    pub fn watch(&self, key: &CacheKey) -> watch::Receiver<V> {
        self.slot(key, V::default).current.subscribe()
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<_> = self.slots.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<V> Default for CacheStore<V>
where
    V: Clone + PartialEq + Default + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn test_get_or_init_establishes_first_value() {
        let store: CacheStore<u32> = CacheStore::new();
        let key = CacheKey::new("a");

        assert_eq!(store.get(&key), None);
        assert_eq!(store.get_or_init(&key, 7), 7);
        // Second initial value is ignored
        assert_eq!(store.get_or_init(&key, 9), 7);
        assert_eq!(store.get(&key), Some(7));
    }

    #[test]
    fn test_update_missing_key_starts_from_default() {
        let store: CacheStore<u32> = CacheStore::new();
        let key = CacheKey::new("counter");

        assert!(store.update(&key, |v| v + 1));
        assert_eq!(store.get(&key), Some(1));
    }

    #[test]
    fn test_writes_published_once_in_order() {
        let store: CacheStore<u32> = CacheStore::new();
        let key = CacheKey::new("a");
        let mut rx = store.subscribe(&key);

        store.set(&key, 1);
        store.set(&key, 2);
        store.update(&key, |v| v * 10);

        assert_eq!(rx.try_recv().unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap(), 2);
        assert_eq!(rx.try_recv().unwrap(), 20);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_unchanged_write_still_published() {
        let store: CacheStore<u32> = CacheStore::new();
        let key = CacheKey::new("a");
        store.set(&key, 5);
        let mut rx = store.subscribe(&key);
        let mut latest = store.watch(&key);

        assert!(!store.set(&key, 5));

        assert_eq!(rx.try_recv().unwrap(), 5);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert!(!latest.has_changed().unwrap());
    }

    #[test]
    fn test_unrelated_keys_do_not_notify() {
        let store: CacheStore<u32> = CacheStore::new();
        let a = CacheKey::new("a");
        let b = CacheKey::new("b");
        let mut rx_a = store.subscribe(&a);

        store.set(&b, 3);

        assert!(matches!(rx_a.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(store.keys(), vec![a, b]);
    }

    #[tokio::test]
    async fn test_watch_sees_latest() {
        let store: CacheStore<u32> = CacheStore::new();
        let key = CacheKey::new("a");
        let mut rx = store.watch(&key);

        store.set(&key, 1);
        store.set(&key, 2);

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_do_not_lose_writes() {
        let store: Arc<CacheStore<u64>> = Arc::new(CacheStore::new());
        let key = CacheKey::new("counter");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..250 {
                    store.update(&key, |v| v + 1);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.get(&key), Some(2000));
    }

    #[test]
    fn test_progress_keys_are_distinct() {
        assert_eq!(CacheKey::progress("backup").as_str(), "progress:backup");
        assert_ne!(CacheKey::progress("backup"), CacheKey::progress("restore"));
    }
}
