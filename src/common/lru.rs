use hashlink::LinkedHashMap;
use std::hash::Hash;
use std::sync::Mutex;

use crate::memory::{CleanupReport, MemoryTarget, Pressure};

/// A fixed-capacity LRU cache backed by `hashlink::LinkedHashMap`.
///
/// One key may be pinned; pinned entries survive capacity eviction and
/// [`LruCache::retain_recent`].
pub struct LruCache<K, V> {
    map: LinkedHashMap<K, V>,
    capacity: usize,
    pinned: Option<K>,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    /// Create a new cache limited to `capacity` entries (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            map: LinkedHashMap::new(),
            capacity: capacity.max(1),
            pinned: None,
        }
    }

    /// Retrieve a value from the cache, updating its recency.
    pub fn get(&mut self, key: &K) -> Option<V> {
        self.map.to_back(key).map(|value| value.clone())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Insert a value, evicting the least recently used unpinned entry when
    /// the cache is full. Returns the number of evicted entries.
    pub fn put(&mut self, key: K, value: V) -> usize {
        self.map.insert(key, value);
        let mut evicted = 0;
        while self.map.len() > self.capacity {
            if !self.evict_oldest() {
                break;
            }
            evicted += 1;
        }
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        if self.pinned.as_ref() == Some(key) {
            self.pinned = None;
        }
        self.map.remove(key)
    }

    /// Evict oldest entries until at most `keep` remain. The pinned entry is
    /// never evicted and does not count towards `keep`.
    pub fn retain_recent(&mut self, keep: usize) -> usize {
        let pinned_present = self
            .pinned
            .as_ref()
            .is_some_and(|key| self.map.contains_key(key));
        let limit = keep + usize::from(pinned_present);
        let mut evicted = 0;
        while self.map.len() > limit {
            if !self.evict_oldest() {
                break;
            }
            evicted += 1;
        }
        evicted
    }

    pub fn pin(&mut self, key: K) {
        self.pinned = Some(key);
    }

    pub fn unpin(&mut self) {
        self.pinned = None;
    }

    pub fn pinned(&self) -> Option<&K> {
        self.pinned.as_ref()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Clear all cached entries. The pin is kept so the next render of the
    /// current view is protected again.
    pub fn clear(&mut self) {
        self.map.clear();
    }

    fn evict_oldest(&mut self) -> bool {
        let victim = self
            .map
            .keys()
            .find(|key| self.pinned.as_ref() != Some(*key))
            .cloned();
        match victim {
            Some(key) => self.map.remove(&key).is_some(),
            None => false,
        }
    }
}

impl<K, V> MemoryTarget for Mutex<LruCache<K, V>>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn target_name(&self) -> &'static str {
        "artifact cache"
    }

    /// Keep the most recently used half plus the pinned entry.
    fn compact(&self, pressure: Pressure) -> CleanupReport {
        match self.lock() {
            Ok(mut cache) => {
                let keep = cache.len() / 2;
                let evicted = cache.retain_recent(keep);
                tracing::debug!(?pressure, evicted, remaining = cache.len(), "artifact cache compacted");
                CleanupReport {
                    evicted_entries: evicted,
                    ..CleanupReport::default()
                }
            }
            Err(err) => {
                tracing::error!(?err, "failed to lock artifact cache");
                CleanupReport::default()
            }
        }
    }
}
