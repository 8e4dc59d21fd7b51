use std::num::NonZeroUsize;

use lru::LruCache;

use super::CacheEntry;

#[derive(Debug)]
pub(super) struct CacheIndex {
    lru: LruCache<String, CacheEntry>,
}

impl CacheIndex {
    pub(super) fn new(capacity: NonZeroUsize) -> Self {
        Self {
            lru: LruCache::new(capacity),
        }
    }

    pub(super) fn clear(&mut self) {
        self.lru.clear();
    }

    /// Promotes the key to most recently used.
    pub(super) fn get(&mut self, key: &str) -> Option<CacheEntry> {
        self.lru.get(key).cloned()
    }

    pub(super) fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        self.lru.pop(key)
    }

    /// Inserts or replaces. Returns the entry pushed out by the capacity bound;
    /// a same-key replacement is not an eviction.
    pub(super) fn insert(&mut self, key: String, entry: CacheEntry) -> Option<(String, CacheEntry)> {
        if let Some(slot) = self.lru.get_mut(&key) {
            *slot = entry;
            return None;
        }
        self.lru.push(key, entry)
    }

    pub(super) fn len(&self) -> usize {
        self.lru.len()
    }

    pub(super) fn capacity(&self) -> usize {
        self.lru.cap().get()
    }
}
