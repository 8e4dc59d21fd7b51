use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

mod entry;
mod index;
mod key;
mod remote;
mod stats;

pub use entry::{CacheEntry, DENIED_HEADERS, EntryStatus, MAX_TTL, strip_denied_headers};
pub use key::{
    AcceptedEncodings, NO_ENCODING, VariantResolver, encoding_tag, split_variant_key, variant_key,
};
pub use remote::{MemoryRemote, RemoteBackend, RemoteConnector};
pub use stats::{Counter, EngineStats, StatsSnapshot};

use index::CacheIndex;

use crate::metrics;
use crate::refresh::RefreshQueue;

/// Two-tier key/entry store: a bounded LRU in process, optionally mirrored to
/// a remote backend. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CacheStore {
    state: Arc<StoreState>,
}

struct StoreState {
    index: Mutex<CacheIndex>,
    remote: Option<Arc<dyn RemoteBackend>>,
    refresh: Option<RefreshTrigger>,
    stats: Arc<EngineStats>,
}

struct RefreshTrigger {
    queue: RefreshQueue,
    low_water: Duration,
}

enum LocalLookup {
    Found(CacheEntry),
    Expired,
    Absent,
}

pub struct CacheStoreBuilder {
    capacity: usize,
    remote: Option<Arc<dyn RemoteBackend>>,
    refresh: Option<RefreshTrigger>,
    stats: Arc<EngineStats>,
}

impl CacheStoreBuilder {
    pub fn remote(mut self, remote: Arc<dyn RemoteBackend>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Lookups of 200 entries with at most `low_water` left signal `queue`.
    pub fn refresh(mut self, queue: RefreshQueue, low_water: Duration) -> Self {
        self.refresh = Some(RefreshTrigger { queue, low_water });
        self
    }

    pub fn build(self) -> Result<CacheStore> {
        let capacity = NonZeroUsize::new(self.capacity)
            .ok_or_else(|| anyhow!("cache capacity must be greater than zero"))?;
        Ok(CacheStore {
            state: Arc::new(StoreState {
                index: Mutex::new(CacheIndex::new(capacity)),
                remote: self.remote,
                refresh: self.refresh,
                stats: self.stats,
            }),
        })
    }
}

impl CacheStore {
    pub fn builder(capacity: usize, stats: Arc<EngineStats>) -> CacheStoreBuilder {
        CacheStoreBuilder {
            capacity,
            remote: None,
            refresh: None,
            stats,
        }
    }

    pub fn len(&self) -> usize {
        self.state.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.state.index.lock().capacity()
    }

    pub fn has_remote(&self) -> bool {
        self.state.remote.is_some()
    }

    /// Looks up `key`. An expired entry is removed and reported absent. A
    /// local miss falls through to the remote tier, promoting what it finds.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = SystemTime::now();
        let local = {
            let mut index = self.state.index.lock();
            match index.get(key) {
                Some(entry) if entry.is_expired_at(now) => {
                    index.remove(key);
                    LocalLookup::Expired
                }
                Some(entry) => LocalLookup::Found(entry),
                None => LocalLookup::Absent,
            }
        };

        let entry = match local {
            LocalLookup::Found(entry) => entry,
            LocalLookup::Expired => {
                self.state.stats.expired.incr();
                metrics::record_cache_lookup("expired");
                metrics::set_cache_entries(self.len());
                trace!(key, "cache entry expired on read");
                return None;
            }
            LocalLookup::Absent => self.get_remote(key, now).await?,
        };

        self.maybe_signal_refresh(key, &entry, now);
        Some(entry)
    }

    async fn get_remote(&self, key: &str, now: SystemTime) -> Option<CacheEntry> {
        let remote = self.state.remote.as_ref()?;
        let bytes = match remote.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                self.record_remote_error("get", key, &err);
                return None;
            }
        };
        let entry = match CacheEntry::decode(&bytes) {
            Ok(entry) => entry,
            Err(err) => {
                self.record_remote_error("get", key, &err);
                return None;
            }
        };
        if entry.is_expired_at(now) {
            return None;
        }
        trace!(key, "promoting remote cache entry");
        self.insert_local(key.to_string(), entry.clone());
        Some(entry)
    }

    fn maybe_signal_refresh(&self, key: &str, entry: &CacheEntry, now: SystemTime) {
        let Some(trigger) = &self.state.refresh else {
            return;
        };
        if entry.status() == EntryStatus::Fresh200
            && entry.remaining_ttl(now) <= trigger.low_water
            && trigger.queue.enqueue(key)
        {
            debug!(key, "entry near expiry; background refresh queued");
        }
    }

    /// Inserts or replaces `key`; last writer wins. The entry expires `ttl`
    /// after its creation. Mirroring to the remote tier never fails the call.
    pub async fn put(&self, key: String, mut entry: CacheEntry, ttl: Duration) {
        entry.stamp_expiry(ttl);
        let mirror = match &self.state.remote {
            Some(remote) => match entry.encode() {
                Ok(bytes) => Some((remote.clone(), bytes)),
                Err(err) => {
                    self.record_remote_error("set", &key, &err);
                    None
                }
            },
            None => None,
        };

        self.insert_local(key.clone(), entry);

        if let Some((remote, bytes)) = mirror
            && let Err(err) = remote.set(&key, bytes, ttl).await
        {
            self.record_remote_error("set", &key, &err);
        }
    }

    fn insert_local(&self, key: String, entry: CacheEntry) {
        let (evicted, len) = {
            let mut index = self.state.index.lock();
            let evicted = index.insert(key, entry);
            (evicted, index.len())
        };
        metrics::set_cache_entries(len);
        if let Some((evicted_key, _)) = evicted {
            self.state.stats.evictions.incr();
            metrics::record_cache_eviction();
            debug!(key = %evicted_key, "evicted least recently used cache entry");
        }
    }

    /// Drops every entry and flushes the remote tier. A commit racing the purge
    /// may land afterwards and survive it.
    pub async fn purge_all(&self) {
        let removed = {
            let mut index = self.state.index.lock();
            let removed = index.len();
            index.clear();
            removed
        };
        metrics::set_cache_entries(0);
        metrics::record_cache_purge();
        if let Some(remote) = &self.state.remote
            && let Err(err) = remote.flush().await
        {
            self.record_remote_error("flush", "*", &err);
        }
        info!(removed, "cache purged");
    }

    fn record_remote_error(&self, op: &'static str, key: &str, err: &dyn std::fmt::Display) {
        self.state.stats.remote_errors.incr();
        metrics::record_remote_error(op);
        warn!(op, key, error = %err, "remote cache tier failed");
    }
}
