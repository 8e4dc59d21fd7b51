use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Engine-wide counters, shared by every component of one engine instance.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub hits: Counter,
    pub misses: Counter,
    pub expired: Counter,
    pub evictions: Counter,
    pub committed: Counter,
    pub recorded_failures: Counter,
    pub declined: Counter,
    pub aborted: Counter,
    pub policy_errors: Counter,
    pub reloads: Counter,
    pub reload_failures: Counter,
    pub refresh_enqueued: Counter,
    pub refresh_deduplicated: Counter,
    pub refresh_completed: Counter,
    pub refresh_failed: Counter,
    pub remote_errors: Counter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub evictions: u64,
    pub committed: u64,
    pub recorded_failures: u64,
    pub declined: u64,
    pub aborted: u64,
    pub policy_errors: u64,
    pub reloads: u64,
    pub reload_failures: u64,
    pub refresh_enqueued: u64,
    pub refresh_deduplicated: u64,
    pub refresh_completed: u64,
    pub refresh_failed: u64,
    pub remote_errors: u64,
}

impl EngineStats {
    pub fn snapshot(&self, entries: usize) -> StatsSnapshot {
        StatsSnapshot {
            entries: entries as u64,
            hits: self.hits.get(),
            misses: self.misses.get(),
            expired: self.expired.get(),
            evictions: self.evictions.get(),
            committed: self.committed.get(),
            recorded_failures: self.recorded_failures.get(),
            declined: self.declined.get(),
            aborted: self.aborted.get(),
            policy_errors: self.policy_errors.get(),
            reloads: self.reloads.get(),
            reload_failures: self.reload_failures.get(),
            refresh_enqueued: self.refresh_enqueued.get(),
            refresh_deduplicated: self.refresh_deduplicated.get(),
            refresh_completed: self.refresh_completed.get(),
            refresh_failed: self.refresh_failed.get(),
            remote_errors: self.remote_errors.get(),
        }
    }
}
