// Load statistics — in-flight slot usage, queueing, cache hits and evictions.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadStatsSnapshot {
    pub active_loads: usize,
    pub peak_active_loads: usize,
    pub queued_now: usize,
    pub loads_started: u64,
    pub loads_failed: u64,
    pub requests_queued: u64,
    pub cache_hits: u64,
    pub evictions: u64,
}

pub struct LoadStats {
    active_loads: AtomicUsize,
    peak_active_loads: AtomicUsize,
    queued_now: AtomicUsize,
    loads_started: AtomicU64,
    loads_failed: AtomicU64,
    requests_queued: AtomicU64,
    cache_hits: AtomicU64,
    evictions: AtomicU64,
}

impl LoadStats {
    pub fn new() -> Self {
        Self {
            active_loads: AtomicUsize::new(0),
            peak_active_loads: AtomicUsize::new(0),
            queued_now: AtomicUsize::new(0),
            loads_started: AtomicU64::new(0),
            loads_failed: AtomicU64::new(0),
            requests_queued: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Record the current number of held load slots.
    pub fn set_active(&self, active: usize) {
        self.active_loads.store(active, Ordering::Relaxed);
        self.peak_active_loads.fetch_max(active, Ordering::Relaxed);
    }

    pub fn set_queued(&self, queued: usize) {
        self.queued_now.store(queued, Ordering::Relaxed);
    }

    pub fn record_started(&self) {
        self.loads_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.loads_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queued(&self) {
        self.requests_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LoadStatsSnapshot {
        LoadStatsSnapshot {
            active_loads: self.active_loads.load(Ordering::Relaxed),
            peak_active_loads: self.peak_active_loads.load(Ordering::Relaxed),
            queued_now: self.queued_now.load(Ordering::Relaxed),
            loads_started: self.loads_started.load(Ordering::Relaxed),
            loads_failed: self.loads_failed.load(Ordering::Relaxed),
            requests_queued: self.requests_queued.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl Default for LoadStats {
    fn default() -> Self {
        Self::new()
    }
}
