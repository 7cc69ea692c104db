// Reusable local-media handle cache — LRU by logical access clock, reference-aware eviction.

use std::collections::HashMap;

use tracing::debug;

use crate::source::handle::MediaHandle;

struct CacheEntry {
    handle: MediaHandle,
    /// Logical access clock value at the last checkout/admission.
    last_access: u64,
    /// Live sessions currently holding this handle.
    refs: usize,
}

/// Outcome of offering a freshly loaded handle to the cache.
#[derive(Debug)]
pub enum Admission {
    /// Entry cached and referenced once; `evicted` handles were revoked to make room.
    Cached { evicted: Vec<MediaHandle> },
    /// Every resident entry is referenced, so the handle stays with its caller.
    Uncached,
}

/// Maps a source key to a shared playable handle, bounded to `capacity` entries.
///
/// The cache owns each handle's lifetime: releasing the last reference leaves the
/// entry resident for reuse, and only eviction or `clear` revokes it. Eviction
/// picks the least recently accessed entry that no live session references.
pub struct MediaHandleCache {
    entries: HashMap<String, CacheEntry>,
    capacity: usize,
    clock: u64,
}

impl MediaHandleCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Take a reference on a cached handle and refresh its recency.
    pub fn checkout(&mut self, key: &str) -> Option<MediaHandle> {
        let now = self.tick();
        let entry = self.entries.get_mut(key)?;
        entry.last_access = now;
        entry.refs += 1;
        Some(entry.handle.clone())
    }

    /// Drop a reference taken by `checkout` or `admit`. The entry stays cached.
    pub fn checkin(&mut self, key: &str) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.refs = entry.refs.saturating_sub(1);
        }
    }

    /// Insert a newly loaded handle, referenced once by the caller.
    pub fn admit(&mut self, key: &str, handle: MediaHandle) -> Admission {
        if let Some(previous) = self.entries.get(key) {
            // A handle for this key is already resident; prefer the resident one's slot.
            if previous.refs == 0 {
                if let Some(old) = self.entries.remove(key) {
                    old.handle.revoke();
                }
            } else {
                return Admission::Uncached;
            }
        }

        let mut evicted = Vec::new();
        while self.entries.len() >= self.capacity {
            match self.lru_unreferenced() {
                Some(victim) => {
                    if let Some(entry) = self.entries.remove(&victim) {
                        entry.handle.revoke();
                        debug!("evicted cached handle key={} id={}", victim, entry.handle.id());
                        evicted.push(entry.handle);
                    }
                }
                None => {
                    debug!(
                        "cache full with {} referenced entries, serving key={} uncached",
                        self.entries.len(),
                        key
                    );
                    return Admission::Uncached;
                }
            }
        }

        let now = self.tick();
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                handle,
                last_access: now,
                refs: 1,
            },
        );
        Admission::Cached { evicted }
    }

    /// Remove an unreferenced entry and revoke its handle.
    pub fn remove(&mut self, key: &str) -> bool {
        match self.entries.get(key) {
            Some(entry) if entry.refs == 0 => {}
            _ => return false,
        }
        if let Some(entry) = self.entries.remove(key) {
            entry.handle.revoke();
        }
        true
    }

    /// Revoke and drop every entry, referenced or not. Used on global teardown.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            entry.handle.revoke();
        }
        count
    }

    fn lru_unreferenced(&self) -> Option<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.refs == 0)
            .min_by_key(|(_, e)| e.last_access)
            .map(|(k, _)| k.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn refs(&self, key: &str) -> usize {
        self.entries.get(key).map_or(0, |e| e.refs)
    }

    /// Keys ordered from least to most recently accessed.
    pub fn keys_by_recency(&self) -> Vec<String> {
        let mut keys: Vec<(&String, u64)> =
            self.entries.iter().map(|(k, e)| (k, e.last_access)).collect();
        keys.sort_by_key(|(_, at)| *at);
        keys.into_iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
