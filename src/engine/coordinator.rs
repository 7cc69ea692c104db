// Local-media load coordination — bounded concurrent loads, FIFO queueing, shared handle cache.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::{Admission, MediaHandleCache};
use super::stats::{LoadStats, LoadStatsSnapshot};
use crate::config::LoadConfig;
use crate::source::handle::MediaHandle;
use crate::source::traits::LocalHandleStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquireError {
    #[error("no stored media for key {0}")]
    NotFound(String),
    #[error("local store read failed: {0}")]
    Store(String),
    #[error("load coordinator shut down")]
    ShutDown,
}

/// A session waiting for a load slot.
struct LoadRequest {
    key: String,
    resolve: oneshot::Sender<SlotPermit>,
}

struct LoadState {
    active: usize,
    queue: VecDeque<LoadRequest>,
    /// Keys with a store read in flight, tagged with the load id that owns them.
    loading: HashMap<String, (u64, watch::Receiver<LoadOutcome>)>,
    cache: MediaHandleCache,
}

/// Published by a load to callers waiting on the same key; `None` until it finishes.
type LoadOutcome = Option<Result<(), AcquireError>>;

enum Step {
    Hit(MediaHandle),
    Follow(watch::Receiver<LoadOutcome>),
    Queued(oneshot::Receiver<SlotPermit>),
    Load(u64, watch::Sender<LoadOutcome>),
}

/// Process-wide service bounding local-media loads and caching their handles.
///
/// The slot counter, queue and cache live behind one lock that is never held
/// across an await, so a check-and-increment of the slot budget is atomic with
/// respect to every other acquisition.
pub struct ResourceLoadCoordinator {
    store: Arc<dyn LocalHandleStore>,
    state: Mutex<LoadState>,
    stats: LoadStats,
    max_in_flight: usize,
    stagger: Duration,
    shutdown_token: CancellationToken,
    next_id: AtomicU64,
}

impl ResourceLoadCoordinator {
    pub fn init(config: &LoadConfig, store: Arc<dyn LocalHandleStore>) -> Arc<Self> {
        info!(
            "load coordinator started: max_in_flight={} cache_capacity={} stagger_ms={}",
            config.max_concurrent_loads, config.cache_capacity, config.stagger_ms
        );
        Arc::new(Self {
            store,
            state: Mutex::new(LoadState {
                active: 0,
                queue: VecDeque::new(),
                loading: HashMap::new(),
                cache: MediaHandleCache::new(config.cache_capacity),
            }),
            stats: LoadStats::new(),
            max_in_flight: config.max_concurrent_loads.max(1),
            stagger: config.stagger(),
            shutdown_token: CancellationToken::new(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Obtain a playable handle for `key`.
    ///
    /// Cached keys resolve immediately without a slot. Otherwise the call takes
    /// a load slot, or queues FIFO until one frees. A key that another caller is
    /// already loading is awaited rather than loaded twice.
    pub async fn acquire(self: &Arc<Self>, key: &str) -> Result<HandleLease, AcquireError> {
        let mut permit: Option<SlotPermit> = None;
        loop {
            let step = {
                let mut state = self.state.lock();
                if self.shutdown_token.is_cancelled() {
                    None
                } else if let Some(handle) = state.cache.checkout(key) {
                    Some(Step::Hit(handle))
                } else if let Some((_, rx)) = state.loading.get(key) {
                    Some(Step::Follow(rx.clone()))
                } else if permit.is_some() || state.active < self.max_in_flight {
                    if permit.is_none() {
                        state.active += 1;
                        self.stats.set_active(state.active);
                        permit = Some(SlotPermit {
                            coordinator: Arc::clone(self),
                        });
                    }
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    state.loading.insert(key.to_string(), (id, rx));
                    Some(Step::Load(id, tx))
                } else {
                    let (tx, rx) = oneshot::channel();
                    state.queue.push_back(LoadRequest {
                        key: key.to_string(),
                        resolve: tx,
                    });
                    self.stats.record_queued();
                    self.stats.set_queued(state.queue.len());
                    Some(Step::Queued(rx))
                }
            };

            let Some(step) = step else {
                return Err(AcquireError::ShutDown);
            };

            match step {
                Step::Hit(handle) => {
                    self.stats.record_cache_hit();
                    debug!("cache hit key={} id={}", key, handle.id());
                    return Ok(HandleLease {
                        coordinator: Arc::clone(self),
                        key: key.to_string(),
                        handle,
                        cached: true,
                    });
                }
                Step::Follow(mut rx) => {
                    // Hand our slot on rather than sit on it while someone else loads.
                    drop(permit.take());
                    debug!("key={} already loading, waiting for that load", key);
                    let _ = rx.changed().await;
                    let outcome = rx.borrow().clone();
                    match outcome {
                        // A failed load fails everyone who waited on it.
                        Some(Err(e)) if e != AcquireError::ShutDown => {
                            debug!("key={} shared load failed: {}", key, e);
                            return Err(e);
                        }
                        _ => {}
                    }
                }
                Step::Queued(rx) => {
                    debug!("load slots exhausted, queued key={}", key);
                    match rx.await {
                        Ok(granted) => permit = Some(granted),
                        Err(_) => return Err(AcquireError::ShutDown),
                    }
                }
                Step::Load(id, done) => {
                    let loading = LoadingMark {
                        coordinator: Arc::clone(self),
                        key: key.to_string(),
                        id,
                        done,
                    };
                    let result = self.load(key).await;
                    loading.finish(&result);
                    drop(loading);
                    drop(permit.take());
                    return result;
                }
            }
        }
    }

    async fn load(self: &Arc<Self>, key: &str) -> Result<HandleLease, AcquireError> {
        self.stats.record_started();
        info!("loading local media key={}", key);

        let fetched = tokio::select! {
            fetched = self.store.get_by_key(key) => fetched,
            _ = self.shutdown_token.cancelled() => {
                debug!("load of key={} abandoned: shutdown in progress", key);
                return Err(AcquireError::ShutDown);
            }
        };

        let handle = match fetched {
            Ok(Some(raw)) => {
                MediaHandle::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed), key, raw)
            }
            Ok(None) => {
                self.stats.record_failed();
                warn!("local media key={} not found in store", key);
                return Err(AcquireError::NotFound(key.to_string()));
            }
            Err(e) => {
                self.stats.record_failed();
                warn!("local media key={} failed to load: {:#}", key, e);
                return Err(AcquireError::Store(format!("{:#}", e)));
            }
        };

        let admission = {
            let mut state = self.state.lock();
            if self.shutdown_token.is_cancelled() {
                None
            } else {
                Some(state.cache.admit(key, handle.clone()))
            }
        };

        let cached = match admission {
            None => {
                handle.revoke();
                return Err(AcquireError::ShutDown);
            }
            Some(Admission::Cached { evicted }) => {
                if !evicted.is_empty() {
                    self.stats.record_evictions(evicted.len());
                }
                true
            }
            Some(Admission::Uncached) => false,
        };
        debug!("loaded key={} id={} cached={}", key, handle.id(), cached);

        Ok(HandleLease {
            coordinator: Arc::clone(self),
            key: key.to_string(),
            handle,
            cached,
        })
    }

    /// Return a slot to the budget, or pass it straight to the next queued
    /// request after the stagger delay.
    fn release_slot(self: &Arc<Self>) {
        let next = {
            let mut state = self.state.lock();
            let mut next = None;
            while let Some(request) = state.queue.pop_front() {
                if !request.resolve.is_closed() {
                    next = Some(request);
                    break;
                }
            }
            if next.is_none() {
                state.active = state.active.saturating_sub(1);
                self.stats.set_active(state.active);
            }
            self.stats.set_queued(state.queue.len());
            next
        };

        let Some(request) = next else {
            return;
        };
        debug!("handing load slot to queued key={}", request.key);

        // The slot stays counted as active while it is in transit.
        let permit = SlotPermit {
            coordinator: Arc::clone(self),
        };
        if self.stagger.is_zero() {
            let _ = request.resolve.send(permit);
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let stagger = self.stagger;
                runtime.spawn(async move {
                    tokio::time::sleep(stagger).await;
                    // A requester that went away drops the permit, which passes it on again.
                    let _ = request.resolve.send(permit);
                });
            }
            Err(_) => {
                let _ = request.resolve.send(permit);
            }
        }
    }

    fn checkin(&self, key: &str) {
        self.state.lock().cache.checkin(key);
    }

    /// Explicitly drop an unreferenced cache entry, revoking its handle.
    pub fn evict(&self, key: &str) -> bool {
        let removed = self.state.lock().cache.remove(key);
        if removed {
            self.stats.record_evictions(1);
            debug!("explicitly evicted key={}", key);
        }
        removed
    }

    /// Stop admitting work, fail queued requests and revoke every cached handle.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
        let (dropped, revoked) = {
            let mut state = self.state.lock();
            let dropped = std::mem::take(&mut state.queue);
            (dropped, state.cache.clear())
        };
        self.stats.set_queued(0);
        info!(
            "load coordinator shut down: {} queued requests dropped, {} handles revoked",
            dropped.len(),
            revoked
        );
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn stats(&self) -> LoadStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn active_loads(&self) -> usize {
        self.state.lock().active
    }

    pub fn is_cached(&self, key: &str) -> bool {
        self.state.lock().cache.contains(key)
    }

    pub fn cached_len(&self) -> usize {
        self.state.lock().cache.len()
    }

    /// Cached keys from least to most recently accessed.
    pub fn cached_keys(&self) -> Vec<String> {
        self.state.lock().cache.keys_by_recency()
    }
}

/// One unit of the concurrent-load budget. Dropping it frees the slot.
pub struct SlotPermit {
    coordinator: Arc<ResourceLoadCoordinator>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.coordinator.release_slot();
    }
}

/// Marks `key` as loading; clears the mark and wakes followers when dropped.
struct LoadingMark {
    coordinator: Arc<ResourceLoadCoordinator>,
    key: String,
    id: u64,
    done: watch::Sender<LoadOutcome>,
}

impl LoadingMark {
    fn finish(&self, result: &Result<HandleLease, AcquireError>) {
        let outcome = result.as_ref().map(|_| ()).map_err(Clone::clone);
        self.done.send_replace(Some(outcome));
    }
}

impl Drop for LoadingMark {
    fn drop(&mut self) {
        let mut state = self.coordinator.state.lock();
        if matches!(state.loading.get(&self.key), Some((id, _)) if *id == self.id) {
            state.loading.remove(&self.key);
        }
    }
}

/// A session's reference to an acquired handle.
///
/// Dropping a cached lease leaves the entry resident for other tiles; an
/// uncached lease owns its handle outright and revokes it.
pub struct HandleLease {
    coordinator: Arc<ResourceLoadCoordinator>,
    key: String,
    handle: MediaHandle,
    cached: bool,
}

impl HandleLease {
    pub fn handle(&self) -> &MediaHandle {
        &self.handle
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_cached(&self) -> bool {
        self.cached
    }
}

impl fmt::Debug for HandleLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleLease")
            .field("key", &self.key)
            .field("handle", &self.handle)
            .field("cached", &self.cached)
            .finish()
    }
}

impl Drop for HandleLease {
    fn drop(&mut self) {
        if self.cached {
            self.coordinator.checkin(&self.key);
        } else {
            self.handle.revoke();
        }
    }
}
