// In-memory local object store — auto-increment keys, optional simulated latency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::traits::{LocalHandleStore, RawMedia};

pub struct MemoryHandleStore {
    objects: RwLock<HashMap<String, RawMedia>>,
    next_key: AtomicU64,
    latency: Duration,
    reads: AtomicU64,
}

impl MemoryHandleStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            next_key: AtomicU64::new(1),
            latency: Duration::ZERO,
            reads: AtomicU64::new(0),
        }
    }

    /// Every read waits `latency` before resolving.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Store `media` under an explicit key, replacing any previous object.
    pub fn insert(&self, key: &str, media: RawMedia) {
        self.objects.write().insert(key.to_string(), media);
    }

    /// Number of `get_by_key` calls served so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl Default for MemoryHandleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalHandleStore for MemoryHandleStore {
    async fn get_by_key(&self, key: &str) -> Result<Option<RawMedia>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let found = self.objects.read().get(key).cloned();
        debug!("memory store read key={} found={}", key, found.is_some());
        Ok(found)
    }

    async fn put(&self, media: RawMedia) -> Result<String> {
        let mut objects = self.objects.write();
        // Keys seeded through `insert` are never reused.
        let key = loop {
            let candidate = self.next_key.fetch_add(1, Ordering::Relaxed).to_string();
            if !objects.contains_key(&candidate) {
                break candidate;
            }
        };
        objects.insert(key.clone(), media);
        debug!("memory store put key={}", key);
        Ok(key)
    }
}
