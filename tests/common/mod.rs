// Shared fakes for the integration tests: media element, stream engine, visibility host, stores.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use tile_stream_engine::config::EngineTuning;
use tile_stream_engine::source::traits::{
    ElementEvent, ElementSource, EngineError, EngineErrorDetails, EngineErrorKind, EngineEvent,
    EngineEvents, IntersectionOptions, LocalHandleStore, MediaElement, PlayError, RawMedia,
    StreamEngine, StreamEngineFactory, VisibilityHost,
};

pub fn clip(name: &str) -> RawMedia {
    RawMedia {
        bytes: Bytes::from(format!("ftyp-{}", name).into_bytes()),
        content_type: "video/mp4".to_string(),
        name: Some(name.to_string()),
    }
}

pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

// ---------------------------------------------------------------------------
// Media element
// ---------------------------------------------------------------------------

pub struct FakeElement {
    paused: AtomicBool,
    source: Mutex<Option<ElementSource>>,
    events: broadcast::Sender<ElementEvent>,
    play_delay: Mutex<Duration>,
    scripted: Mutex<VecDeque<Result<(), PlayError>>>,
    buffered: Mutex<Option<Duration>>,
    native_adaptive: AtomicBool,
    in_flight: AtomicUsize,
    overlaps: AtomicUsize,
    plays: AtomicUsize,
    pauses: AtomicUsize,
}

impl FakeElement {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(32);
        Arc::new(Self {
            paused: AtomicBool::new(true),
            source: Mutex::new(None),
            events,
            play_delay: Mutex::new(Duration::ZERO),
            scripted: Mutex::new(VecDeque::new()),
            buffered: Mutex::new(None),
            native_adaptive: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            overlaps: AtomicUsize::new(0),
            plays: AtomicUsize::new(0),
            pauses: AtomicUsize::new(0),
        })
    }

    pub fn set_play_delay(&self, delay: Duration) {
        *self.play_delay.lock() = delay;
    }

    /// Results returned by the next `play()` calls, in order; `Ok` afterwards.
    pub fn script(&self, results: impl IntoIterator<Item = Result<(), PlayError>>) {
        self.scripted.lock().extend(results);
    }

    pub fn set_buffered(&self, ahead: Option<Duration>) {
        *self.buffered.lock() = ahead;
    }

    pub fn set_native_adaptive(&self, supported: bool) {
        self.native_adaptive.store(supported, Ordering::SeqCst);
    }

    pub fn set_playing(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn emit(&self, event: ElementEvent) {
        let _ = self.events.send(event);
    }

    pub fn source(&self) -> Option<ElementSource> {
        self.source.lock().clone()
    }

    pub fn plays(&self) -> usize {
        self.plays.load(Ordering::SeqCst)
    }

    pub fn pauses(&self) -> usize {
        self.pauses.load(Ordering::SeqCst)
    }

    /// Operations issued while a previous `play()` was still unresolved.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaElement for FakeElement {
    async fn play(&self) -> Result<(), PlayError> {
        self.plays.fetch_add(1, Ordering::SeqCst);
        if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let delay = *self.play_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let result = self.scripted.lock().pop_front().unwrap_or(Ok(()));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if result.is_ok() {
            self.paused.store(false, Ordering::SeqCst);
            let _ = self.events.send(ElementEvent::Playing);
        }
        result
    }

    fn pause(&self) {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.pauses.fetch_add(1, Ordering::SeqCst);
        self.paused.store(true, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn set_source(&self, source: Option<ElementSource>) {
        *self.source.lock() = source;
    }

    fn buffered_ahead(&self) -> Option<Duration> {
        *self.buffered.lock()
    }

    fn can_play_type(&self, _mime: &str) -> bool {
        self.native_adaptive.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<ElementEvent> {
        self.events.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Stream engine
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct EngineProbe {
    supported: AtomicBool,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    double_destroys: AtomicUsize,
    start_loads: AtomicUsize,
    locators: Mutex<Vec<String>>,
    events: Mutex<Option<EngineEvents>>,
}

impl EngineProbe {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn double_destroys(&self) -> usize {
        self.double_destroys.load(Ordering::SeqCst)
    }

    pub fn start_loads(&self) -> usize {
        self.start_loads.load(Ordering::SeqCst)
    }

    pub fn locators(&self) -> Vec<String> {
        self.locators.lock().clone()
    }

    /// Emit from the most recently created engine.
    pub fn emit(&self, event: EngineEvent) {
        if let Some(events) = self.events.lock().clone() {
            events.emit(event);
        }
    }

    pub fn emit_error(&self, fatal: bool, kind: EngineErrorKind, details: EngineErrorDetails, http_status: Option<u16>) {
        self.emit(EngineEvent::Error(EngineError {
            fatal,
            kind,
            details,
            http_status,
        }));
    }
}

pub struct FakeEngineFactory {
    pub probe: Arc<EngineProbe>,
}

impl FakeEngineFactory {
    pub fn new() -> Arc<Self> {
        let probe = EngineProbe::default();
        probe.supported.store(true, Ordering::SeqCst);
        Arc::new(Self {
            probe: Arc::new(probe),
        })
    }

    pub fn unsupported() -> Arc<Self> {
        Arc::new(Self {
            probe: Arc::new(EngineProbe::default()),
        })
    }
}

impl StreamEngineFactory for FakeEngineFactory {
    fn is_supported(&self) -> bool {
        self.probe.supported.load(Ordering::SeqCst)
    }

    fn create(&self, _tuning: &EngineTuning, events: EngineEvents) -> Result<Box<dyn StreamEngine>> {
        self.probe.created.fetch_add(1, Ordering::SeqCst);
        *self.probe.events.lock() = Some(events);
        Ok(Box::new(FakeEngine {
            probe: Arc::clone(&self.probe),
            destroy_calls: AtomicUsize::new(0),
        }))
    }
}

struct FakeEngine {
    probe: Arc<EngineProbe>,
    destroy_calls: AtomicUsize,
}

impl StreamEngine for FakeEngine {
    fn load_source(&self, locator: &str) -> Result<()> {
        if locator.is_empty() {
            return Err(anyhow!("empty locator"));
        }
        self.probe.locators.lock().push(locator.to_string());
        Ok(())
    }

    fn attach_media(&self, _element: Arc<dyn MediaElement>) -> Result<()> {
        Ok(())
    }

    fn start_load(&self) {
        self.probe.start_loads.fetch_add(1, Ordering::SeqCst);
    }

    fn destroy(&self) {
        if self.destroy_calls.fetch_add(1, Ordering::SeqCst) > 0 {
            self.probe.double_destroys.fetch_add(1, Ordering::SeqCst);
        }
        self.probe.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Visibility host
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeVisibilityHost {
    observers: Mutex<HashMap<String, mpsc::UnboundedSender<bool>>>,
}

impl FakeVisibilityHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Report a raw intersection flip for `element`.
    pub fn set(&self, element: &str, visible: bool) {
        if let Some(tx) = self.observers.lock().get(element) {
            let _ = tx.send(visible);
        }
    }
}

impl VisibilityHost for FakeVisibilityHost {
    fn observe(&self, element: &str, _options: &IntersectionOptions) -> mpsc::UnboundedReceiver<bool> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.lock().insert(element.to_string(), tx);
        rx
    }
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

pub struct FailingStore;

#[async_trait]
impl LocalHandleStore for FailingStore {
    async fn get_by_key(&self, key: &str) -> Result<Option<RawMedia>> {
        Err(anyhow!("object store unavailable while reading {}", key))
    }

    async fn put(&self, _media: RawMedia) -> Result<String> {
        Err(anyhow!("object store is read-only"))
    }
}
