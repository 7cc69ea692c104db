// Per-tile stream session — runs the state machine and owns the tile's engine, handle and guard.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::coordinator::{AcquireError, HandleLease, ResourceLoadCoordinator};
use super::fault::{classify_acquire_error, classify_engine_error, classify_play_error, FailureClass};
use super::guard::{PlayReport, PlaybackGuard, StartOutcome};
use super::state::{Effect, RetryPolicy, SessionEvent, SessionMachine, SessionState, TileStatus};
use super::viewport::{VisibilityChange, VisibilityStream};
use crate::config::{TileConfig, ADAPTIVE_MIME_TYPE};
use crate::source::descriptor::{SourceDescriptor, SourceKind};
use crate::source::traits::{
    ElementEvent, ElementSource, EngineEvent, EngineEvents, MediaElement, StreamEngine,
    StreamEngineFactory,
};

/// Shared services every session borrows.
#[derive(Clone)]
pub struct SessionDeps {
    pub coordinator: Arc<ResourceLoadCoordinator>,
    pub engines: Arc<dyn StreamEngineFactory>,
    pub config: Arc<TileConfig>,
}

/// Point-in-time view of a session for the hosting UI.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub tile_id: String,
    pub descriptor: Option<SourceDescriptor>,
    pub state: SessionState,
    pub status: TileStatus,
    pub retry_attempt: u32,
    pub last_error_at: Option<Instant>,
    pub last_failure: Option<FailureClass>,
}

/// Engine instance owned by one load cycle. Destroyed exactly once, however
/// many teardown paths reach it.
struct EngineSlot {
    engine: Box<dyn StreamEngine>,
    destroying: AtomicBool,
}

impl EngineSlot {
    fn new(engine: Box<dyn StreamEngine>) -> Self {
        Self {
            engine,
            destroying: AtomicBool::new(false),
        }
    }

    fn destroy(&self) -> bool {
        if self.destroying.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.engine.destroy();
        true
    }
}

impl Drop for EngineSlot {
    fn drop(&mut self) {
        self.destroy();
    }
}

enum Command {
    Retry,
    SetDescriptor(Option<SourceDescriptor>),
    Unmount(oneshot::Sender<()>),
}

/// Completions from tasks the session spawned, tagged with the cycle that spawned them.
enum Internal {
    Handle {
        epoch: u64,
        result: Result<HandleLease, AcquireError>,
    },
    Engine {
        epoch: u64,
        event: EngineEvent,
    },
    Play(PlayReport),
    RetryTimer {
        epoch: u64,
    },
}

enum Wake {
    Command(Option<Command>),
    Internal(Option<Internal>),
    Visibility(Option<VisibilityChange>),
    Element(Result<ElementEvent, RecvError>),
}

pub struct StreamSession {
    tile_id: String,
    descriptor: Option<SourceDescriptor>,
    element: Arc<dyn MediaElement>,
    guard: PlaybackGuard,
    deps: SessionDeps,
    machine: SessionMachine,
    /// Bumped on every teardown and engine rebuild; completions from older
    /// cycles are discarded.
    epoch: u64,
    lease: Option<HandleLease>,
    engine: Option<EngineSlot>,
    retry_timer: Option<CancellationToken>,
    internal: mpsc::UnboundedSender<Internal>,
    status: watch::Sender<SessionSnapshot>,
}

impl StreamSession {
    /// Start the session task for one tile.
    ///
    /// `descriptor` is `None` when the tile was given no usable source; such a
    /// session errors as soon as it becomes visible.
    pub fn spawn(
        tile_id: &str,
        descriptor: Option<SourceDescriptor>,
        element: Arc<dyn MediaElement>,
        visibility: VisibilityStream,
        deps: SessionDeps,
    ) -> SessionHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let reporter_tx = internal_tx.clone();
        let guard = PlaybackGuard::new(
            Arc::clone(&element),
            &deps.config.playback,
            Arc::new(move |report| {
                let _ = reporter_tx.send(Internal::Play(report));
            }),
        );
        let machine = SessionMachine::new(RetryPolicy::new(
            &deps.config.playback,
            &deps.config.recovery,
        ));

        let (status_tx, status_rx) = watch::channel(SessionSnapshot {
            tile_id: tile_id.to_string(),
            descriptor: descriptor.clone(),
            state: SessionState::Idle,
            status: TileStatus::Hidden,
            retry_attempt: 0,
            last_error_at: None,
            last_failure: None,
        });

        let element_events = element.subscribe();
        let session = StreamSession {
            tile_id: tile_id.to_string(),
            descriptor,
            element,
            guard,
            deps,
            machine,
            epoch: 0,
            lease: None,
            engine: None,
            retry_timer: None,
            internal: internal_tx,
            status: status_tx,
        };
        let task = tokio::spawn(session.run(command_rx, internal_rx, visibility, element_events));

        SessionHandle {
            commands: command_tx,
            status: status_rx,
            task,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut visibility: VisibilityStream,
        mut element_events: broadcast::Receiver<ElementEvent>,
    ) {
        debug!("session {} mounted with {:?}", self.tile_id, self.descriptor);
        let mut visibility_open = true;
        let mut element_open = true;

        loop {
            let wake = tokio::select! {
                command = commands.recv() => Wake::Command(command),
                message = internal.recv() => Wake::Internal(message),
                change = visibility.next(), if visibility_open => Wake::Visibility(change),
                event = element_events.recv(), if element_open => Wake::Element(event),
            };

            let event = match wake {
                Wake::Command(Some(Command::Retry)) => Some(SessionEvent::RetryRequested),
                Wake::Command(Some(Command::SetDescriptor(descriptor))) => {
                    if descriptor == self.descriptor {
                        None
                    } else {
                        self.descriptor = descriptor;
                        Some(SessionEvent::DescriptorChanged)
                    }
                }
                Wake::Command(Some(Command::Unmount(ack))) => {
                    self.dispatch(SessionEvent::Unmount).await;
                    let _ = ack.send(());
                    break;
                }
                Wake::Command(None) => {
                    self.dispatch(SessionEvent::Unmount).await;
                    break;
                }
                Wake::Internal(Some(message)) => self.accept(message),
                Wake::Internal(None) => None,
                Wake::Visibility(Some(change)) => Some(if change.visible {
                    SessionEvent::Visible
                } else {
                    SessionEvent::Hidden
                }),
                Wake::Visibility(None) => {
                    visibility_open = false;
                    None
                }
                Wake::Element(Ok(ElementEvent::Playing)) => Some(SessionEvent::ElementPlaying),
                Wake::Element(Ok(ElementEvent::Waiting | ElementEvent::Stalled)) => {
                    Some(SessionEvent::ElementWaiting)
                }
                // Play timing is left to buffer notifications, not canplay.
                Wake::Element(Ok(ElementEvent::CanPlay)) => None,
                Wake::Element(Err(RecvError::Lagged(skipped))) => {
                    debug!("session {} skipped {} element events", self.tile_id, skipped);
                    None
                }
                Wake::Element(Err(RecvError::Closed)) => {
                    element_open = false;
                    None
                }
            };

            if let Some(event) = event {
                self.dispatch(event).await;
            }
        }

        debug!("session {} unmounted", self.tile_id);
    }

    /// Turn a task completion into a machine event, discarding stale ones.
    fn accept(&mut self, message: Internal) -> Option<SessionEvent> {
        match message {
            Internal::Handle { epoch, result } => {
                if epoch != self.epoch || self.machine.state() != SessionState::Loading {
                    if let Ok(lease) = result {
                        debug!(
                            "session {} discarding handle key={} that resolved after teardown",
                            self.tile_id,
                            lease.key()
                        );
                    }
                    return None;
                }
                match result {
                    Ok(lease) => {
                        self.element
                            .set_source(Some(ElementSource::Handle(lease.handle().clone())));
                        self.lease = Some(lease);
                        Some(SessionEvent::SourceAttached)
                    }
                    Err(e) => {
                        warn!("session {} local load failed: {}", self.tile_id, e);
                        Some(SessionEvent::Failure(classify_acquire_error(&e)))
                    }
                }
            }
            Internal::Engine { epoch, event } => {
                if epoch != self.epoch || self.engine.is_none() {
                    return None;
                }
                match event {
                    EngineEvent::ManifestParsed => {
                        debug!("session {} manifest parsed, waiting for buffer", self.tile_id);
                        Some(SessionEvent::ManifestParsed)
                    }
                    EngineEvent::FragmentBuffered => {
                        self.buffer_ready().then_some(SessionEvent::BufferReady)
                    }
                    EngineEvent::Error(e) => {
                        let class = classify_engine_error(&e);
                        if class.is_surfaced() {
                            warn!("session {} unrecoverable engine error: {}", self.tile_id, e);
                        } else {
                            debug!("session {} engine error {} classified {:?}", self.tile_id, e, class);
                        }
                        Some(SessionEvent::Failure(class))
                    }
                }
            }
            Internal::Play(report) => {
                if report.epoch != self.epoch {
                    return None;
                }
                match report.result {
                    Ok(StartOutcome::Started | StartOutcome::AlreadyPlaying) => {
                        Some(SessionEvent::PlayStarted)
                    }
                    Ok(StartOutcome::Superseded) => None,
                    Err(e) => {
                        debug!("session {} play failed: {}", self.tile_id, e);
                        Some(SessionEvent::Failure(classify_play_error(&e)))
                    }
                }
            }
            Internal::RetryTimer { epoch } => {
                (epoch == self.epoch).then_some(SessionEvent::RetryTimerFired)
            }
        }
    }

    fn buffer_ready(&self) -> bool {
        if !self.element.is_paused() {
            return false;
        }
        let needed = self.deps.config.playback.min_buffer_ahead();
        self.element
            .buffered_ahead()
            .map_or(false, |ahead| ahead >= needed)
    }

    async fn dispatch(&mut self, event: SessionEvent) {
        let mut pending = VecDeque::from([event]);
        while let Some(event) = pending.pop_front() {
            let before = self.machine.state();
            let effects = self.machine.on_event(event, Instant::now());
            let after = self.machine.state();
            if before != after {
                debug!("session {} {:?} -> {:?} on {:?}", self.tile_id, before, after, event);
            }
            for effect in effects {
                if let Some(follow_up) = self.apply(effect).await {
                    pending.push_back(follow_up);
                }
            }
        }
        self.publish();
    }

    async fn apply(&mut self, effect: Effect) -> Option<SessionEvent> {
        match effect {
            Effect::BeginLoad => self.begin_load(),
            Effect::RequestPlay(trigger) => {
                self.guard.request_start(trigger, self.epoch);
                None
            }
            Effect::RestartEngineLoad => {
                if let Some(slot) = &self.engine {
                    info!("session {} restarting engine load", self.tile_id);
                    slot.engine.start_load();
                }
                None
            }
            Effect::RecreateEngine => {
                info!("session {} recreating engine after decode failure", self.tile_id);
                self.guard.cancel_scheduled();
                self.destroy_engine();
                self.epoch += 1;
                self.begin_load()
            }
            Effect::DestroyEngine => {
                self.destroy_engine();
                None
            }
            Effect::Teardown => {
                self.teardown().await;
                None
            }
            Effect::ScheduleRetry(delay) => {
                self.schedule_retry(delay);
                None
            }
        }
    }

    fn begin_load(&mut self) -> Option<SessionEvent> {
        let Some(descriptor) = self.descriptor.clone() else {
            warn!("session {} has no source to load", self.tile_id);
            return Some(SessionEvent::Failure(FailureClass::UnclassifiedFatal));
        };

        match descriptor.kind() {
            SourceKind::LocalHandle => {
                let coordinator = Arc::clone(&self.deps.coordinator);
                let tx = self.internal.clone();
                let epoch = self.epoch;
                let key = descriptor.key().to_string();
                tokio::spawn(async move {
                    let result = coordinator.acquire(&key).await;
                    // If the session is gone the lease is dropped along with the message.
                    let _ = tx.send(Internal::Handle { epoch, result });
                });
                None
            }
            SourceKind::RemoteStream => self.create_engine(descriptor.key()),
        }
    }

    fn create_engine(&mut self, locator: &str) -> Option<SessionEvent> {
        if !self.deps.engines.is_supported() {
            if self.element.can_play_type(ADAPTIVE_MIME_TYPE) {
                debug!("session {} using native adaptive playback", self.tile_id);
                self.element
                    .set_source(Some(ElementSource::Locator(locator.to_string())));
                return Some(SessionEvent::SourceAttached);
            }
            warn!("session {} cannot play adaptive streams on this platform", self.tile_id);
            return Some(SessionEvent::Failure(FailureClass::UnclassifiedFatal));
        }

        let tx = self.internal.clone();
        let epoch = self.epoch;
        let events = EngineEvents::new(move |event| {
            let _ = tx.send(Internal::Engine { epoch, event });
        });

        let engine = match self.deps.engines.create(&self.deps.config.stream_engine, events) {
            Ok(engine) => engine,
            Err(e) => {
                warn!("session {} engine creation failed: {:#}", self.tile_id, e);
                return Some(SessionEvent::Failure(FailureClass::UnclassifiedFatal));
            }
        };
        let slot = EngineSlot::new(engine);
        let attached = slot
            .engine
            .load_source(locator)
            .and_then(|_| slot.engine.attach_media(Arc::clone(&self.element)));
        self.engine = Some(slot);

        match attached {
            Ok(()) => {
                info!("session {} engine loading {}", self.tile_id, locator);
                None
            }
            Err(e) => {
                warn!("session {} engine failed to load {}: {:#}", self.tile_id, locator, e);
                Some(SessionEvent::Failure(FailureClass::UnclassifiedFatal))
            }
        }
    }

    fn destroy_engine(&mut self) {
        if let Some(slot) = self.engine.take() {
            if slot.destroy() {
                debug!("session {} engine destroyed", self.tile_id);
            }
        }
    }

    /// Settle any pending start, pause, release engine and handle, clear the element.
    async fn teardown(&mut self) {
        self.epoch += 1;
        if let Some(timer) = self.retry_timer.take() {
            timer.cancel();
        }
        self.guard.stop().await;
        self.destroy_engine();
        if let Some(lease) = self.lease.take() {
            debug!("session {} released handle key={}", self.tile_id, lease.key());
        }
        self.element.set_source(None);
        debug!("session {} torn down", self.tile_id);
    }

    fn schedule_retry(&mut self, delay: Duration) {
        let token = CancellationToken::new();
        if let Some(previous) = self.retry_timer.replace(token.clone()) {
            previous.cancel();
        }
        info!("session {} retrying in {}ms", self.tile_id, delay.as_millis());
        let tx = self.internal.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(Internal::RetryTimer { epoch });
                }
                _ = token.cancelled() => {}
            }
        });
    }

    fn publish(&self) {
        let retry = self.machine.retry();
        let state = self.machine.state();
        self.status.send_replace(SessionSnapshot {
            tile_id: self.tile_id.clone(),
            descriptor: self.descriptor.clone(),
            state,
            status: state.status(),
            retry_attempt: retry.retry_attempt,
            last_error_at: retry.last_error_at,
            last_failure: retry.last_failure,
        });
    }
}

/// The tile component's handle on its session.
///
/// Dropping it unmounts the session; `unmount` does the same and waits for
/// teardown to finish.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn snapshot(&self) -> SessionSnapshot {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.status.clone()
    }

    /// Manual retry of an errored session.
    pub fn retry(&self) {
        let _ = self.commands.send(Command::Retry);
    }

    /// Replace the source; the current lifecycle is torn down and a new one begins.
    pub fn set_descriptor(&self, descriptor: Option<SourceDescriptor>) {
        let _ = self.commands.send(Command::SetDescriptor(descriptor));
    }

    pub async fn unmount(self) {
        let SessionHandle { commands, task, .. } = self;
        let (ack_tx, ack_rx) = oneshot::channel();
        if commands.send(Command::Unmount(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        let _ = task.await;
    }
}
