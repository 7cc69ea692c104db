// Session state machine — pure transitions keyed by (state, event), emitting effects to run.

use std::time::Duration;

use tokio::time::Instant;

use super::fault::FailureClass;
use super::guard::StartTrigger;
use crate::config::{PlaybackConfig, RecoveryConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Loading,
    Buffering,
    Playing,
    Stalled,
    /// Loaded but the platform refused autoplay.
    AutoplayBlocked,
    /// The source does not exist; no further automatic recovery.
    Unavailable,
    Errored,
    Destroyed,
}

/// What the hosting UI should render for a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileStatus {
    Hidden,
    Loading,
    Playing,
    Paused,
    Unavailable,
    Error,
}

impl SessionState {
    pub fn status(self) -> TileStatus {
        match self {
            SessionState::Idle | SessionState::Destroyed => TileStatus::Hidden,
            SessionState::Loading | SessionState::Buffering | SessionState::Stalled => TileStatus::Loading,
            SessionState::Playing => TileStatus::Playing,
            SessionState::AutoplayBlocked => TileStatus::Paused,
            SessionState::Unavailable => TileStatus::Unavailable,
            SessionState::Errored => TileStatus::Error,
        }
    }

    /// States in which the session may hold a handle, engine or pending start.
    fn holds_resources(self) -> bool {
        !matches!(self, SessionState::Idle | SessionState::Destroyed)
    }

    /// States in which media is being fetched, buffered or played.
    fn is_live(self) -> bool {
        matches!(
            self,
            SessionState::Loading
                | SessionState::Buffering
                | SessionState::Playing
                | SessionState::Stalled
                | SessionState::AutoplayBlocked
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Visible,
    Hidden,
    Unmount,
    DescriptorChanged,
    /// A playable source was assigned to the element (local handle or native locator).
    SourceAttached,
    ManifestParsed,
    /// The element has at least the minimum lookahead buffered and is paused.
    BufferReady,
    PlayStarted,
    ElementPlaying,
    ElementWaiting,
    Failure(FailureClass),
    RetryRequested,
    RetryTimerFired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Acquire the local handle, or create the engine for a remote stream.
    BeginLoad,
    RequestPlay(StartTrigger),
    RestartEngineLoad,
    /// Destroy the current engine and build a fresh one.
    RecreateEngine,
    DestroyEngine,
    /// Settle pending starts, pause, release engine and handle, clear the element.
    Teardown,
    ScheduleRetry(Duration),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub play_retry_limit: u32,
    pub play_retry_delay: Duration,
    pub cooldown: Duration,
    pub max_retries: u32,
    pub max_engine_recreates: u32,
    pub auto_retry: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(playback: &PlaybackConfig, recovery: &RecoveryConfig) -> Self {
        Self {
            play_retry_limit: playback.retry_limit,
            play_retry_delay: playback.retry_delay(),
            cooldown: recovery.cooldown(),
            max_retries: recovery.max_retries,
            max_engine_recreates: recovery.max_engine_recreates,
            auto_retry: recovery.auto_retry(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&PlaybackConfig::default(), &RecoveryConfig::default())
    }
}

/// Per-session recovery counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Play re-issues in the current cycle.
    pub play_attempts: u32,
    /// Session retries after an error, across cycles.
    pub retry_attempt: u32,
    pub engine_recreates: u32,
    pub last_recovery_at: Option<Instant>,
    pub last_error_at: Option<Instant>,
    pub last_failure: Option<FailureClass>,
}

pub struct SessionMachine {
    state: SessionState,
    retry: RetryState,
    policy: RetryPolicy,
    visible: bool,
    unmounted: bool,
}

impl SessionMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: SessionState::Idle,
            retry: RetryState::default(),
            policy,
            visible: false,
            unmounted: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn retry(&self) -> &RetryState {
        &self.retry
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn on_event(&mut self, event: SessionEvent, now: Instant) -> Vec<Effect> {
        use SessionEvent as E;
        use SessionState as S;

        if self.unmounted {
            return Vec::new();
        }

        match (self.state, event) {
            (state, E::Unmount) => {
                self.unmounted = true;
                self.state = S::Destroyed;
                teardown_if(state.holds_resources())
            }
            (state, E::Hidden) => {
                self.visible = false;
                if state.holds_resources() {
                    self.state = S::Destroyed;
                    vec![Effect::Teardown]
                } else {
                    Vec::new()
                }
            }
            (S::Idle | S::Destroyed, E::Visible) => {
                self.visible = true;
                self.begin_cycle()
            }
            (_, E::Visible) => {
                self.visible = true;
                Vec::new()
            }
            (state, E::DescriptorChanged) => {
                self.retry = RetryState::default();
                let mut effects = teardown_if(state.holds_resources());
                if self.visible {
                    effects.extend(self.begin_cycle());
                } else {
                    self.state = S::Idle;
                }
                effects
            }

            (S::Loading, E::SourceAttached) => {
                self.state = S::Buffering;
                vec![Effect::RequestPlay(StartTrigger::Direct)]
            }
            (S::Loading, E::ManifestParsed) => {
                self.state = S::Buffering;
                Vec::new()
            }
            (S::Buffering | S::Stalled, E::BufferReady) => {
                vec![Effect::RequestPlay(StartTrigger::BufferReady)]
            }
            (S::Buffering | S::Stalled | S::AutoplayBlocked, E::PlayStarted | E::ElementPlaying) => {
                self.state = S::Playing;
                self.retry.play_attempts = 0;
                Vec::new()
            }
            (S::Playing, E::ElementWaiting) => {
                self.state = S::Stalled;
                Vec::new()
            }

            (state, E::Failure(class)) if state.is_live() => self.on_failure(class, now),

            (S::Errored, E::RetryRequested | E::RetryTimerFired) => {
                if self.retry.retry_attempt >= self.policy.max_retries || !self.cooldown_elapsed(now) {
                    return Vec::new();
                }
                self.retry.retry_attempt += 1;
                self.retry.last_recovery_at = Some(now);
                // Resources were already released on entering Errored.
                self.begin_cycle()
            }

            _ => Vec::new(),
        }
    }

    fn begin_cycle(&mut self) -> Vec<Effect> {
        self.state = SessionState::Loading;
        self.retry.play_attempts = 0;
        self.retry.engine_recreates = 0;
        vec![Effect::BeginLoad]
    }

    fn cooldown_elapsed(&self, now: Instant) -> bool {
        self.retry
            .last_recovery_at
            .map_or(true, |at| now.duration_since(at) >= self.policy.cooldown)
    }

    fn on_failure(&mut self, class: FailureClass, now: Instant) -> Vec<Effect> {
        use SessionState as S;

        if !matches!(class, FailureClass::BufferStall | FailureClass::Ignorable) {
            self.retry.last_error_at = Some(now);
            self.retry.last_failure = Some(class);
        }

        match class {
            FailureClass::RetryableNetwork => {
                if !self.cooldown_elapsed(now) {
                    return Vec::new();
                }
                self.retry.last_recovery_at = Some(now);
                vec![Effect::RestartEngineLoad]
            }
            FailureClass::NotFound => {
                self.state = S::Unavailable;
                vec![Effect::DestroyEngine]
            }
            FailureClass::MediaDecodeFatal => {
                // Shown as still loading either way; a later re-entry starts clean.
                self.state = S::Loading;
                if self.retry.engine_recreates < self.policy.max_engine_recreates
                    && self.cooldown_elapsed(now)
                {
                    self.retry.engine_recreates += 1;
                    self.retry.last_recovery_at = Some(now);
                    vec![Effect::RecreateEngine]
                } else {
                    vec![Effect::DestroyEngine]
                }
            }
            FailureClass::PlaybackAborted => self.retry_play().unwrap_or_default(),
            FailureClass::PlaybackNotAllowed => {
                self.state = S::AutoplayBlocked;
                Vec::new()
            }
            FailureClass::PlaybackFailed => match self.retry_play() {
                Some(effects) => effects,
                None => self.enter_errored(),
            },
            FailureClass::BufferStall | FailureClass::Ignorable => Vec::new(),
            FailureClass::UnclassifiedFatal => self.enter_errored(),
        }
    }

    fn retry_play(&mut self) -> Option<Vec<Effect>> {
        if self.retry.play_attempts >= self.policy.play_retry_limit {
            return None;
        }
        self.retry.play_attempts += 1;
        Some(vec![Effect::RequestPlay(StartTrigger::Retry(
            self.policy.play_retry_delay,
        ))])
    }

    fn enter_errored(&mut self) -> Vec<Effect> {
        self.state = SessionState::Errored;
        let mut effects = vec![Effect::Teardown];
        if let Some(delay) = self.policy.auto_retry {
            if self.retry.retry_attempt < self.policy.max_retries {
                effects.push(Effect::ScheduleRetry(delay.max(self.policy.cooldown)));
            }
        }
        effects
    }
}

fn teardown_if(holds_resources: bool) -> Vec<Effect> {
    if holds_resources {
        vec![Effect::Teardown]
    } else {
        Vec::new()
    }
}
