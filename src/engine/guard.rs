// Playback guard — serializes start/stop on one media element and paces start requests.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::PlaybackConfig;
use crate::source::traits::{MediaElement, PlayError};

/// Why a start is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartTrigger {
    /// Source just attached; start right away.
    Direct,
    /// Enough buffer observed. Throttled and debounced.
    BufferReady,
    /// Re-issue after a failed start, once the delay passes.
    Retry(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyPlaying,
    /// A stop arrived before this start reached the element.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayReport {
    pub epoch: u64,
    pub trigger: StartTrigger,
    pub result: Result<StartOutcome, PlayError>,
}

pub type PlayReporter = Arc<dyn Fn(PlayReport) + Send + Sync>;

struct GuardInner {
    element: Arc<dyn MediaElement>,
    /// Held for the whole life of an issued start, so every later operation
    /// waits for it to settle first.
    op: tokio::sync::Mutex<()>,
    throttle: Duration,
    debounce: Duration,
    last_attempt: Mutex<Option<Instant>>,
    scheduled: Mutex<Option<CancellationToken>>,
    reporter: PlayReporter,
}

/// Wraps a media element so no start or stop is issued while a previous
/// start is still unresolved.
#[derive(Clone)]
pub struct PlaybackGuard {
    inner: Arc<GuardInner>,
}

impl PlaybackGuard {
    pub fn new(element: Arc<dyn MediaElement>, config: &PlaybackConfig, reporter: PlayReporter) -> Self {
        Self {
            inner: Arc::new(GuardInner {
                element,
                op: tokio::sync::Mutex::new(()),
                throttle: config.throttle(),
                debounce: config.debounce(),
                last_attempt: Mutex::new(None),
                scheduled: Mutex::new(None),
                reporter,
            }),
        }
    }

    /// Issue a start now, after any outstanding start settles.
    pub async fn start(&self) -> Result<StartOutcome, PlayError> {
        self.start_unless(None).await
    }

    async fn start_unless(&self, token: Option<&CancellationToken>) -> Result<StartOutcome, PlayError> {
        let _op = self.inner.op.lock().await;
        if token.map_or(false, |t| t.is_cancelled()) {
            return Ok(StartOutcome::Superseded);
        }
        if !self.inner.element.is_paused() {
            trace!("start skipped: element already playing");
            return Ok(StartOutcome::AlreadyPlaying);
        }
        *self.inner.last_attempt.lock() = Some(Instant::now());
        self.inner.element.play().await?;
        Ok(StartOutcome::Started)
    }

    /// Cancel scheduled starts, wait for an outstanding one, then pause.
    pub async fn stop(&self) {
        self.cancel_scheduled();
        let _op = self.inner.op.lock().await;
        self.inner.element.pause();
    }

    /// Schedule a start and report its outcome tagged with `epoch`.
    ///
    /// A newer request supersedes a still-scheduled older one. Buffer-ready
    /// requests are dropped while the element plays or within the throttle
    /// window of the last attempt.
    pub fn request_start(&self, trigger: StartTrigger, epoch: u64) {
        let delay = match trigger {
            StartTrigger::Direct => Duration::ZERO,
            StartTrigger::Retry(delay) => delay,
            StartTrigger::BufferReady => {
                if !self.inner.element.is_paused() {
                    trace!("buffer-ready start skipped: already playing");
                    return;
                }
                let now = Instant::now();
                let mut last = self.inner.last_attempt.lock();
                if let Some(at) = *last {
                    if now.duration_since(at) < self.inner.throttle {
                        trace!("buffer-ready start throttled");
                        return;
                    }
                }
                *last = Some(now);
                self.inner.debounce
            }
        };

        let token = CancellationToken::new();
        if let Some(previous) = self.inner.scheduled.lock().replace(token.clone()) {
            previous.cancel();
        }

        let guard = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => return,
                }
            }
            let result = guard.start_unless(Some(&token)).await;
            debug!("start ({:?}) finished: {:?}", trigger, result);
            (guard.inner.reporter)(PlayReport {
                epoch,
                trigger,
                result,
            });
        });
    }

    pub fn cancel_scheduled(&self) {
        if let Some(token) = self.inner.scheduled.lock().take() {
            token.cancel();
        }
    }

    pub fn element(&self) -> &Arc<dyn MediaElement> {
        &self.inner.element
    }
}
