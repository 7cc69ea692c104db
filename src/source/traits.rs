use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use super::handle::MediaHandle;
use crate::config::EngineTuning;

/// A stored recording as returned by the local object store.
#[derive(Debug, Clone)]
pub struct RawMedia {
    pub bytes: Bytes,
    pub content_type: String,
    pub name: Option<String>,
}

/// Persistent local object store holding recorded media.
#[async_trait]
pub trait LocalHandleStore: Send + Sync {
    /// Fetch the stored object for `key`; `Ok(None)` when the key is absent.
    async fn get_by_key(&self, key: &str) -> Result<Option<RawMedia>>;

    /// Store a new object and return the key it was assigned.
    async fn put(&self, media: RawMedia) -> Result<String>;
}

/// Failure of a media element's `play()` request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlayError {
    /// The request was interrupted by a concurrent pause or source change.
    #[error("play request aborted")]
    Aborted,
    /// The platform refused to start playback without a user gesture.
    #[error("autoplay not allowed")]
    NotAllowed,
    #[error("play failed: {0}")]
    Failed(String),
}

/// What a media element is currently pointed at.
#[derive(Debug, Clone)]
pub enum ElementSource {
    Handle(MediaHandle),
    Locator(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementEvent {
    Playing,
    Waiting,
    Stalled,
    CanPlay,
}

/// The platform media element a tile renders into.
#[async_trait]
pub trait MediaElement: Send + Sync {
    /// Begin playback; resolves once playback has started or was refused.
    async fn play(&self) -> Result<(), PlayError>;

    fn pause(&self);

    fn is_paused(&self) -> bool;

    /// `None` clears the element.
    fn set_source(&self, source: Option<ElementSource>);

    /// Seconds buffered past the current playhead, `None` if nothing is buffered.
    fn buffered_ahead(&self) -> Option<Duration>;

    fn can_play_type(&self, _mime: &str) -> bool {
        false
    }

    fn subscribe(&self) -> broadcast::Receiver<ElementEvent>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    Network,
    Media,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineErrorDetails {
    ManifestLoadError,
    ManifestLoadTimeOut,
    FragLoadError,
    BufferStalledError,
    InternalException,
    Other(String),
}

/// Error report raised by the adaptive-bitrate engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?} engine error ({details:?}), fatal={fatal}, status={http_status:?}")]
pub struct EngineError {
    pub fatal: bool,
    pub kind: EngineErrorKind,
    pub details: EngineErrorDetails,
    pub http_status: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    ManifestParsed,
    FragmentBuffered,
    Error(EngineError),
}

/// Callback sink an engine reports its events into.
#[derive(Clone)]
pub struct EngineEvents {
    sink: Arc<dyn Fn(EngineEvent) + Send + Sync>,
}

impl EngineEvents {
    pub fn new(sink: impl Fn(EngineEvent) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    pub fn emit(&self, event: EngineEvent) {
        (self.sink)(event)
    }
}

/// One adaptive-bitrate engine instance bound to one media element.
pub trait StreamEngine: Send + Sync {
    fn load_source(&self, locator: &str) -> Result<()>;
    fn attach_media(&self, element: Arc<dyn MediaElement>) -> Result<()>;
    /// Restart manifest/fragment loading after a network failure.
    fn start_load(&self);
    fn destroy(&self);
}

pub trait StreamEngineFactory: Send + Sync {
    /// Whether the platform can run the engine at all.
    fn is_supported(&self) -> bool {
        true
    }

    fn create(&self, tuning: &EngineTuning, events: EngineEvents) -> Result<Box<dyn StreamEngine>>;
}

/// Options forwarded to the platform intersection primitive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntersectionOptions {
    pub root_margin_px: u32,
    pub threshold: f32,
}

/// Platform primitive reporting raw (undebounced) viewport intersection.
pub trait VisibilityHost: Send + Sync {
    fn observe(&self, element: &str, options: &IntersectionOptions) -> mpsc::UnboundedReceiver<bool>;
}
