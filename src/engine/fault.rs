// Failure classification — maps engine, element and store errors onto recovery classes.

use super::coordinator::AcquireError;
use crate::source::traits::{EngineError, EngineErrorDetails, EngineErrorKind, PlayError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Transient manifest/fragment failure; restart loading after the cooldown.
    RetryableNetwork,
    /// The resource does not exist (404 class). Never retried automatically.
    NotFound,
    /// Unrecoverable decode or internal engine state; recreate the engine.
    MediaDecodeFatal,
    /// A start was interrupted by a concurrent stop.
    PlaybackAborted,
    /// The platform blocked autoplay. Benign.
    PlaybackNotAllowed,
    /// A start failed for any other reason.
    PlaybackFailed,
    /// Playback is waiting on data; nothing to do but wait.
    BufferStall,
    /// Non-fatal noise the engine recovers from on its own.
    Ignorable,
    UnclassifiedFatal,
}

impl FailureClass {
    /// Whether the hosting UI should be told about this failure directly.
    pub fn is_surfaced(self) -> bool {
        matches!(self, FailureClass::UnclassifiedFatal)
    }
}

const HTTP_NOT_FOUND: u16 = 404;

pub fn classify_engine_error(error: &EngineError) -> FailureClass {
    if error.details == EngineErrorDetails::InternalException {
        return FailureClass::MediaDecodeFatal;
    }
    if error.http_status == Some(HTTP_NOT_FOUND) {
        return FailureClass::NotFound;
    }
    if error.fatal {
        return match error.kind {
            EngineErrorKind::Network => FailureClass::RetryableNetwork,
            EngineErrorKind::Media => FailureClass::MediaDecodeFatal,
            EngineErrorKind::Other => FailureClass::UnclassifiedFatal,
        };
    }
    match error.details {
        EngineErrorDetails::ManifestLoadTimeOut => FailureClass::RetryableNetwork,
        EngineErrorDetails::BufferStalledError => FailureClass::BufferStall,
        _ => FailureClass::Ignorable,
    }
}

pub fn classify_play_error(error: &PlayError) -> FailureClass {
    match error {
        PlayError::Aborted => FailureClass::PlaybackAborted,
        PlayError::NotAllowed => FailureClass::PlaybackNotAllowed,
        PlayError::Failed(_) => FailureClass::PlaybackFailed,
    }
}

pub fn classify_acquire_error(error: &AcquireError) -> FailureClass {
    match error {
        AcquireError::NotFound(_) => FailureClass::NotFound,
        AcquireError::Store(_) => FailureClass::UnclassifiedFatal,
        AcquireError::ShutDown => FailureClass::Ignorable,
    }
}
