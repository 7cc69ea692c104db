// Integration tests for the PlaybackGuard.

mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use common::{advance, FakeElement};
use tile_stream_engine::config::PlaybackConfig;
use tile_stream_engine::engine::guard::{PlayReport, PlaybackGuard, StartOutcome, StartTrigger};
use tile_stream_engine::source::traits::{MediaElement, PlayError};

fn guard_for(element: &Arc<FakeElement>) -> (PlaybackGuard, Arc<Mutex<Vec<PlayReport>>>) {
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    let guard = PlaybackGuard::new(
        element.clone(),
        &PlaybackConfig::default(),
        Arc::new(move |report| sink.lock().push(report)),
    );
    (guard, reports)
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_outstanding_start() {
    let element = FakeElement::new();
    element.set_play_delay(Duration::from_millis(200));
    let (guard, reports) = guard_for(&element);

    guard.request_start(StartTrigger::Direct, 1);
    advance(10).await;
    assert_eq!(element.plays(), 1);

    guard.stop().await;
    assert_eq!(element.overlaps(), 0);
    assert!(element.is_paused());
    assert_eq!(element.pauses(), 1);

    advance(10).await;
    let reports = reports.lock();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].epoch, 1);
    assert_eq!(reports[0].result, Ok(StartOutcome::Started));
}

#[tokio::test(start_paused = true)]
async fn test_stop_supersedes_scheduled_start() {
    let element = FakeElement::new();
    let (guard, reports) = guard_for(&element);

    guard.request_start(StartTrigger::Retry(Duration::from_millis(500)), 3);
    advance(100).await;
    guard.stop().await;
    advance(1000).await;

    assert_eq!(element.plays(), 0);
    assert!(reports.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_back_to_back_starts_never_overlap() {
    let element = FakeElement::new();
    element.set_play_delay(Duration::from_millis(300));
    element.script([Err(PlayError::Aborted)]);
    let (guard, reports) = guard_for(&element);

    let (a, b) = tokio::join!(guard.start(), guard.start());
    assert_eq!(element.overlaps(), 0);
    assert_eq!(element.plays(), 2);
    assert_eq!(a, Err(PlayError::Aborted));
    assert_eq!(b, Ok(StartOutcome::Started));
    assert!(reports.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_buffer_ready_is_throttled() {
    let element = FakeElement::new();
    // Keep the element paused so only throttling can suppress a start.
    element.script([Err(PlayError::NotAllowed), Err(PlayError::NotAllowed)]);
    let (guard, reports) = guard_for(&element);

    guard.request_start(StartTrigger::BufferReady, 1);
    advance(150).await;
    assert_eq!(element.plays(), 1);

    guard.request_start(StartTrigger::BufferReady, 1);
    advance(500).await;
    assert_eq!(element.plays(), 1);

    advance(500).await;
    guard.request_start(StartTrigger::BufferReady, 1);
    advance(150).await;
    assert_eq!(element.plays(), 2);

    let reports = reports.lock();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.result == Err(PlayError::NotAllowed)));
}

#[tokio::test(start_paused = true)]
async fn test_start_skipped_while_playing() {
    let element = FakeElement::new();
    element.set_playing();
    let (guard, reports) = guard_for(&element);

    guard.request_start(StartTrigger::BufferReady, 1);
    guard.request_start(StartTrigger::Direct, 2);
    advance(200).await;

    assert_eq!(element.plays(), 0);
    let reports = reports.lock();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].epoch, 2);
    assert_eq!(reports[0].result, Ok(StartOutcome::AlreadyPlaying));
}
