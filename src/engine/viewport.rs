// Viewport tracking — debounces raw intersection flips into stable visibility changes.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

use crate::config::ViewportConfig;
use crate::source::traits::{IntersectionOptions, VisibilityHost};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibilityChange {
    pub visible: bool,
}

pub struct ViewportTracker {
    debounce: Duration,
    options: IntersectionOptions,
}

impl ViewportTracker {
    pub fn new(config: &ViewportConfig) -> Self {
        Self {
            debounce: config.debounce(),
            options: IntersectionOptions {
                root_margin_px: config.root_margin_px,
                threshold: config.threshold,
            },
        }
    }

    /// Start observing `element` on the host.
    pub fn observe(&self, host: &dyn VisibilityHost, element: &str) -> VisibilityStream {
        self.track(host.observe(element, &self.options))
    }

    /// Debounce an already-open raw signal.
    ///
    /// A value is emitted only after it has held for the debounce window and
    /// differs from the last emitted one. Tiles start hidden.
    pub fn track(&self, mut raw: mpsc::UnboundedReceiver<bool>) -> VisibilityStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let debounce = self.debounce;

        let task = tokio::spawn(async move {
            let mut settled = false;
            let mut pending: Option<(bool, Instant)> = None;

            loop {
                let deadline = pending.map(|(_, at)| at);
                tokio::select! {
                    flip = raw.recv() => match flip {
                        Some(visible) if visible == settled => {
                            if pending.take().is_some() {
                                trace!("visibility flipped back to {} inside window", visible);
                            }
                        }
                        // A repeated flip to the pending value restarts the window.
                        Some(visible) => pending = Some((visible, Instant::now() + debounce)),
                        None => break,
                    },
                    _ = async {
                        match deadline {
                            Some(at) => tokio::time::sleep_until(at).await,
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        if let Some((visible, _)) = pending.take() {
                            settled = visible;
                            if tx.send(VisibilityChange { visible }).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });

        VisibilityStream { rx, task }
    }
}

/// Stable visibility changes for one tile. Stops observing when dropped.
pub struct VisibilityStream {
    rx: mpsc::UnboundedReceiver<VisibilityChange>,
    task: JoinHandle<()>,
}

impl VisibilityStream {
    pub async fn next(&mut self) -> Option<VisibilityChange> {
        self.rx.recv().await
    }
}

impl Drop for VisibilityStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}
