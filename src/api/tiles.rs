use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::config::TileConfig;
use crate::engine::coordinator::ResourceLoadCoordinator;
use crate::engine::session::{SessionDeps, SessionHandle, StreamSession};
use crate::engine::stats::LoadStatsSnapshot;
use crate::engine::viewport::ViewportTracker;
use crate::source::descriptor::SourceDescriptor;
use crate::source::traits::{LocalHandleStore, MediaElement, StreamEngineFactory, VisibilityHost};

/// Entry point for a tiled surface: one coordinator shared by every mounted tile.
pub struct TileEngine {
    deps: SessionDeps,
    tracker: ViewportTracker,
    visibility: Arc<dyn VisibilityHost>,
}

impl TileEngine {
    /// Validate the config and build the shared coordinator. Must be called
    /// inside a tokio runtime.
    pub fn init(
        config: TileConfig,
        store: Arc<dyn LocalHandleStore>,
        engines: Arc<dyn StreamEngineFactory>,
        visibility: Arc<dyn VisibilityHost>,
    ) -> Result<Self> {
        config.validate()?;
        let coordinator = ResourceLoadCoordinator::init(&config.loads, store);
        let tracker = ViewportTracker::new(&config.viewport);
        info!(
            "tile engine ready: max_loads={} cache_capacity={}",
            config.loads.max_concurrent_loads, config.loads.cache_capacity
        );
        Ok(Self {
            deps: SessionDeps {
                coordinator,
                engines,
                config: Arc::new(config),
            },
            tracker,
            visibility,
        })
    }

    /// Mount a tile. `tile_id` names the element on the visibility host.
    pub fn mount(
        &self,
        tile_id: &str,
        descriptor: Option<SourceDescriptor>,
        element: Arc<dyn MediaElement>,
    ) -> SessionHandle {
        let visibility = self.tracker.observe(self.visibility.as_ref(), tile_id);
        StreamSession::spawn(tile_id, descriptor, element, visibility, self.deps.clone())
    }

    pub fn load_stats(&self) -> LoadStatsSnapshot {
        self.deps.coordinator.stats()
    }

    pub fn coordinator(&self) -> &Arc<ResourceLoadCoordinator> {
        &self.deps.coordinator
    }

    pub fn config(&self) -> &TileConfig {
        &self.deps.config
    }

    /// Reject queued and in-flight loads and revoke every cached handle.
    pub fn shutdown(&self) {
        self.deps.coordinator.shutdown();
        info!("tile engine shut down");
    }
}
