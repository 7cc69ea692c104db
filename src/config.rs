use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Deserialize;

/// Maximum number of local-media loads in flight across all tiles.
pub const MAX_CONCURRENT_LOADS: usize = 2;

/// Number of decoded local handles kept for reuse across tiles.
pub const HANDLE_CACHE_CAPACITY: usize = 5;

/// Delay before a freed load slot is handed to the next queued request.
pub const LOAD_STAGGER_MS: u64 = 500;

/// A raw visibility flip must hold this long before it is acted on.
pub const VISIBILITY_DEBOUNCE_MS: u64 = 300;

/// Minimum spacing between buffer-triggered play attempts.
pub const PLAY_THROTTLE_MS: u64 = 1000;

/// Coalescing window for buffer-triggered play attempts.
pub const PLAY_DEBOUNCE_MS: u64 = 100;

/// Buffered lookahead required before a remote stream is asked to play.
pub const MIN_BUFFER_AHEAD_SECS: f64 = 2.0;

/// Number of times a failed or aborted play request is re-issued.
pub const PLAY_RETRY_LIMIT: u32 = 2;

/// Delay before re-issuing a failed play request.
pub const PLAY_RETRY_DELAY_MS: u64 = 500;

/// Two recovery attempts for one session are never closer than this.
pub const RECOVERY_COOLDOWN_MS: u64 = 1000;

/// Ceiling on user-visible session retries after an unclassified failure.
pub const MAX_SESSION_RETRIES: u32 = 3;

/// Ceiling on engine recreations after decode failures within one cycle.
pub const MAX_ENGINE_RECREATES: u32 = 2;

/// MIME type probed on the element for native adaptive playback.
pub const ADAPTIVE_MIME_TYPE: &str = "application/vnd.apple.mpegurl";

/// Top-level configuration for the tile engine.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TileConfig {
    pub loads: LoadConfig,
    pub viewport: ViewportConfig,
    pub playback: PlaybackConfig,
    pub recovery: RecoveryConfig,
    pub stream_engine: EngineTuning,
}

impl TileConfig {
    /// Parse a (possibly partial) JSON document; missing fields keep their defaults.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: TileConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.loads.max_concurrent_loads == 0 {
            return Err(anyhow!("max_concurrent_loads must be > 0"));
        }
        if self.loads.cache_capacity == 0 {
            return Err(anyhow!("cache_capacity must be > 0"));
        }
        if self.playback.min_buffer_ahead_secs < 0.0 {
            return Err(anyhow!("min_buffer_ahead_secs must not be negative"));
        }
        Ok(())
    }
}

/// Local-media load budget and handle cache sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    pub max_concurrent_loads: usize,
    pub cache_capacity: usize,
    pub stagger_ms: u64,
}

impl LoadConfig {
    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_loads: MAX_CONCURRENT_LOADS,
            cache_capacity: HANDLE_CACHE_CAPACITY,
            stagger_ms: LOAD_STAGGER_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ViewportConfig {
    pub debounce_ms: u64,
    /// Margin around the viewport, so tiles start loading slightly before they scroll in.
    pub root_margin_px: u32,
    /// Fraction of the tile that must intersect to count as visible.
    pub threshold: f32,
}

impl ViewportConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            debounce_ms: VISIBILITY_DEBOUNCE_MS,
            root_margin_px: 50,
            threshold: 0.1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub throttle_ms: u64,
    pub debounce_ms: u64,
    pub min_buffer_ahead_secs: f64,
    pub retry_limit: u32,
    pub retry_delay_ms: u64,
}

impl PlaybackConfig {
    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn min_buffer_ahead(&self) -> Duration {
        Duration::from_secs_f64(self.min_buffer_ahead_secs)
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            throttle_ms: PLAY_THROTTLE_MS,
            debounce_ms: PLAY_DEBOUNCE_MS,
            min_buffer_ahead_secs: MIN_BUFFER_AHEAD_SECS,
            retry_limit: PLAY_RETRY_LIMIT,
            retry_delay_ms: PLAY_RETRY_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub cooldown_ms: u64,
    pub max_retries: u32,
    pub max_engine_recreates: u32,
    /// When set, an errored session retries on its own after this delay
    /// (still bounded by `max_retries`). Manual retry only when unset.
    pub auto_retry_ms: Option<u64>,
}

impl RecoveryConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn auto_retry(&self) -> Option<Duration> {
        self.auto_retry_ms.map(Duration::from_millis)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: RECOVERY_COOLDOWN_MS,
            max_retries: MAX_SESSION_RETRIES,
            max_engine_recreates: MAX_ENGINE_RECREATES,
            auto_retry_ms: None,
        }
    }
}

/// Knobs handed to the adaptive-bitrate engine when a session creates one.
///
/// The engine owns its own manifest/fragment retry loop; these bound it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineTuning {
    pub enable_worker: bool,
    pub manifest_max_retry: u32,
    pub manifest_retry_delay_ms: u64,
    pub manifest_max_retry_timeout_ms: u64,
    pub fragment_max_retry: u32,
    pub fragment_retry_delay_ms: u64,
    pub fragment_timeout_ms: u64,
    pub live_sync_duration_count: u32,
    pub live_max_latency_duration_count: u32,
    pub live_back_buffer_secs: u32,
    pub max_buffer_secs: u32,
    pub max_max_buffer_secs: u32,
    pub max_buffer_bytes: u64,
    pub max_buffer_hole_secs: f64,
    pub low_latency: bool,
    /// Seconds from the live edge to start at; negative means engine default.
    pub start_position: f64,
    pub high_buffer_watchdog_secs: u32,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            enable_worker: false,
            manifest_max_retry: 10,
            manifest_retry_delay_ms: 1000,
            manifest_max_retry_timeout_ms: 30_000,
            fragment_max_retry: 6,
            fragment_retry_delay_ms: 1000,
            fragment_timeout_ms: 20_000,
            live_sync_duration_count: 3,
            live_max_latency_duration_count: 15,
            live_back_buffer_secs: 60,
            max_buffer_secs: 60,
            max_max_buffer_secs: 120,
            max_buffer_bytes: 120 * 1000 * 1000, // 120 MB
            max_buffer_hole_secs: 1.0,
            low_latency: false,
            start_position: -1.0,
            high_buffer_watchdog_secs: 3,
        }
    }
}
