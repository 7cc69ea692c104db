// Engine orchestration — session lifecycle, load coordination and playback pacing.

pub mod cache;
pub mod coordinator;
pub mod fault;
pub mod guard;
pub mod session;
pub mod state;
pub mod stats;
pub mod viewport;
