pub mod logging;
pub mod tiles;
