// Source model and platform capabilities — descriptors, handles, stores, engines, elements.

pub mod descriptor;
pub mod handle;
pub mod memory_store;
pub mod traits;
