//! Layer caching.
//!
//! Provides two pieces:
//! - `LayerCache`: in-memory LRU arena with single-flight fills and pins
//! - `LayerStore`: content-addressed layer records on disk

pub mod layer_cache;
pub mod layer_store;

pub use layer_cache::LayerCache;
pub use layer_store::LayerStore;
