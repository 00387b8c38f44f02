//! Volume management for persistent named volumes.
//!
//! Provides `VolumeStore` for persisting volume state and data
//! directories, and `VolumeManager` for the attach/detach lifecycle.

mod manager;
mod ownership;
mod store;

pub use manager::{Attachment, VolumeManager};
pub use ownership::{ChownApplier, OwnershipApplier, RecordingApplier};
pub use store::VolumeStore;
