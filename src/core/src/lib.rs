//! Strata Core - Foundational Types and Abstractions
//!
//! This crate provides the error taxonomy, configuration, logging setup,
//! build events, and volume/run types shared by the Strata build engine.

pub mod config;
pub mod error;
pub mod event;
pub mod log;
pub mod run;
pub mod volume;

// Re-export commonly used types
pub use config::{BuildSettings, CacheConfig, EngineConfig, VolumeSettings};
pub use error::{Result, StrataError};
pub use event::{EventEmitter, StrataEvent};
pub use log::{LogConfig, LogFormat, LogLevel};
pub use run::{ContainerRunConfig, VolumeMount};
pub use volume::{AttachmentRecord, Ownership, OwnershipPolicy, VolumeRecord};

/// Strata version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
