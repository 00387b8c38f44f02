//! Strata Runtime - image build engine implementation.
//!
//! This crate provides recipe parsing, the content-addressed layer cache,
//! the layer executor and its sandboxes, image assembly and storage, and
//! named volume management.

#![allow(clippy::result_large_err)]

pub mod build;
pub mod cache;
pub mod digest;
pub mod fs;
pub mod image;
pub mod metrics;
pub mod run;
pub mod sandbox;
pub mod volume;

// Re-export common types
pub use build::{finalize, parse, BuildContext, BuildEngine, BuildOptions, BuildReport, StepRecord};
pub use build::{Instruction, Layer, LayerExecutor, Recipe, Step};
pub use cache::{LayerCache, LayerStore};
pub use digest::{CacheKey, ImageId, LayerId};
pub use fs::{Change, FsDiff, Node, NodeKind, Snapshot};
pub use image::{BaseImage, ChainRegistry, ImageRegistry, MemoryRegistry, StoreRegistry};
pub use image::{Image, ImageConfig, ImageStore, PortSpec, Protocol, ResolvedUser};
pub use metrics::{BuildMetrics, MetricsCollector};
pub use run::{PreparedRun, RunPreparer};
pub use sandbox::{ChrootSandbox, ExecOutcome, RunRequest, Sandbox};
pub use volume::{Attachment, ChownApplier, OwnershipApplier, RecordingApplier, VolumeManager, VolumeStore};

/// Strata Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
