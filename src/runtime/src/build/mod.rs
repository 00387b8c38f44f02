//! Image build support.
//!
//! Provides recipe parsing, the layer executor, image assembly, and a
//! build engine that drives recipes through the layer cache.
//!
//! # Supported Instructions
//!
//! FROM, RUN, COPY, WORKDIR, ENV, ENTRYPOINT, CMD, EXPOSE, LABEL, USER, ARG

pub mod assembler;
pub mod context;
pub mod engine;
pub mod executor;
pub mod identity;
pub mod layer;
pub mod recipe;

pub use assembler::finalize;
pub use context::BuildContext;
pub use engine::{BuildEngine, BuildOptions, BuildReport, StepRecord};
pub use executor::{LayerExecutor, StepContext, StepInputs, StepOutput};
pub use layer::{derive_cache_key, Layer, LayerRecord};
pub use recipe::{parse, Instruction, Recipe, Step};
