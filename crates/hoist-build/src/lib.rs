//! Image assembly for hoist: layers, assembly, runtime configuration.
//!
//! # Build pipeline
//!
//! ```text
//! hoist build
//!   1. Context    ── git ls-files → BuildContext (digests for copy stages)
//!   2. Resolve    ── Resolver → DependencySet
//!   3. Plan       ── PipelinePlan::from_config() → PipelinePlan
//!   4. Assemble   ── LayerBuilder::apply() per stage through a StageBackend
//!   5. Seal       ── RuntimeConfigurator::configure() → ImageManifest (JSON)
//! ```
//!
//! # Snapshots and caching
//!
//! Each stage consumes the current [`FilesystemSnapshot`] and yields its
//! successor. Cacheable stages are keyed by the parent snapshot digest and
//! the stage cache key, so an unchanged prefix of the pipeline is replayed
//! from the [`LayerCache`] instead of executed.

pub mod assembler;
pub mod backend;
pub mod cache;
pub mod configurator;
pub mod context;
pub mod dockerfile;
pub mod eject;
pub mod layer;
pub mod manifest;
pub mod pipeline;
pub mod snapshot;

pub use assembler::{AssembleError, ImageAssembler, Phase, PipelinePlan, PlannedStage};
pub use backend::{BackendError, HostBackend, StageBackend};
pub use cache::{CacheError, LayerCache};
pub use configurator::{ConfigOverlay, ConfigureError, RuntimeConfigurator};
pub use context::{BuildContext, ContextError};
pub use dockerfile::DockerfileGenerator;
pub use layer::{LayerBuilder, LayerError};
pub use manifest::{ImageManifest, LayerRecord, ManifestError};
pub use pipeline::{PipelineError, PipelineState};
pub use snapshot::{Changes, Entry, FilesystemSnapshot, SnapshotDelta};
