//! # rtaccel
//!
//! Per-frame manager for ray tracing acceleration structures and the GPU
//! buffers behind them.
//!
//! Every frame the engine hands over triangle soups per geometry class. The
//! crate decides, per group, whether to build, refit or rebuild its
//! bottom-level BVH, assembles the top-level BVH, publishes a binding table
//! and keeps the hash-grid cache buffers the shading kernels accumulate into
//! across frames. Frames in flight are isolated in a ring of slots so no
//! frame writes memory an earlier frame still reads.
//!
//! ## Modules
//!
//! - [`util`] - Errors and math helpers
//! - [`backend`] - [`RtBackend`] seam with host and wgpu implementations
//! - [`buffer_cache`] - Grow-only device buffer reuse
//! - [`geometry`] - Geometry groups, build decisions, slot matching, extraction
//! - [`frame`] - Ring of per-frame slots
//! - [`top_level`] - Instance list and top-level BVH assembly
//! - [`persistent_cache`] - Hash-grid cache buffers and their run lifecycle
//! - [`textures`] - Texture registry with per-slot rebinding
//! - [`events`] - Engine event interface
//! - [`config`] - Persistent configuration
//!
//! ## Example
//!
//! ```ignore
//! use rtaccel::prelude::*;
//!
//! let mut accel = SceneAccelerator::new(HostBackend::new(), AccelConfig::default())?;
//! let out = accel.render_frame(FrameInput {
//!     world_loaded: true,
//!     dynamic: arrays,
//!     ..Default::default()
//! })?;
//! if let FrameOutput::Scene(scene) = out {
//!     let tlas = accel.slot(scene.slot).and_then(|s| s.tlas());
//! }
//! ```

pub mod util;
pub mod backend;
pub mod buffer_cache;
pub mod geometry;
pub mod frame;
pub mod top_level;
pub mod persistent_cache;
pub mod textures;
pub mod events;
pub mod config;
mod accelerator;

pub use accelerator::{AccelStats, FrameInput, FrameOutput, SceneAccelerator, SceneFrame, StaticGeometry};
pub use backend::{HostBackend, RtBackend};
#[cfg(feature = "gpu")]
pub use backend::WgpuBackend;
pub use config::{AccelConfig, CacheConfig};
pub use events::{EngineAdapter, EngineEvents};
pub use util::{Error, Result};

/// RFC 3339 build time, pinned by `SOURCE_DATE_EPOCH` when set.
pub const BUILD_STAMP: &str = env!("RTACCEL_BUILD_STAMP");
/// Cargo profile the crate was built with.
pub const BUILD_PROFILE: &str = env!("RTACCEL_BUILD_PROFILE");
/// Comma-separated backends compiled in.
pub const BACKENDS: &str = env!("RTACCEL_BACKENDS");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::accelerator::{FrameInput, FrameOutput, SceneAccelerator, SceneFrame, StaticGeometry};
    pub use crate::backend::{HostBackend, RtBackend};
    pub use crate::config::{AccelConfig, CacheConfig};
    pub use crate::events::{EngineAdapter, EngineEvents};
    pub use crate::geometry::{GeometryArrays, GeometryClass, TriangleAttributes};
    pub use crate::util::{Error, Result};
}
