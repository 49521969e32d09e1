//! Spatial hash grids backing the path guiding and light caches.
//!
//! The ray tracing kernels accumulate statistics in three large flat arrays
//! indexed by a spatial hash. This crate holds the parts of that contract the
//! host needs to agree on with the kernels:
//!
//! - [`records`] - the POD record layouts (std430-compatible, zero = empty)
//! - [`hash`] - cell quantization and hashing of world positions
//! - [`light_cache`] - host reference of the optimistic light cache update

pub mod hash;
pub mod light_cache;
pub mod records;

pub use hash::{AdaptiveGrid, CellKey, MAX_LEVELS};
pub use light_cache::{AtomicLightCacheVertex, UpdateOutcome};
pub use records::{
    DirectionalGuideState, DistanceGuideState, LightCacheVertex, MAX_DISTANCE_STATES_PER_VERTEX,
};
