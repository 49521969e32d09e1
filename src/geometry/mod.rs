//! Per-frame geometry groups and their bottom-level BVHs.
//!
//! The extractor hands over one [`GeometryArrays`] per geometry class per
//! frame. Each non-empty array set becomes a [`GeometryGroup`]: four device
//! buffers plus a bottom-level BVH built, updated or rebuilt by
//! [`build_or_update`].

mod build;
mod extract;
mod matcher;

pub use build::{build_or_update, BuildDecision, BuildParams};
pub use extract::{extract_parallel, merge_parts};
pub use matcher::GeometrySlotMatcher;

use bytemuck::{Pod, Zeroable};

use crate::backend::{BuildFlags, GeometryBinding, InstanceFlags, RtBackend};
use crate::buffer_cache::DeviceBuffer;
use crate::util::{Error, Result};

/// Per-triangle material record read by the shading kernels (12 bytes).
///
/// The layout is a contract with the kernels; this crate only uploads it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable, PartialEq, Eq)]
pub struct TriangleAttributes {
    /// Texture index (low 12 bits) and alpha (high 4 bits).
    pub texture_alpha: u16,
    /// Fullbright texture index (low 12 bits) and surface flags.
    pub emissive_flags: u16,
    /// Octahedral vertex normal 0 and packed gloss.
    pub normal0_gloss: u32,
    /// Octahedral vertex normal 1 and brush/model id.
    pub normal1_id: u32,
}

/// Geometry class; selects default flags and the matching strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeometryClass {
    StaticOpaque,
    StaticTransparent,
    Dynamic,
}

impl GeometryClass {
    /// Static classes in binding order.
    pub const STATIC: [GeometryClass; 2] = [GeometryClass::StaticOpaque, GeometryClass::StaticTransparent];

    pub fn is_static(self) -> bool {
        !matches!(self, GeometryClass::Dynamic)
    }

    pub fn build_flags(self) -> BuildFlags {
        match self {
            GeometryClass::Dynamic => BuildFlags::PREFER_FAST_TRACE | BuildFlags::ALLOW_UPDATE,
            _ => BuildFlags::PREFER_FAST_TRACE,
        }
    }

    pub fn instance_flags(self) -> InstanceFlags {
        match self {
            GeometryClass::StaticOpaque => {
                InstanceFlags::TRIANGLE_FRONT_COUNTERCLOCKWISE | InstanceFlags::FORCE_OPAQUE
            }
            _ => InstanceFlags::TRIANGLE_FRONT_COUNTERCLOCKWISE,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            GeometryClass::StaticOpaque => "static_opaque",
            GeometryClass::StaticTransparent => "static_transparent",
            GeometryClass::Dynamic => "dynamic",
        }
    }
}

/// Triangle soup of one geometry group for one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeometryArrays {
    /// Packed xyz positions.
    pub positions: Vec<f32>,
    /// Positions of the same vertices in the previous frame (motion vectors).
    pub prev_positions: Vec<f32>,
    pub indices: Vec<u32>,
    /// One record per triangle.
    pub attributes: Vec<TriangleAttributes>,
}

impl GeometryArrays {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arrays of geometry that does not move: previous positions equal positions.
    pub fn stationary(positions: Vec<f32>, indices: Vec<u32>, attributes: Vec<TriangleAttributes>) -> Self {
        Self {
            prev_positions: positions.clone(),
            positions,
            indices,
            attributes,
        }
    }

    #[inline]
    pub fn vertex_count(&self) -> u32 {
        (self.positions.len() / 3) as u32
    }

    #[inline]
    pub fn primitive_count(&self) -> u32 {
        (self.indices.len() / 3) as u32
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Append `other`, rebasing its indices past the vertices already here.
    pub fn append(&mut self, other: &GeometryArrays) {
        let base = self.vertex_count();
        self.positions.extend_from_slice(&other.positions);
        self.prev_positions.extend_from_slice(&other.prev_positions);
        self.indices.extend(other.indices.iter().map(|&i| i + base));
        self.attributes.extend_from_slice(&other.attributes);
    }

    /// Check the array invariants before anything is uploaded.
    pub fn validate(&self) -> Result<()> {
        if self.positions.len() % 3 != 0 {
            return Err(Error::invalid_geometry(format!(
                "positions length {} is not a multiple of 3",
                self.positions.len()
            )));
        }
        if self.prev_positions.len() != self.positions.len() {
            return Err(Error::invalid_geometry(format!(
                "{} previous positions for {} positions",
                self.prev_positions.len(),
                self.positions.len()
            )));
        }
        if self.indices.len() % 3 != 0 {
            return Err(Error::invalid_geometry(format!(
                "index count {} is not a multiple of 3",
                self.indices.len()
            )));
        }
        if self.attributes.len() != self.indices.len() / 3 {
            return Err(Error::invalid_geometry(format!(
                "{} attribute records for {} triangles",
                self.attributes.len(),
                self.indices.len() / 3
            )));
        }
        if u32::try_from(self.positions.len()).is_err() || u32::try_from(self.indices.len()).is_err() {
            return Err(Error::invalid_geometry("array length exceeds u32"));
        }
        let vertex_count = self.vertex_count();
        if let Some(&bad) = self.indices.iter().find(|&&i| i >= vertex_count) {
            return Err(Error::invalid_geometry(format!(
                "index {bad} out of range for {vertex_count} vertices"
            )));
        }
        Ok(())
    }
}

/// Device-side geometry of one group with its bottom-level BVH.
///
/// Owned by the frame slot that built it.
pub struct GeometryGroup<B: RtBackend> {
    pub class: GeometryClass,
    pub vertex_count: u32,
    pub primitive_count: u32,
    pub vertices: DeviceBuffer<B>,
    pub prev_vertices: DeviceBuffer<B>,
    pub indices: DeviceBuffer<B>,
    pub attributes: DeviceBuffer<B>,
    pub blas: B::Blas,
    pub build_flags: BuildFlags,
    /// Frame of the last full build or rebuild.
    pub last_rebuild_iteration: u64,
    pub instance_flags: InstanceFlags,
}

impl<B: RtBackend> GeometryGroup<B> {
    #[inline]
    pub fn counts(&self) -> (u32, u32) {
        (self.vertex_count, self.primitive_count)
    }

    /// Frames since the last full build.
    #[inline]
    pub fn refit_age(&self, iteration: u64) -> u64 {
        iteration.saturating_sub(self.last_rebuild_iteration)
    }

    /// Buffers published for this group's binding index.
    pub fn binding(&self) -> GeometryBinding<'_, B> {
        GeometryBinding {
            vertices: self.vertices.raw(),
            prev_vertices: self.prev_vertices.raw(),
            indices: self.indices.raw(),
            attributes: self.attributes.raw(),
        }
    }
}

impl<B: RtBackend> std::fmt::Debug for GeometryGroup<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeometryGroup")
            .field("class", &self.class)
            .field("vertex_count", &self.vertex_count)
            .field("primitive_count", &self.primitive_count)
            .field("build_flags", &self.build_flags)
            .field("last_rebuild_iteration", &self.last_rebuild_iteration)
            .finish_non_exhaustive()
    }
}
