//! Ray tracing backend seam.
//!
//! The decision layer never talks to a graphics API directly. Everything it
//! needs from the device (buffers, barriers, bottom/top-level BVHs, binding
//! tables, textures, fences) goes through [`RtBackend`].
//!
//! Two implementations ship with the crate:
//! - [`HostBackend`] - host memory emulation with a command log and hazard
//!   tracking, used by the tests and the `rtaccel-sim` binary
//! - [`WgpuBackend`] - wgpu buffers and driver-built acceleration structures
//!   (feature `gpu`)

pub mod host;
#[cfg(feature = "gpu")]
pub mod gpu;

pub use host::{HostBackend, HostCommand, HostStats};
#[cfg(feature = "gpu")]
pub use gpu::WgpuBackend;

use std::fmt;

use bytemuck::{Pod, Zeroable};

use crate::util::{Result, TransformRows};

bitflags::bitflags! {
    /// Buffer usage bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Shader storage read.
        const STORAGE = 1 << 0;
        /// Vertex or index input of a bottom-level build.
        const ACCEL_INPUT = 1 << 1;
        /// Destination of uploads and clears.
        const TRANSFER_DST = 1 << 2;
        /// Exposes a device address.
        const DEVICE_ADDRESS = 1 << 3;
        /// [`AccelInstance`] records read by a top-level build.
        const INSTANCE_INPUT = 1 << 4;
    }
}

bitflags::bitflags! {
    /// Bottom-level BVH build flags (Vulkan bit values).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BuildFlags: u32 {
        const ALLOW_UPDATE = 1 << 0;
        const ALLOW_COMPACTION = 1 << 1;
        const PREFER_FAST_TRACE = 1 << 2;
        const PREFER_FAST_BUILD = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Top-level instance flags (Vulkan bit values, 8 bits on the wire).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InstanceFlags: u32 {
        const TRIANGLE_FACING_CULL_DISABLE = 1 << 0;
        const TRIANGLE_FRONT_COUNTERCLOCKWISE = 1 << 1;
        const FORCE_OPAQUE = 1 << 2;
        const FORCE_NO_OPAQUE = 1 << 3;
    }
}

/// Pipeline stage used as barrier source/destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Host writes.
    Host,
    /// Copies and clears.
    Transfer,
    /// BVH builds and refits.
    AccelBuild,
    /// Shader reads and writes (ray tracing and compute).
    Shader,
    /// Everything; used before a buffer whose last consumer is unknown.
    All,
}

/// Bottom-level build operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildMode {
    /// First build of a BVH object.
    Build,
    /// Refit the existing tree to moved vertices, topology unchanged.
    Update,
    /// Full rebuild into the existing BVH object.
    Rebuild,
}

/// Top-level build operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlasMode {
    Build,
    Refit,
}

/// Inputs of a bottom-level build.
pub struct BlasGeometry<'a, B: RtBackend + ?Sized> {
    /// Packed xyz f32 positions.
    pub vertices: &'a B::Buffer,
    pub vertex_count: u32,
    /// u32 triangle indices.
    pub indices: &'a B::Buffer,
    pub primitive_count: u32,
}

/// Buffers published for one geometry index of a binding table.
pub struct GeometryBinding<'a, B: RtBackend + ?Sized> {
    pub vertices: &'a B::Buffer,
    pub prev_vertices: &'a B::Buffer,
    pub indices: &'a B::Buffer,
    pub attributes: &'a B::Buffer,
}

impl<B: RtBackend + ?Sized> GeometryBinding<'_, B> {
    /// All four bindings pointing at the same placeholder buffer.
    pub fn dummy(buffer: &B::Buffer) -> GeometryBinding<'_, B> {
        GeometryBinding {
            vertices: buffer,
            prev_vertices: buffer,
            indices: buffer,
            attributes: buffer,
        }
    }
}

/// Sizes of a binding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingLayout {
    pub max_geometries: u32,
    pub max_textures: u32,
}

/// Top-level instance record, Vulkan `VkAccelerationStructureInstanceKHR` layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, PartialEq)]
pub struct AccelInstance {
    /// Row-major 3x4 object-to-world transform.
    pub transform: TransformRows,
    /// Custom index (low 24 bits) | mask (high 8 bits).
    pub custom_index_and_mask: u32,
    /// SBT record offset (low 24 bits) | instance flags (high 8 bits).
    pub sbt_offset_and_flags: u32,
    /// Device address of the bottom-level BVH.
    pub blas_address: u64,
}

impl AccelInstance {
    pub fn new(
        transform: TransformRows,
        custom_index: u32,
        mask: u8,
        flags: InstanceFlags,
        blas_address: u64,
    ) -> Self {
        Self {
            transform,
            custom_index_and_mask: (custom_index & 0x00FF_FFFF) | ((mask as u32) << 24),
            sbt_offset_and_flags: (flags.bits() & 0xFF) << 24,
            blas_address,
        }
    }

    #[inline]
    pub fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & 0x00FF_FFFF
    }

    #[inline]
    pub fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }

    #[inline]
    pub fn flags(&self) -> InstanceFlags {
        InstanceFlags::from_bits_truncate(self.sbt_offset_and_flags >> 24)
    }
}

/// Everything the decision layer needs from a ray tracing device.
///
/// Commands are recorded in order into the backend's current submission;
/// `submit` closes it and returns a fence. Nothing blocks except `wait`.
pub trait RtBackend {
    type Buffer: Clone + fmt::Debug;
    type Texture;
    type Blas;
    type Tlas;
    type BindingTable;
    type Fence;

    fn create_buffer(&mut self, size: u64, usage: BufferUsage, label: &str) -> Result<Self::Buffer>;

    /// Schedule a host to device copy at `offset`.
    fn write_buffer(&mut self, buffer: &Self::Buffer, offset: u64, data: &[u8]) -> Result<()>;

    /// Schedule a device-side clear of the whole buffer.
    fn fill_zero(&mut self, buffer: &Self::Buffer) -> Result<()>;

    fn buffer_barrier(&mut self, buffer: &Self::Buffer, src: Stage, dst: Stage);

    fn global_barrier(&mut self, src: Stage, dst: Stage);

    fn create_blas(&mut self, label: &str) -> Result<Self::Blas>;

    fn build_blas(
        &mut self,
        blas: &mut Self::Blas,
        geometry: &BlasGeometry<'_, Self>,
        flags: BuildFlags,
        mode: BuildMode,
    ) -> Result<()>;

    fn blas_address(&self, blas: &Self::Blas) -> u64;

    fn create_tlas(&mut self, label: &str) -> Result<Self::Tlas>;

    /// Build or refit over the first `instance_count` [`AccelInstance`]s of `instances`.
    fn build_tlas(
        &mut self,
        tlas: &mut Self::Tlas,
        instances: &Self::Buffer,
        instance_count: u32,
        mode: TlasMode,
    ) -> Result<()>;

    fn create_binding_table(&mut self, layout: BindingLayout, label: &str) -> Result<Self::BindingTable>;

    fn write_geometry_binding(
        &mut self,
        table: &mut Self::BindingTable,
        index: u32,
        binding: &GeometryBinding<'_, Self>,
    ) -> Result<()>;

    /// Publish the top-level BVH, `None` when the scene is empty.
    fn write_tlas_binding(&mut self, table: &mut Self::BindingTable, tlas: Option<&Self::Tlas>) -> Result<()>;

    fn write_texture_binding(
        &mut self,
        table: &mut Self::BindingTable,
        index: u32,
        texture: &Self::Texture,
    ) -> Result<()>;

    /// RGBA8 texture with the given pixels.
    fn create_texture(&mut self, width: u32, height: u32, pixels: &[u8], label: &str) -> Result<Self::Texture>;

    fn submit(&mut self) -> Result<Self::Fence>;

    /// Drop everything recorded since the last `submit` without submitting.
    fn discard(&mut self);

    /// Block until the submission behind `fence` has completed.
    fn wait(&mut self, fence: &Self::Fence) -> Result<()>;
}
