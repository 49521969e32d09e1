//! wgpu backend.
//!
//! Buffers are device buffers; uploads go through staging buffers copied in
//! the frame's command encoder so they stay ordered with everything else
//! recorded for the frame. Bottom and top-level BVHs are wgpu acceleration
//! structures built by the driver, which requires a device created with
//! `Features::EXPERIMENTAL_RAY_QUERY`.
//!
//! wgpu fixes the geometry sizes of a `Blas` at creation and fills TLAS
//! instances from host-side `TlasInstance`s. Consequences:
//! - builds and rebuilds create a new `Blas`; only updates reuse one
//! - instance buffers keep a host shadow the TLAS build reads records from
//! - [`InstanceFlags`](super::InstanceFlags) have no wgpu counterpart and are
//!   dropped; shaders select opacity through ray flags instead
//!
//! ## Usage
//! ```ignore
//! let backend = WgpuBackend::new(device.clone(), queue.clone())?;
//! let mut accel = SceneAccelerator::new(backend, AccelConfig::default())?;
//! let out = accel.render_frame(input)?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::iter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};
use wgpu::util::DeviceExt;

use super::{
    AccelInstance, BindingLayout, BlasGeometry, BufferUsage, BuildFlags, BuildMode, GeometryBinding, RtBackend,
    Stage, TlasMode,
};
use crate::util::{Error, Result};

const COPY_ALIGN: u64 = wgpu::COPY_BUFFER_ALIGNMENT;
/// Addresses are only keys into the BLAS registry; wgpu hides real ones.
const BLAS_ADDRESS_BASE: u64 = 0x1_0000_0000;
const BLAS_ADDRESS_STRIDE: u64 = 0x1000;

#[inline]
fn align_copy(size: u64) -> u64 {
    size.div_ceil(COPY_ALIGN).max(1) * COPY_ALIGN
}

fn buffer_usages(usage: BufferUsage) -> wgpu::BufferUsages {
    let mut out = wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC;
    if usage.intersects(BufferUsage::STORAGE | BufferUsage::INSTANCE_INPUT) {
        out |= wgpu::BufferUsages::STORAGE;
    }
    if usage.contains(BufferUsage::ACCEL_INPUT) {
        out |= wgpu::BufferUsages::BLAS_INPUT;
    }
    out
}

fn structure_flags(flags: BuildFlags) -> wgpu::AccelerationStructureFlags {
    use wgpu::AccelerationStructureFlags as F;
    [
        (BuildFlags::ALLOW_UPDATE, F::ALLOW_UPDATE),
        (BuildFlags::ALLOW_COMPACTION, F::ALLOW_COMPACTION),
        (BuildFlags::PREFER_FAST_TRACE, F::PREFER_FAST_TRACE),
        (BuildFlags::PREFER_FAST_BUILD, F::PREFER_FAST_BUILD),
    ]
    .into_iter()
    .filter(|(ours, _)| flags.contains(*ours))
    .fold(F::empty(), |acc, (_, theirs)| acc | theirs)
}

/// Device buffer, plus a host shadow for instance records.
#[derive(Clone)]
pub struct WgpuBuffer {
    raw: Arc<wgpu::Buffer>,
    shadow: Option<Arc<Mutex<Vec<u8>>>>,
}

impl WgpuBuffer {
    pub fn raw(&self) -> &wgpu::Buffer {
        &self.raw
    }
}

impl fmt::Debug for WgpuBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuBuffer")
            .field("size", &self.raw.size())
            .field("shadowed", &self.shadow.is_some())
            .finish()
    }
}

/// Sampled RGBA8 texture.
pub struct WgpuTexture {
    pub texture: wgpu::Texture,
    pub view: Arc<wgpu::TextureView>,
}

/// Bottom-level acceleration structure, `None` until first built.
pub struct WgpuBlas {
    address: u64,
    label: String,
    raw: Option<Arc<wgpu::Blas>>,
    /// (vertices, primitives) the structure was created for.
    counts: (u32, u32),
    flags: BuildFlags,
}

impl WgpuBlas {
    pub fn raw(&self) -> Option<&wgpu::Blas> {
        self.raw.as_deref()
    }
}

/// Top-level acceleration structure, shared with the binding tables that
/// publish it.
pub struct WgpuTlas {
    label: String,
    raw: Option<Arc<Mutex<wgpu::Tlas>>>,
    instance_count: u32,
}

impl WgpuTlas {
    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }
}

/// Resources bound for one geometry index.
#[derive(Clone)]
pub struct WgpuGeometryEntry {
    pub vertices: Arc<wgpu::Buffer>,
    pub prev_vertices: Arc<wgpu::Buffer>,
    pub indices: Arc<wgpu::Buffer>,
    pub attributes: Arc<wgpu::Buffer>,
}

/// Resources consumed by the ray tracing kernels when creating bind groups.
pub struct WgpuBindingTable {
    pub layout: BindingLayout,
    pub geometry: Vec<Option<WgpuGeometryEntry>>,
    pub textures: Vec<Option<Arc<wgpu::TextureView>>>,
    pub tlas: Option<Arc<Mutex<wgpu::Tlas>>>,
}

/// Signaled from `Queue::on_submitted_work_done`.
#[derive(Clone)]
pub struct WgpuFence {
    done: Arc<AtomicBool>,
}

/// Ray tracing backend on a wgpu device.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    encoder: Option<wgpu::CommandEncoder>,
    next_blas: u64,
    blas_registry: HashMap<u64, Weak<wgpu::Blas>>,
}

impl WgpuBackend {
    /// Fails if `device` lacks ray query support.
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Result<Self> {
        if !device.features().contains(wgpu::Features::EXPERIMENTAL_RAY_QUERY) {
            return Err(Error::backend("device was created without EXPERIMENTAL_RAY_QUERY"));
        }
        Ok(Self {
            device,
            queue,
            encoder: None,
            next_blas: 1,
            blas_registry: HashMap::new(),
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        let device = &self.device;
        self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("rtaccel_frame_encoder"),
            })
        })
    }

    /// Staging copy into `dst` at `offset`, padded to the copy alignment.
    fn copy_to(&mut self, dst: &wgpu::Buffer, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if offset % COPY_ALIGN != 0 {
            return Err(Error::backend(format!("upload offset {offset} is not {COPY_ALIGN}-byte aligned")));
        }
        let padded_len = align_copy(data.len() as u64);
        if offset + padded_len > dst.size() {
            return Err(Error::backend(format!(
                "upload of {} bytes at {offset} overflows buffer of {} bytes",
                data.len(),
                dst.size()
            )));
        }
        let mut padded = data.to_vec();
        padded.resize(padded_len as usize, 0);
        let staging = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("rtaccel_staging"),
            contents: &padded,
            usage: wgpu::BufferUsages::COPY_SRC,
        });
        self.encoder().copy_buffer_to_buffer(&staging, 0, dst, offset, padded_len);
        Ok(())
    }

    fn lookup_blas(&self, address: u64) -> Result<Arc<wgpu::Blas>> {
        self.blas_registry
            .get(&address)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::backend(format!("unknown BLAS address {address:#x}")))
    }

    fn read_instances(buffer: &WgpuBuffer, count: u32) -> Result<Vec<AccelInstance>> {
        let shadow = buffer
            .shadow
            .as_deref()
            .ok_or_else(|| Error::backend("instance buffer was not created with INSTANCE_INPUT usage"))?;
        let data = shadow.lock();
        let bytes = count as usize * std::mem::size_of::<AccelInstance>();
        if data.len() < bytes {
            return Err(Error::backend(format!("instance buffer holds {} bytes, build needs {bytes}", data.len())));
        }
        Ok(bytemuck::pod_collect_to_vec(&data[..bytes]))
    }
}

impl RtBackend for WgpuBackend {
    type Buffer = WgpuBuffer;
    type Texture = WgpuTexture;
    type Blas = WgpuBlas;
    type Tlas = WgpuTlas;
    type BindingTable = WgpuBindingTable;
    type Fence = WgpuFence;

    fn create_buffer(&mut self, size: u64, usage: BufferUsage, label: &str) -> Result<WgpuBuffer> {
        let size = align_copy(size);
        let raw = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: buffer_usages(usage),
            mapped_at_creation: false,
        });
        let shadow = usage
            .contains(BufferUsage::INSTANCE_INPUT)
            .then(|| Arc::new(Mutex::new(vec![0u8; size as usize])));
        trace!(label, size, ?usage, "create buffer");
        Ok(WgpuBuffer { raw: Arc::new(raw), shadow })
    }

    fn write_buffer(&mut self, buffer: &WgpuBuffer, offset: u64, data: &[u8]) -> Result<()> {
        if let Some(shadow) = &buffer.shadow {
            let mut shadow = shadow.lock();
            let end = offset as usize + data.len();
            if end > shadow.len() {
                return Err(Error::backend(format!("write of {} bytes at {offset} overflows shadow", data.len())));
            }
            shadow[offset as usize..end].copy_from_slice(data);
        }
        let raw = Arc::clone(&buffer.raw);
        self.copy_to(&raw, offset, data)
    }

    fn fill_zero(&mut self, buffer: &WgpuBuffer) -> Result<()> {
        if let Some(shadow) = &buffer.shadow {
            shadow.lock().fill(0);
        }
        let raw = Arc::clone(&buffer.raw);
        self.encoder().clear_buffer(&raw, 0, None);
        Ok(())
    }

    // wgpu tracks resource state and inserts the transitions itself
    fn buffer_barrier(&mut self, buffer: &WgpuBuffer, src: Stage, dst: Stage) {
        trace!(size = buffer.raw.size(), ?src, ?dst, "buffer barrier");
    }

    fn global_barrier(&mut self, src: Stage, dst: Stage) {
        trace!(?src, ?dst, "global barrier");
    }

    fn create_blas(&mut self, label: &str) -> Result<WgpuBlas> {
        let address = BLAS_ADDRESS_BASE + self.next_blas * BLAS_ADDRESS_STRIDE;
        self.next_blas += 1;
        Ok(WgpuBlas {
            address,
            label: label.to_string(),
            raw: None,
            counts: (0, 0),
            flags: BuildFlags::empty(),
        })
    }

    fn build_blas(
        &mut self,
        blas: &mut WgpuBlas,
        geometry: &BlasGeometry<'_, Self>,
        flags: BuildFlags,
        mode: BuildMode,
    ) -> Result<()> {
        let size = wgpu::BlasTriangleGeometrySizeDescriptor {
            vertex_format: wgpu::VertexFormat::Float32x3,
            vertex_count: geometry.vertex_count,
            index_format: Some(wgpu::IndexFormat::Uint32),
            index_count: Some(geometry.primitive_count * 3),
            flags: wgpu::AccelerationStructureGeometryFlags::empty(),
        };

        let counts = (geometry.vertex_count, geometry.primitive_count);
        let raw = match mode {
            BuildMode::Update => {
                if !blas.flags.contains(BuildFlags::ALLOW_UPDATE) || blas.counts != counts {
                    return Err(Error::backend(format!(
                        "update of BLAS '{}' without ALLOW_UPDATE or with changed counts",
                        blas.label
                    )));
                }
                blas.raw
                    .clone()
                    .ok_or_else(|| Error::backend(format!("update of unbuilt BLAS '{}'", blas.label)))?
            }
            BuildMode::Build | BuildMode::Rebuild => {
                if mode == BuildMode::Rebuild && blas.raw.is_none() {
                    return Err(Error::backend(format!("rebuild of unbuilt BLAS '{}'", blas.label)));
                }
                let update_mode = if flags.contains(BuildFlags::ALLOW_UPDATE) {
                    wgpu::AccelerationStructureUpdateMode::PreferUpdate
                } else {
                    wgpu::AccelerationStructureUpdateMode::Build
                };
                let raw = Arc::new(self.device.create_blas(
                    &wgpu::CreateBlasDescriptor {
                        label: Some(&blas.label),
                        flags: structure_flags(flags),
                        update_mode,
                    },
                    wgpu::BlasGeometrySizeDescriptors::Triangles { descriptors: vec![size.clone()] },
                ));
                self.blas_registry.retain(|_, weak| weak.strong_count() > 0);
                self.blas_registry.insert(blas.address, Arc::downgrade(&raw));
                blas.raw = Some(Arc::clone(&raw));
                blas.counts = counts;
                blas.flags = flags;
                raw
            }
        };

        let entry = wgpu::BlasBuildEntry {
            blas: &*raw,
            geometry: wgpu::BlasGeometries::TriangleGeometries(vec![wgpu::BlasTriangleGeometry {
                size: &size,
                vertex_buffer: geometry.vertices.raw(),
                first_vertex: 0,
                vertex_stride: 12,
                index_buffer: Some(geometry.indices.raw()),
                first_index: Some(0),
                transform_buffer: None,
                transform_buffer_offset: None,
            }]),
        };
        self.encoder()
            .build_acceleration_structures(iter::once(&entry), iter::empty::<&wgpu::Tlas>());
        debug!(?mode, primitives = geometry.primitive_count, "blas");
        Ok(())
    }

    fn blas_address(&self, blas: &WgpuBlas) -> u64 {
        blas.address
    }

    fn create_tlas(&mut self, label: &str) -> Result<WgpuTlas> {
        Ok(WgpuTlas { label: label.to_string(), raw: None, instance_count: 0 })
    }

    fn build_tlas(
        &mut self,
        tlas: &mut WgpuTlas,
        instances: &WgpuBuffer,
        instance_count: u32,
        mode: TlasMode,
    ) -> Result<()> {
        let records = Self::read_instances(instances, instance_count)?;
        let raw = match mode {
            TlasMode::Refit => {
                if tlas.instance_count != instance_count {
                    return Err(Error::backend(format!(
                        "refit of TLAS '{}' with {instance_count} instances, built with {}",
                        tlas.label, tlas.instance_count
                    )));
                }
                tlas.raw
                    .clone()
                    .ok_or_else(|| Error::backend(format!("refit of unbuilt TLAS '{}'", tlas.label)))?
            }
            TlasMode::Build => {
                let raw = Arc::new(Mutex::new(self.device.create_tlas(&wgpu::CreateTlasDescriptor {
                    label: Some(&tlas.label),
                    max_instances: instance_count.max(1),
                    flags: wgpu::AccelerationStructureFlags::PREFER_FAST_TRACE
                        | wgpu::AccelerationStructureFlags::ALLOW_UPDATE,
                    update_mode: wgpu::AccelerationStructureUpdateMode::PreferUpdate,
                })));
                tlas.raw = Some(Arc::clone(&raw));
                tlas.instance_count = instance_count;
                raw
            }
        };

        let mut target = raw.lock();
        for (i, record) in records.iter().enumerate() {
            let blas = self.lookup_blas(record.blas_address)?;
            let transform: [f32; 12] = bytemuck::cast(record.transform);
            target[i] = Some(wgpu::TlasInstance::new(&*blas, transform, record.custom_index(), record.mask()));
        }
        self.encoder()
            .build_acceleration_structures(iter::empty::<&wgpu::BlasBuildEntry<'_>>(), iter::once(&*target));
        debug!(?mode, instances = instance_count, "tlas");
        Ok(())
    }

    fn create_binding_table(&mut self, layout: BindingLayout, _label: &str) -> Result<WgpuBindingTable> {
        Ok(WgpuBindingTable {
            layout,
            geometry: vec![None; layout.max_geometries as usize],
            textures: vec![None; layout.max_textures as usize],
            tlas: None,
        })
    }

    fn write_geometry_binding(
        &mut self,
        table: &mut WgpuBindingTable,
        index: u32,
        binding: &GeometryBinding<'_, Self>,
    ) -> Result<()> {
        let slot = table
            .geometry
            .get_mut(index as usize)
            .ok_or_else(|| Error::backend(format!("geometry binding {index} out of range")))?;
        *slot = Some(WgpuGeometryEntry {
            vertices: Arc::clone(&binding.vertices.raw),
            prev_vertices: Arc::clone(&binding.prev_vertices.raw),
            indices: Arc::clone(&binding.indices.raw),
            attributes: Arc::clone(&binding.attributes.raw),
        });
        Ok(())
    }

    fn write_tlas_binding(&mut self, table: &mut WgpuBindingTable, tlas: Option<&WgpuTlas>) -> Result<()> {
        table.tlas = tlas.and_then(|t| t.raw.clone());
        Ok(())
    }

    fn write_texture_binding(&mut self, table: &mut WgpuBindingTable, index: u32, texture: &WgpuTexture) -> Result<()> {
        let slot = table
            .textures
            .get_mut(index as usize)
            .ok_or_else(|| Error::backend(format!("texture binding {index} out of range")))?;
        *slot = Some(Arc::clone(&texture.view));
        Ok(())
    }

    fn create_texture(&mut self, width: u32, height: u32, pixels: &[u8], label: &str) -> Result<WgpuTexture> {
        if pixels.len() != width as usize * height as usize * 4 {
            return Err(Error::backend(format!("texture {width}x{height} pixel data has {} bytes", pixels.len())));
        }
        let texture = self.device.create_texture_with_data(
            &self.queue,
            &wgpu::TextureDescriptor {
                label: Some(label),
                size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8UnormSrgb,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            },
            wgpu::util::TextureDataOrder::LayerMajor,
            pixels,
        );
        let view = Arc::new(texture.create_view(&wgpu::TextureViewDescriptor::default()));
        Ok(WgpuTexture { texture, view })
    }

    fn submit(&mut self) -> Result<WgpuFence> {
        let encoder = self.encoder.take().unwrap_or_else(|| {
            self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("rtaccel_empty_encoder"),
            })
        });
        self.queue.submit(iter::once(encoder.finish()));
        let done = Arc::new(AtomicBool::new(false));
        let signal = Arc::clone(&done);
        self.queue.on_submitted_work_done(move || signal.store(true, Ordering::Release));
        Ok(WgpuFence { done })
    }

    // An unfinished encoder is dropped without ever reaching the queue
    fn discard(&mut self) {
        if self.encoder.take().is_some() {
            debug!("frame encoder discarded");
        }
    }

    fn wait(&mut self, fence: &WgpuFence) -> Result<()> {
        while !fence.done.load(Ordering::Acquire) {
            self.device
                .poll(wgpu::PollType::wait_indefinitely())
                .map_err(|e| Error::backend(format!("device poll failed: {e}")))?;
        }
        Ok(())
    }
}
