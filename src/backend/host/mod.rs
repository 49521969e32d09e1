//! Host memory backend.
//!
//! Emulates a ray tracing device in host memory so the decision layer can
//! run headless. Besides executing commands it keeps:
//! - a command log ([`HostCommand`]) for ordering assertions
//! - counters ([`HostStats`])
//! - hazard tracking: a host-side mutation (buffer upload or binding table
//!   write) of a resource still referenced by a submission whose fence has not
//!   been waited on counts as a hazard
//!
//! Device-side commands (clears, BVH builds) are ordered by barriers on a real
//! queue and are not hazards. Submissions complete only when waited on, which
//! makes the emulation maximally pessimistic about GPU progress.
//!
//! Commands execute when recorded. [`RtBackend::discard`] therefore cannot
//! roll back their effects; it only drops the open submission, and the
//! next recorded command reuses its number.

mod bvh;
mod light_cache;

pub use bvh::Aabb;
pub use light_cache::{LightCachePassStats, LightSample, LIGHT_CACHE_MAX_N};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use glam::Vec3;
use hash_grid::{AdaptiveGrid, LightCacheVertex};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::{
    AccelInstance, BindingLayout, BlasGeometry, BufferUsage, BuildFlags, BuildMode,
    GeometryBinding, RtBackend, Stage, TlasMode,
};
use bvh::{build_bvh, refit_bvh, triangle_bounds, Bvh};
use crate::util::{rows_to_mat4, Error, Result};

const BLAS_ADDRESS_BASE: u64 = 0x1_0000_0000;
const BLAS_ADDRESS_STRIDE: u64 = 0x1000;

/// Host memory buffer. Clones share storage.
#[derive(Clone)]
pub struct HostBuffer {
    inner: Arc<HostBufferInner>,
}

struct HostBufferInner {
    id: u64,
    label: String,
    usage: BufferUsage,
    data: Mutex<Vec<u8>>,
    last_use: AtomicU64,
}

impl HostBuffer {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn usage(&self) -> BufferUsage {
        self.inner.usage
    }

    pub fn size(&self) -> u64 {
        self.inner.data.lock().len() as u64
    }

    /// Snapshot of the contents.
    pub fn read_bytes(&self) -> Vec<u8> {
        self.inner.data.lock().clone()
    }

    /// Contents reinterpreted as `T` (trailing partial element dropped).
    pub fn read_pod<T: bytemuck::Pod>(&self) -> Vec<T> {
        let data = self.inner.data.lock();
        let whole = data.len() / std::mem::size_of::<T>() * std::mem::size_of::<T>();
        bytemuck::pod_collect_to_vec(&data[..whole])
    }

    fn mark_used(&self, submission: u64) {
        self.inner.last_use.store(submission, Ordering::Relaxed);
    }

    fn last_use(&self) -> u64 {
        self.inner.last_use.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("size", &self.size())
            .finish()
    }
}

/// RGBA8 texture in host memory.
#[derive(Debug, Clone)]
pub struct HostTexture {
    pub id: u64,
    pub width: u32,
    pub height: u32,
    pub pixels: Arc<Vec<u8>>,
}

/// Bottom-level BVH object.
#[derive(Debug)]
pub struct HostBlas {
    id: u64,
    address: u64,
    bvh: Option<Bvh>,
    flags: BuildFlags,
    vertex_count: u32,
    primitive_count: u32,
    root: Arc<Mutex<Aabb>>,
}

impl HostBlas {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_built(&self) -> bool {
        self.bvh.is_some()
    }

    pub fn bounds(&self) -> Aabb {
        *self.root.lock()
    }
}

/// Top-level BVH object.
#[derive(Debug)]
pub struct HostTlas {
    id: u64,
    bvh: Option<Bvh>,
    instances: Vec<AccelInstance>,
}

impl HostTlas {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn instance_count(&self) -> u32 {
        self.instances.len() as u32
    }

    pub fn instances(&self) -> &[AccelInstance] {
        &self.instances
    }

    pub fn bounds(&self) -> Aabb {
        self.bvh.as_ref().map(Bvh::bounds).unwrap_or(Aabb::EMPTY)
    }
}

/// Buffer ids bound at one geometry index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostGeometryEntry {
    pub vertices: u64,
    pub prev_vertices: u64,
    pub indices: u64,
    pub attributes: u64,
}

/// Binding table: resource ids per binding index.
#[derive(Debug)]
pub struct HostBindingTable {
    id: u64,
    layout: BindingLayout,
    geometry: Vec<Option<HostGeometryEntry>>,
    textures: Vec<Option<u64>>,
    tlas: Option<u64>,
    last_use: u64,
}

impl HostBindingTable {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn layout(&self) -> BindingLayout {
        self.layout
    }

    pub fn geometry(&self, index: u32) -> Option<&HostGeometryEntry> {
        self.geometry.get(index as usize).and_then(Option::as_ref)
    }

    pub fn texture(&self, index: u32) -> Option<u64> {
        self.textures.get(index as usize).copied().flatten()
    }

    pub fn tlas(&self) -> Option<u64> {
        self.tlas
    }
}

/// Completion token of one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostFence {
    pub submission: u64,
}

/// Recorded command, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    CreateBuffer { buffer: u64, size: u64 },
    Write { buffer: u64, offset: u64, len: usize },
    FillZero { buffer: u64 },
    Barrier { buffer: Option<u64>, src: Stage, dst: Stage },
    BuildBlas { blas: u64, mode: BuildMode, primitives: u32 },
    BuildTlas { tlas: u64, mode: TlasMode, instances: u32 },
    BindGeometry { table: u64, index: u32, vertices: u64 },
    BindTlas { table: u64, tlas: Option<u64> },
    BindTexture { table: u64, index: u32, texture: u64 },
    LightCachePass { buffer: u64, samples: usize },
    Submit { submission: u64 },
    /// Open submission dropped without being submitted.
    Discard { submission: u64 },
    Wait { submission: u64 },
}

/// Counters since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStats {
    pub hazards: u64,
    pub submissions: u64,
    pub waits: u64,
    pub buffers_created: u64,
    pub bytes_written: u64,
    pub zero_fills: u64,
    pub barriers: u64,
    pub blas_builds: u64,
    pub blas_updates: u64,
    pub blas_rebuilds: u64,
    pub tlas_builds: u64,
    pub tlas_refits: u64,
    pub discards: u64,
    pub light_cache_passes: u64,
}

/// Ray tracing device emulated in host memory.
pub struct HostBackend {
    next_id: u64,
    /// Submission currently being recorded.
    recording: u64,
    /// Highest submission known to be complete.
    completed: u64,
    blas_registry: HashMap<u64, Weak<Mutex<Aabb>>>,
    log: Option<Vec<HostCommand>>,
    stats: HostStats,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            recording: 1,
            completed: 0,
            blas_registry: HashMap::new(),
            log: Some(Vec::new()),
            stats: HostStats::default(),
        }
    }

    /// Disable the command log (long simulations).
    pub fn without_log(mut self) -> Self {
        self.log = None;
        self
    }

    pub fn stats(&self) -> HostStats {
        self.stats
    }

    pub fn log(&self) -> &[HostCommand] {
        self.log.as_deref().unwrap_or(&[])
    }

    /// Drain the command log.
    pub fn take_log(&mut self) -> Vec<HostCommand> {
        self.log.as_mut().map(std::mem::take).unwrap_or_default()
    }

    /// Submissions recorded but not yet waited on.
    pub fn in_flight(&self) -> u64 {
        self.recording - 1 - self.completed
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn record(&mut self, cmd: HostCommand) {
        trace!(?cmd, "host command");
        if let Some(log) = self.log.as_mut() {
            log.push(cmd);
        }
    }

    fn in_use_by_pending(&self, last_use: u64) -> bool {
        last_use != 0 && last_use < self.recording && last_use > self.completed
    }

    fn check_host_write(&mut self, what: &str, id: u64, last_use: u64) {
        if self.in_use_by_pending(last_use) {
            self.stats.hazards += 1;
            warn!(what, id, last_use, completed = self.completed, "host write to resource in flight");
        }
    }

    /// Run the light cache update over `samples` as a device-side pass on
    /// `buffer`, which must hold [`LightCacheVertex`] records.
    pub fn light_cache_pass(
        &mut self,
        buffer: &HostBuffer,
        grid: AdaptiveGrid,
        camera: Vec3,
        samples: &[LightSample],
    ) -> Result<LightCachePassStats> {
        let stats = {
            let mut data = buffer.inner.data.lock();
            if data.len() % std::mem::size_of::<LightCacheVertex>() != 0 {
                return Err(Error::backend(format!(
                    "'{}' ({} bytes) does not hold whole light cache records",
                    buffer.label(),
                    data.len()
                )));
            }
            let mut records: Vec<LightCacheVertex> = bytemuck::pod_collect_to_vec(&data);
            let stats = light_cache::update_records(&mut records, grid, camera, samples);
            data.copy_from_slice(bytemuck::cast_slice(&records));
            stats
        };
        buffer.mark_used(self.recording);
        self.stats.light_cache_passes += 1;
        self.record(HostCommand::LightCachePass { buffer: buffer.id(), samples: samples.len() });
        trace!(?stats, "light cache pass");
        Ok(stats)
    }

    fn read_f32(buffer: &HostBuffer, count: usize, what: &str) -> Result<Vec<f32>> {
        let data = buffer.inner.data.lock();
        let bytes = count * 4;
        if data.len() < bytes {
            return Err(Error::backend(format!(
                "{what} buffer '{}' holds {} bytes, build needs {bytes}",
                buffer.label(),
                data.len()
            )));
        }
        Ok(bytemuck::pod_collect_to_vec(&data[..bytes]))
    }
}

impl RtBackend for HostBackend {
    type Buffer = HostBuffer;
    type Texture = HostTexture;
    type Blas = HostBlas;
    type Tlas = HostTlas;
    type BindingTable = HostBindingTable;
    type Fence = HostFence;

    fn create_buffer(&mut self, size: u64, usage: BufferUsage, label: &str) -> Result<HostBuffer> {
        let id = self.alloc_id();
        self.stats.buffers_created += 1;
        self.record(HostCommand::CreateBuffer { buffer: id, size });
        Ok(HostBuffer {
            inner: Arc::new(HostBufferInner {
                id,
                label: label.to_string(),
                usage,
                data: Mutex::new(vec![0; size as usize]),
                last_use: AtomicU64::new(0),
            }),
        })
    }

    fn write_buffer(&mut self, buffer: &HostBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset as usize + data.len();
        let size = buffer.size() as usize;
        if end > size {
            return Err(Error::backend(format!(
                "write of {} bytes at {offset} overflows '{}' ({size} bytes)",
                data.len(),
                buffer.label()
            )));
        }
        self.check_host_write("buffer", buffer.id(), buffer.last_use());
        buffer.inner.data.lock()[offset as usize..end].copy_from_slice(data);
        buffer.mark_used(self.recording);
        self.stats.bytes_written += data.len() as u64;
        self.record(HostCommand::Write { buffer: buffer.id(), offset, len: data.len() });
        Ok(())
    }

    fn fill_zero(&mut self, buffer: &HostBuffer) -> Result<()> {
        buffer.inner.data.lock().fill(0);
        buffer.mark_used(self.recording);
        self.stats.zero_fills += 1;
        self.record(HostCommand::FillZero { buffer: buffer.id() });
        Ok(())
    }

    fn buffer_barrier(&mut self, buffer: &HostBuffer, src: Stage, dst: Stage) {
        buffer.mark_used(self.recording);
        self.stats.barriers += 1;
        self.record(HostCommand::Barrier { buffer: Some(buffer.id()), src, dst });
    }

    fn global_barrier(&mut self, src: Stage, dst: Stage) {
        self.stats.barriers += 1;
        self.record(HostCommand::Barrier { buffer: None, src, dst });
    }

    fn create_blas(&mut self, _label: &str) -> Result<HostBlas> {
        let id = self.alloc_id();
        let root = Arc::new(Mutex::new(Aabb::EMPTY));
        let address = BLAS_ADDRESS_BASE + id * BLAS_ADDRESS_STRIDE;
        self.blas_registry.retain(|_, weak| weak.strong_count() > 0);
        self.blas_registry.insert(address, Arc::downgrade(&root));
        Ok(HostBlas {
            id,
            address,
            bvh: None,
            flags: BuildFlags::empty(),
            vertex_count: 0,
            primitive_count: 0,
            root,
        })
    }

    fn build_blas(
        &mut self,
        blas: &mut HostBlas,
        geometry: &BlasGeometry<'_, Self>,
        flags: BuildFlags,
        mode: BuildMode,
    ) -> Result<()> {
        let positions = Self::read_f32(geometry.vertices, geometry.vertex_count as usize * 3, "vertex")?;
        let indices: Vec<u32> = {
            let data = geometry.indices.inner.data.lock();
            let bytes = geometry.primitive_count as usize * 12;
            if data.len() < bytes {
                return Err(Error::backend(format!(
                    "index buffer '{}' holds {} bytes, build needs {bytes}",
                    geometry.indices.label(),
                    data.len()
                )));
            }
            bytemuck::pod_collect_to_vec(&data[..bytes])
        };
        geometry.vertices.mark_used(self.recording);
        geometry.indices.mark_used(self.recording);

        let bounds = triangle_bounds(&positions, &indices);
        match mode {
            BuildMode::Build | BuildMode::Rebuild => {
                if mode == BuildMode::Rebuild && !blas.is_built() {
                    return Err(Error::backend(format!("rebuild of unbuilt BLAS {}", blas.id)));
                }
                blas.bvh = Some(build_bvh(&bounds));
                blas.flags = flags;
                blas.vertex_count = geometry.vertex_count;
                blas.primitive_count = geometry.primitive_count;
                if mode == BuildMode::Build {
                    self.stats.blas_builds += 1;
                } else {
                    self.stats.blas_rebuilds += 1;
                }
            }
            BuildMode::Update => {
                if !blas.flags.contains(BuildFlags::ALLOW_UPDATE) {
                    return Err(Error::backend(format!("BLAS {} was not built with ALLOW_UPDATE", blas.id)));
                }
                if blas.vertex_count != geometry.vertex_count || blas.primitive_count != geometry.primitive_count {
                    return Err(Error::backend(format!(
                        "update of BLAS {} changes counts ({}, {}) -> ({}, {})",
                        blas.id, blas.vertex_count, blas.primitive_count, geometry.vertex_count, geometry.primitive_count
                    )));
                }
                let bvh = blas
                    .bvh
                    .as_mut()
                    .ok_or_else(|| Error::backend(format!("update of unbuilt BLAS {}", blas.id)))?;
                refit_bvh(bvh, &bounds);
                self.stats.blas_updates += 1;
            }
        }

        *blas.root.lock() = blas.bvh.as_ref().map(Bvh::bounds).unwrap_or(Aabb::EMPTY);
        self.record(HostCommand::BuildBlas { blas: blas.id, mode, primitives: geometry.primitive_count });
        Ok(())
    }

    fn blas_address(&self, blas: &HostBlas) -> u64 {
        blas.address
    }

    fn create_tlas(&mut self, _label: &str) -> Result<HostTlas> {
        Ok(HostTlas { id: self.alloc_id(), bvh: None, instances: Vec::new() })
    }

    fn build_tlas(
        &mut self,
        tlas: &mut HostTlas,
        instances: &HostBuffer,
        instance_count: u32,
        mode: TlasMode,
    ) -> Result<()> {
        let records: Vec<AccelInstance> = {
            let data = instances.inner.data.lock();
            let bytes = instance_count as usize * std::mem::size_of::<AccelInstance>();
            if data.len() < bytes {
                return Err(Error::backend(format!(
                    "instance buffer holds {} bytes, {instance_count} instances need {bytes}",
                    data.len()
                )));
            }
            bytemuck::pod_collect_to_vec(&data[..bytes])
        };
        instances.mark_used(self.recording);

        let bounds = records
            .iter()
            .map(|inst| {
                let root = self
                    .blas_registry
                    .get(&inst.blas_address)
                    .and_then(Weak::upgrade)
                    .ok_or_else(|| Error::backend(format!("unknown BLAS address {:#x}", inst.blas_address)))?;
                let aabb = *root.lock();
                Ok(aabb.transformed(&rows_to_mat4(&inst.transform)))
            })
            .collect::<Result<Vec<_>>>()?;

        match mode {
            TlasMode::Build => {
                tlas.bvh = Some(build_bvh(&bounds));
                self.stats.tlas_builds += 1;
            }
            TlasMode::Refit => {
                if tlas.instances.len() != records.len() {
                    return Err(Error::backend(format!(
                        "refit of TLAS {} with {} instances, built with {}",
                        tlas.id,
                        records.len(),
                        tlas.instances.len()
                    )));
                }
                let bvh = tlas
                    .bvh
                    .as_mut()
                    .ok_or_else(|| Error::backend(format!("refit of unbuilt TLAS {}", tlas.id)))?;
                refit_bvh(bvh, &bounds);
                self.stats.tlas_refits += 1;
            }
        }
        tlas.instances = records;
        self.record(HostCommand::BuildTlas { tlas: tlas.id, mode, instances: instance_count });
        Ok(())
    }

    fn create_binding_table(&mut self, layout: BindingLayout, _label: &str) -> Result<HostBindingTable> {
        Ok(HostBindingTable {
            id: self.alloc_id(),
            layout,
            geometry: vec![None; layout.max_geometries as usize],
            textures: vec![None; layout.max_textures as usize],
            tlas: None,
            last_use: 0,
        })
    }

    fn write_geometry_binding(
        &mut self,
        table: &mut HostBindingTable,
        index: u32,
        binding: &GeometryBinding<'_, Self>,
    ) -> Result<()> {
        let slot = table
            .geometry
            .get_mut(index as usize)
            .ok_or_else(|| Error::backend(format!("geometry binding {index} out of range")))?;
        *slot = Some(HostGeometryEntry {
            vertices: binding.vertices.id(),
            prev_vertices: binding.prev_vertices.id(),
            indices: binding.indices.id(),
            attributes: binding.attributes.id(),
        });
        for buffer in [binding.vertices, binding.prev_vertices, binding.indices, binding.attributes] {
            buffer.mark_used(self.recording);
        }
        let (id, last_use) = (table.id, table.last_use);
        self.check_host_write("binding table", id, last_use);
        table.last_use = self.recording;
        self.record(HostCommand::BindGeometry { table: id, index, vertices: binding.vertices.id() });
        Ok(())
    }

    fn write_tlas_binding(&mut self, table: &mut HostBindingTable, tlas: Option<&HostTlas>) -> Result<()> {
        table.tlas = tlas.map(|t| t.id);
        let (id, last_use) = (table.id, table.last_use);
        self.check_host_write("binding table", id, last_use);
        table.last_use = self.recording;
        self.record(HostCommand::BindTlas { table: id, tlas: table.tlas });
        Ok(())
    }

    fn write_texture_binding(&mut self, table: &mut HostBindingTable, index: u32, texture: &HostTexture) -> Result<()> {
        let slot = table
            .textures
            .get_mut(index as usize)
            .ok_or_else(|| Error::backend(format!("texture binding {index} out of range")))?;
        *slot = Some(texture.id);
        let (id, last_use) = (table.id, table.last_use);
        self.check_host_write("binding table", id, last_use);
        table.last_use = self.recording;
        self.record(HostCommand::BindTexture { table: id, index, texture: texture.id });
        Ok(())
    }

    fn create_texture(&mut self, width: u32, height: u32, pixels: &[u8], _label: &str) -> Result<HostTexture> {
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            return Err(Error::backend(format!(
                "texture {width}x{height} needs {expected} RGBA8 bytes, got {}",
                pixels.len()
            )));
        }
        Ok(HostTexture { id: self.alloc_id(), width, height, pixels: Arc::new(pixels.to_vec()) })
    }

    fn submit(&mut self) -> Result<HostFence> {
        let fence = HostFence { submission: self.recording };
        self.record(HostCommand::Submit { submission: fence.submission });
        self.recording += 1;
        self.stats.submissions += 1;
        debug!(submission = fence.submission, in_flight = self.in_flight(), "submit");
        Ok(fence)
    }

    fn discard(&mut self) {
        let submission = self.recording;
        self.record(HostCommand::Discard { submission });
        self.stats.discards += 1;
        debug!(submission, "recording discarded");
    }

    fn wait(&mut self, fence: &HostFence) -> Result<()> {
        if fence.submission >= self.recording {
            return Err(Error::backend(format!("wait on unsubmitted fence {}", fence.submission)));
        }
        self.completed = self.completed.max(fence.submission);
        self.stats.waits += 1;
        self.record(HostCommand::Wait { submission: fence.submission });
        Ok(())
    }
}
