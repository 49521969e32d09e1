//! Ring of per-frame-in-flight resources.
//!
//! Each ring position owns a [`FrameSlot`]: binding table, geometry groups,
//! instance buffer and top-level BVH. A slot is created on first use and
//! reused `ring_depth` frames later, after the fence of its previous
//! submission has signaled. Nothing a slot owns is touched by any other
//! slot, so waiting on that one fence is the only synchronization needed.

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::backend::{BindingLayout, BufferUsage, GeometryBinding, RtBackend, Stage};
use crate::buffer_cache::{DeviceBuffer, MIN_BUFFER_SIZE};
use crate::geometry::GeometryGroup;
use crate::textures::TextureRegistry;
use crate::util::{Error, Result};

/// Counts BVH work queued into a slot and emits one barrier for all of it.
#[derive(Debug)]
pub struct AccelBuilder {
    consumer: Stage,
    queued: u32,
}

impl AccelBuilder {
    pub fn new(consumer: Stage) -> Self {
        Self { consumer, queued: 0 }
    }

    pub fn queue(&mut self) {
        self.queued += 1;
    }

    /// Make queued builds visible to the consumer stage.
    pub fn flush<B: RtBackend>(&mut self, backend: &mut B) -> u32 {
        let flushed = std::mem::take(&mut self.queued);
        if flushed > 0 {
            backend.global_barrier(Stage::AccelBuild, self.consumer);
        }
        flushed
    }

    /// Forget queued work whose commands were discarded.
    fn reset(&mut self) {
        self.queued = 0;
    }
}

/// Resources of one ring position.
pub struct FrameSlot<B: RtBackend> {
    index: usize,
    pub(crate) binding_table: B::BindingTable,
    pub(crate) blas_builder: AccelBuilder,
    pub(crate) tlas_builder: AccelBuilder,
    /// Indexed like `GeometryClass::STATIC`.
    pub(crate) static_groups: SmallVec<[Option<GeometryGroup<B>>; 2]>,
    /// Static geometry generation the groups were built from.
    pub(crate) static_generation: u64,
    pub(crate) dynamic_groups: Vec<GeometryGroup<B>>,
    pub(crate) instance_buffer: Option<DeviceBuffer<B>>,
    pub(crate) tlas: Option<B::Tlas>,
    pub(crate) last_instance_count: u32,
    /// Geometry indices holding live bindings; the rest hold dummies.
    pub(crate) bound_geometries: u32,
    pub(crate) dummy: DeviceBuffer<B>,
    texture_versions: Vec<u64>,
    texture_generation: u64,
    fence: Option<B::Fence>,
    frames: u64,
}

impl<B: RtBackend> FrameSlot<B> {
    fn create(
        backend: &mut B,
        index: usize,
        layout: BindingLayout,
        dummy: &DeviceBuffer<B>,
        textures: &TextureRegistry<B>,
    ) -> Result<Self> {
        let mut binding_table = backend.create_binding_table(layout, &format!("frame_slot_{index}"))?;
        let binding = GeometryBinding::<B>::dummy(dummy.raw());
        for i in 0..layout.max_geometries {
            backend.write_geometry_binding(&mut binding_table, i, &binding)?;
        }
        backend.write_tlas_binding(&mut binding_table, None)?;

        let mut texture_versions = vec![u64::MAX; layout.max_textures as usize];
        textures.sync_table(backend, &mut binding_table, &mut texture_versions)?;
        debug!(index, ?layout, "frame slot created");

        Ok(Self {
            index,
            binding_table,
            blas_builder: AccelBuilder::new(Stage::AccelBuild),
            tlas_builder: AccelBuilder::new(Stage::Shader),
            static_groups: SmallVec::from_iter([None, None]),
            static_generation: 0,
            dynamic_groups: Vec::new(),
            instance_buffer: None,
            tlas: None,
            last_instance_count: 0,
            bound_geometries: 0,
            dummy: dummy.clone(),
            texture_versions,
            texture_generation: textures.generation(),
            fence: None,
            frames: 0,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn binding_table(&self) -> &B::BindingTable {
        &self.binding_table
    }

    /// Top-level BVH of the last frame assembled in this slot.
    pub fn tlas(&self) -> Option<&B::Tlas> {
        self.tlas.as_ref()
    }

    pub fn last_instance_count(&self) -> u32 {
        self.last_instance_count
    }

    /// Frames submitted from this slot.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Static then dynamic groups, in instance order.
    pub fn groups(&self) -> impl Iterator<Item = &GeometryGroup<B>> {
        self.static_groups.iter().flatten().chain(self.dynamic_groups.iter())
    }

    pub fn live_groups(&self) -> usize {
        self.static_groups.iter().flatten().count() + self.dynamic_groups.len()
    }

    pub fn static_group(&self, index: usize) -> Option<&GeometryGroup<B>> {
        self.static_groups.get(index).and_then(Option::as_ref)
    }

    pub fn dynamic_groups(&self) -> &[GeometryGroup<B>] {
        &self.dynamic_groups
    }

    /// Drop everything a failed frame may have left half-built. The next
    /// acquire rebuilds static groups and the TLAS from scratch; bindings of
    /// previously live indices are replaced by the dummy on the next
    /// assembly.
    fn invalidate(&mut self, backend: &mut B) -> Result<()> {
        self.static_groups.iter_mut().for_each(|g| *g = None);
        self.static_generation = u64::MAX;
        self.dynamic_groups.clear();
        self.tlas = None;
        self.last_instance_count = 0;
        self.blas_builder.reset();
        self.tlas_builder.reset();
        backend.write_tlas_binding(&mut self.binding_table, None)
    }

    fn sync_textures(&mut self, backend: &mut B, textures: &TextureRegistry<B>) -> Result<()> {
        if self.texture_generation == textures.generation() {
            return Ok(());
        }
        let written = textures.sync_table(backend, &mut self.binding_table, &mut self.texture_versions)?;
        self.texture_generation = textures.generation();
        trace!(slot = self.index, written, "textures rebound");
        Ok(())
    }
}

/// Arena of frame slots indexed by ring position.
pub struct FrameResourcePool<B: RtBackend> {
    slots: Vec<Option<FrameSlot<B>>>,
    current: usize,
    /// The current slot was handed out and not yet submitted.
    acquired: bool,
    layout: BindingLayout,
    /// Bound at every unused geometry index.
    dummy: DeviceBuffer<B>,
}

impl<B: RtBackend> FrameResourcePool<B> {
    pub fn new(backend: &mut B, ring_depth: u32, layout: BindingLayout) -> Result<Self> {
        if ring_depth == 0 {
            return Err(Error::invalid_config("ring depth must be at least 1"));
        }
        let usage = BufferUsage::STORAGE | BufferUsage::TRANSFER_DST;
        let raw = backend.create_buffer(MIN_BUFFER_SIZE, usage, "dummy_geometry")?;
        backend.fill_zero(&raw)?;
        backend.buffer_barrier(&raw, Stage::Transfer, Stage::Shader);
        let mut slots = Vec::new();
        slots.resize_with(ring_depth as usize, || None);
        Ok(Self {
            slots,
            current: 0,
            acquired: false,
            layout,
            dummy: DeviceBuffer::new(raw, MIN_BUFFER_SIZE, usage),
        })
    }

    pub fn ring_depth(&self) -> usize {
        self.slots.len()
    }

    /// Ring position the next `acquire_slot` returns.
    pub fn current(&self) -> usize {
        self.current
    }

    pub fn layout(&self) -> BindingLayout {
        self.layout
    }

    pub fn dummy(&self) -> &DeviceBuffer<B> {
        &self.dummy
    }

    pub fn slot(&self, index: usize) -> Option<&FrameSlot<B>> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Wait for the current ring position's previous submission, then
    /// return its slot, creating it on first use.
    ///
    /// The only call that blocks the frame loop.
    pub fn acquire_slot(&mut self, backend: &mut B, textures: &TextureRegistry<B>) -> Result<&mut FrameSlot<B>> {
        let index = self.current;
        if self.slots[index].is_none() {
            let created = FrameSlot::create(backend, index, self.layout, &self.dummy, textures)?;
            self.slots[index] = Some(created);
        }
        let slot = self.slots[index]
            .as_mut()
            .ok_or_else(|| Error::backend(format!("frame slot {index} missing")))?;
        if let Some(fence) = slot.fence.take() {
            let _span = tracing::trace_span!("wait_slot", index).entered();
            backend.wait(&fence)?;
        }
        self.acquired = true;
        slot.sync_textures(backend, textures)?;
        Ok(slot)
    }

    /// Close the current frame: submit, remember the fence in the slot and
    /// advance the ring. Returns the submitted slot's index.
    pub fn submit(&mut self, backend: &mut B) -> Result<usize> {
        let index = self.current;
        let fence = backend.submit()?;
        if let Some(slot) = self.slots[index].as_mut() {
            slot.fence = Some(fence);
            slot.frames += 1;
        }
        self.acquired = false;
        self.current = (index + 1) % self.slots.len();
        Ok(index)
    }

    /// Throw away the frame recorded since the last submit. The ring does
    /// not advance. A slot that was acquired is invalidated; one that was
    /// not may still be read by its previous submission and stays as is.
    pub fn abandon(&mut self, backend: &mut B) -> Result<()> {
        backend.discard();
        if !std::mem::take(&mut self.acquired) {
            return Ok(());
        }
        match self.slots[self.current].as_mut() {
            Some(slot) => slot.invalidate(backend),
            None => Ok(()),
        }
    }

    /// Wait for every outstanding submission.
    pub fn wait_idle(&mut self, backend: &mut B) -> Result<()> {
        for slot in self.slots.iter_mut().flatten() {
            if let Some(fence) = slot.fence.take() {
                backend.wait(&fence)?;
            }
        }
        Ok(())
    }

    /// Slots created so far.
    pub fn created(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HostBackend, HostCommand};

    fn setup(depth: u32) -> (HostBackend, TextureRegistry<HostBackend>, FrameResourcePool<HostBackend>) {
        let mut backend = HostBackend::new();
        let textures = TextureRegistry::new(&mut backend, 4).unwrap();
        let layout = BindingLayout { max_geometries: 3, max_textures: 4 };
        let pool = FrameResourcePool::new(&mut backend, depth, layout).unwrap();
        (backend, textures, pool)
    }

    #[test]
    fn test_lazy_creation_with_dummies() {
        let (mut backend, textures, mut pool) = setup(3);
        assert_eq!(pool.created(), 0);
        let dummy_id = pool.dummy().raw().id();

        let slot = pool.acquire_slot(&mut backend, &textures).unwrap();
        for i in 0..3 {
            assert_eq!(slot.binding_table().geometry(i).unwrap().vertices, dummy_id);
        }
        assert_eq!(slot.binding_table().texture(3), Some(textures.dummy().id));
        assert!(slot.binding_table().tlas().is_none());
        pool.submit(&mut backend).unwrap();
        assert_eq!(pool.created(), 1);
        assert_eq!(pool.current(), 1);
    }

    #[test]
    fn test_acquire_waits_on_own_fence() {
        let (mut backend, textures, mut pool) = setup(2);
        for _ in 0..2 {
            pool.acquire_slot(&mut backend, &textures).unwrap();
            pool.submit(&mut backend).unwrap();
        }
        backend.take_log();

        // Ring wrapped: slot 0 must wait for submission 1 only
        pool.acquire_slot(&mut backend, &textures).unwrap();
        let waits: Vec<_> = backend
            .log()
            .iter()
            .filter_map(|c| match c {
                HostCommand::Wait { submission } => Some(*submission),
                _ => None,
            })
            .collect();
        assert_eq!(waits, vec![1]);
        assert_eq!(backend.in_flight(), 1);
    }

    #[test]
    fn test_wait_idle() {
        let (mut backend, textures, mut pool) = setup(3);
        for _ in 0..3 {
            pool.acquire_slot(&mut backend, &textures).unwrap();
            pool.submit(&mut backend).unwrap();
        }
        assert_eq!(backend.in_flight(), 3);
        pool.wait_idle(&mut backend).unwrap();
        assert_eq!(backend.in_flight(), 0);
        assert_eq!(backend.stats().hazards, 0);
    }

    #[test]
    fn test_textures_rebound_on_acquire() {
        let (mut backend, mut textures, mut pool) = setup(2);
        for _ in 0..2 {
            pool.acquire_slot(&mut backend, &textures).unwrap();
            pool.submit(&mut backend).unwrap();
        }
        textures.insert(&mut backend, 1, 1, 1, &[9; 4]).unwrap();
        let id = textures.get(1).id;

        let slot = pool.acquire_slot(&mut backend, &textures).unwrap();
        assert_eq!(slot.binding_table().texture(1), Some(id));
        pool.submit(&mut backend).unwrap();
        // Slot 1 still points at the dummy until acquired
        assert_eq!(pool.slot(1).unwrap().binding_table().texture(1), Some(textures.dummy().id));
        assert_eq!(backend.stats().hazards, 0);
    }

    #[test]
    fn test_accel_builder_flush() {
        let mut backend = HostBackend::new();
        let mut builder = AccelBuilder::new(Stage::AccelBuild);
        assert_eq!(builder.flush(&mut backend), 0);
        builder.queue();
        builder.queue();
        assert_eq!(builder.flush(&mut backend), 2);
        assert_eq!(backend.stats().barriers, 1);
        builder.queue();
        builder.reset();
        assert_eq!(builder.flush(&mut backend), 0);
        assert_eq!(backend.stats().barriers, 1);
    }

    #[test]
    fn test_abandon_keeps_ring_position() {
        let (mut backend, textures, mut pool) = setup(2);
        let slot = pool.acquire_slot(&mut backend, &textures).unwrap();
        slot.static_generation = 3;
        slot.last_instance_count = 2;
        pool.abandon(&mut backend).unwrap();

        assert_eq!(pool.current(), 0);
        assert_eq!(backend.stats().submissions, 0);
        assert!(backend.log().contains(&HostCommand::Discard { submission: 1 }));
        let slot = pool.slot(0).unwrap();
        assert_eq!(slot.static_generation, u64::MAX);
        assert_eq!(slot.last_instance_count(), 0);
        assert!(slot.binding_table().tlas().is_none());
        assert_eq!(slot.frames(), 0);

        // Not acquired: the slot in flight is left alone
        pool.acquire_slot(&mut backend, &textures).unwrap();
        pool.submit(&mut backend).unwrap();
        pool.abandon(&mut backend).unwrap();
        assert_eq!(pool.current(), 1);
        assert_eq!(backend.stats().discards, 2);
        assert_eq!(backend.stats().hazards, 0);
    }
}
