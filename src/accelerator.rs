//! Per-frame orchestration.
//!
//! [`SceneAccelerator::render_frame`] runs the whole pipeline for one frame:
//!
//! 1. clear fast path when no world is loaded
//! 2. cache run iteration (zero-fill at iteration 0)
//! 3. acquire the ring slot, waiting on its previous fence
//! 4. static groups, rebuilt when the slot's static generation is stale
//! 5. dynamic group, nearest-fit matched against the slot's previous groups
//! 6. top-level assembly and binding publication
//! 7. submit
//!
//! Every resource written in steps 4-6 belongs to the acquired slot, so a
//! frame never touches memory a frame still in flight reads.
//!
//! A frame that fails after recording started is abandoned: the recording is
//! discarded, the cache run iteration rewinds and the acquired slot drops its
//! groups and TLAS, so the next frame rebuilds it from scratch.

use tracing::{debug, info, info_span, instrument, trace, warn};

use crate::backend::{BindingLayout, RtBackend};
use crate::buffer_cache::{BufferCacheStats, DeviceBufferCache};
use crate::config::AccelConfig;
use crate::events::EngineEvents;
use crate::frame::{FrameResourcePool, FrameSlot};
use crate::geometry::{
    build_or_update, extract_parallel, BuildDecision, BuildParams, GeometryArrays, GeometryClass, GeometryGroup,
    GeometrySlotMatcher,
};
use crate::persistent_cache::{CacheBindings, CacheState, PersistentCacheBuffers};
use crate::textures::TextureRegistry;
use crate::top_level::{TlasDecision, TopLevelAssembler};
use crate::util::{Error, Result};

/// World geometry that only changes on reload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaticGeometry {
    pub opaque: GeometryArrays,
    pub transparent: GeometryArrays,
}

impl StaticGeometry {
    fn into_classes(self) -> [GeometryArrays; 2] {
        [self.opaque, self.transparent]
    }
}

/// Everything the engine hands over for one frame.
#[derive(Debug, Clone, Default)]
pub struct FrameInput {
    /// False while no world is loaded; the frame is cleared without any
    /// geometry work.
    pub world_loaded: bool,
    /// Animated geometry of this frame, merged into one group.
    pub dynamic: GeometryArrays,
    /// New static geometry, typically on the first frame after a reload.
    pub static_geometry: Option<StaticGeometry>,
    /// Rebuild the dynamic BVH even if its topology is unchanged.
    pub force_rebuild: bool,
}

/// Result of a frame with a non-empty scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneFrame {
    pub frame: u64,
    /// Ring slot holding this frame's binding table and TLAS.
    pub slot: usize,
    /// Iteration within the current cache run.
    pub run_iteration: u64,
    pub instance_count: u32,
    pub tlas: TlasDecision,
    /// `None` when the frame had no dynamic geometry.
    pub dynamic: Option<BuildDecision>,
    pub fast_recovery: bool,
}

/// What the kernels should do with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutput {
    /// Trace the published scene.
    Scene(SceneFrame),
    /// Output a cleared image. `slot` is set when a slot was submitted with
    /// an empty TLAS.
    Cleared { frame: u64, slot: Option<usize> },
}

impl FrameOutput {
    pub fn frame(&self) -> u64 {
        match self {
            FrameOutput::Scene(scene) => scene.frame,
            FrameOutput::Cleared { frame, .. } => *frame,
        }
    }

    pub fn slot(&self) -> Option<usize> {
        match self {
            FrameOutput::Scene(scene) => Some(scene.slot),
            FrameOutput::Cleared { slot, .. } => *slot,
        }
    }

    pub fn is_cleared(&self) -> bool {
        matches!(self, FrameOutput::Cleared { .. })
    }
}

/// Frame loop counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccelStats {
    pub frames: u64,
    pub cleared_frames: u64,
    pub static_builds: u64,
    pub dynamic_builds: u64,
    pub dynamic_updates: u64,
    pub dynamic_rebuilds: u64,
    pub tlas_rebuilds: u64,
    pub tlas_refits: u64,
    pub world_reloads: u64,
    pub reconnects: u64,
    /// Frames that failed after recording started and were discarded.
    pub abandoned_frames: u64,
}

impl AccelStats {
    fn count_dynamic(&mut self, decision: BuildDecision) {
        match decision {
            BuildDecision::Build => self.dynamic_builds += 1,
            BuildDecision::Update => self.dynamic_updates += 1,
            BuildDecision::Rebuild => self.dynamic_rebuilds += 1,
        }
    }
}

/// Owns the backend and every per-frame and persistent resource.
pub struct SceneAccelerator<B: RtBackend> {
    backend: B,
    config: AccelConfig,
    pool: FrameResourcePool<B>,
    caches: PersistentCacheBuffers<B>,
    textures: TextureRegistry<B>,
    buffers: DeviceBufferCache,
    buffer_totals: BufferCacheStats,
    assembler: TopLevelAssembler,
    /// Retained static arrays, indexed like `GeometryClass::STATIC`.
    static_arrays: [GeometryArrays; 2],
    static_generation: u64,
    frame: u64,
    stats: AccelStats,
}

fn binding_layout(config: &AccelConfig) -> BindingLayout {
    BindingLayout {
        max_geometries: config.max_instances,
        max_textures: config.max_textures,
    }
}

impl<B: RtBackend> SceneAccelerator<B> {
    /// Validate `config` and allocate the persistent resources. Frame slots
    /// are created lazily.
    pub fn new(mut backend: B, config: AccelConfig) -> Result<Self> {
        config.validate()?;
        let textures = TextureRegistry::new(&mut backend, config.max_textures)?;
        let caches = PersistentCacheBuffers::new(&mut backend, &config.cache)?;
        let pool = FrameResourcePool::new(&mut backend, config.ring_depth, binding_layout(&config))?;
        info!(
            ring_depth = config.ring_depth,
            max_instances = config.max_instances,
            max_textures = config.max_textures,
            "scene accelerator ready"
        );
        Ok(Self {
            backend,
            assembler: TopLevelAssembler::new(config.max_instances),
            config,
            pool,
            caches,
            textures,
            buffers: DeviceBufferCache::new(),
            buffer_totals: BufferCacheStats::default(),
            static_arrays: Default::default(),
            static_generation: 0,
            frame: 0,
            stats: AccelStats::default(),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn config(&self) -> &AccelConfig {
        &self.config
    }

    pub fn stats(&self) -> AccelStats {
        self.stats
    }

    /// Buffer cache counters since creation.
    pub fn buffer_stats(&self) -> BufferCacheStats {
        let mut totals = self.buffer_totals;
        totals += self.buffers.stats();
        totals
    }

    /// Frames rendered so far, cleared ones included.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn cache_state(&self) -> CacheState {
        self.caches.state()
    }

    pub fn cache_bindings(&self) -> CacheBindings<'_, B> {
        self.caches.bindings()
    }

    pub fn textures(&self) -> &TextureRegistry<B> {
        &self.textures
    }

    /// Slot published by a previous [`render_frame`](Self::render_frame).
    pub fn slot(&self, index: usize) -> Option<&FrameSlot<B>> {
        self.pool.slot(index)
    }

    pub fn ring_depth(&self) -> usize {
        self.pool.ring_depth()
    }

    /// Run `extract` over `entities` on the configured number of workers.
    pub fn extract<E, F>(&self, entities: &[E], extract: F) -> GeometryArrays
    where
        E: Sync,
        F: Fn(&E, &mut GeometryArrays) + Sync,
    {
        let workers = match self.config.extraction_workers {
            0 => rayon::current_num_threads(),
            n => n,
        };
        extract_parallel(entities, workers, extract)
    }

    /// Replace the retained static geometry. Every slot rebuilds its static
    /// groups the next time it is acquired.
    pub fn set_static_geometry(&mut self, geometry: StaticGeometry) -> Result<()> {
        geometry.opaque.validate()?;
        geometry.transparent.validate()?;
        self.static_arrays = geometry.into_classes();
        self.static_generation += 1;
        debug!(
            generation = self.static_generation,
            opaque = self.static_arrays[0].primitive_count(),
            transparent = self.static_arrays[1].primitive_count(),
            "static geometry"
        );
        Ok(())
    }

    /// Build and submit one frame.
    #[instrument(skip_all, fields(frame = self.frame))]
    pub fn render_frame(&mut self, input: FrameInput) -> Result<FrameOutput> {
        let frame = self.frame;
        self.frame += 1;
        self.stats.frames += 1;

        let FrameInput { world_loaded, dynamic, static_geometry, force_rebuild } = input;
        if let Some(geometry) = static_geometry {
            self.set_static_geometry(geometry)?;
        }
        if !world_loaded {
            self.stats.cleared_frames += 1;
            trace!("no world, cleared");
            return Ok(FrameOutput::Cleared { frame, slot: None });
        }
        dynamic.validate()?;

        // Reject before recording anything into the submission
        let planned = self.static_arrays.iter().filter(|a| !a.is_empty()).count() + usize::from(!dynamic.is_empty());
        self.assembler.check_capacity(planned)?;

        let resume = self.caches.state();
        match self.record_frame(frame, dynamic, force_rebuild) {
            Ok(output) => Ok(output),
            Err(error) => {
                self.abandon_frame(resume, &error);
                Err(error)
            }
        }
    }

    /// Everything of a frame that records commands, up to and including
    /// the submit.
    fn record_frame(&mut self, frame: u64, dynamic: GeometryArrays, force_rebuild: bool) -> Result<FrameOutput> {
        let run_iteration = self.caches.begin_frame(&mut self.backend)?;
        let slot = self.pool.acquire_slot(&mut self.backend, &self.textures)?;

        if slot.static_generation != self.static_generation {
            let _span = info_span!("static_rebuild", generation = self.static_generation).entered();
            for (k, class) in GeometryClass::STATIC.into_iter().enumerate() {
                let previous = slot.static_groups[k].take();
                let params = BuildParams::for_class(class, frame).force_rebuild(true);
                let group =
                    build_or_update(&mut self.backend, &mut self.buffers, &self.static_arrays[k], previous, params)?;
                if group.is_some() {
                    slot.blas_builder.queue();
                    self.stats.static_builds += 1;
                }
                slot.static_groups[k] = group;
            }
            slot.static_generation = self.static_generation;
        }

        let dynamic_decision = {
            let mut matcher: GeometrySlotMatcher<B> = slot.dynamic_groups.drain(..).collect();
            let counts = (dynamic.vertex_count(), dynamic.primitive_count());
            let previous = if dynamic.is_empty() { None } else { matcher.take_best(counts.0, counts.1) };
            let aged = previous
                .as_ref()
                .is_some_and(|g| g.refit_age(frame) > self.config.dynamic_rebuild_interval);
            let force = force_rebuild || aged;
            let decision = BuildDecision::decide(previous.as_ref().map(GeometryGroup::counts), counts, force);
            if !matcher.is_empty() {
                trace!(released = matcher.len(), "unmatched dynamic groups");
            }
            drop(matcher);

            let params = BuildParams::for_class(GeometryClass::Dynamic, frame).force_rebuild(force);
            match build_or_update(&mut self.backend, &mut self.buffers, &dynamic, previous, params)? {
                Some(group) => {
                    slot.dynamic_groups.push(group);
                    slot.blas_builder.queue();
                    self.stats.count_dynamic(decision);
                    Some(decision)
                }
                None => None,
            }
        };
        slot.blas_builder.flush(&mut self.backend);

        let tlas = self.assembler.assemble(&mut self.backend, &mut self.buffers, slot)?;
        let instance_count = slot.last_instance_count();
        match tlas {
            TlasDecision::Refit => self.stats.tlas_refits += 1,
            TlasDecision::Rebuild => self.stats.tlas_rebuilds += 1,
            TlasDecision::Empty => {}
        }

        let slot = self.pool.submit(&mut self.backend)?;
        let buffers = self.buffers.take_stats();
        self.buffer_totals += buffers;
        debug!(?buffers, "frame buffers");
        if tlas == TlasDecision::Empty {
            self.stats.cleared_frames += 1;
            return Ok(FrameOutput::Cleared { frame, slot: Some(slot) });
        }
        Ok(FrameOutput::Scene(SceneFrame {
            frame,
            slot,
            run_iteration,
            instance_count,
            tlas,
            dynamic: dynamic_decision,
            fast_recovery: self.caches.config().fast_recovery,
        }))
    }

    fn abandon_frame(&mut self, resume: CacheState, error: &Error) {
        if let CacheState::Running { iteration } = resume {
            self.caches.rewind(iteration);
        }
        if let Err(e) = self.pool.abandon(&mut self.backend) {
            warn!(error = %e, "slot reset after failed frame");
        }
        self.buffer_totals += self.buffers.take_stats();
        self.stats.abandoned_frames += 1;
        warn!(%error, "frame abandoned");
    }

    /// Apply a new configuration.
    ///
    /// `dynamic_rebuild_interval` and `extraction_workers` apply in place.
    /// Any other change waits for the device to go idle and reallocates
    /// every slot and cache buffer from empty state. Returns whether that
    /// happened.
    pub fn reconfigure(&mut self, config: AccelConfig) -> Result<bool> {
        config.validate()?;
        if !self.config.requires_reconnect(&config) {
            self.config = config;
            return Ok(false);
        }
        match self.caches.resize(&config.cache) {
            Ok(()) => info!("reconnecting"),
            Err(Error::NeedsReconnect(reason)) => info!(%reason, "reconnecting"),
            Err(e) => return Err(e),
        }
        self.reconnect(config)?;
        Ok(true)
    }

    fn reconnect(&mut self, config: AccelConfig) -> Result<()> {
        let _span = info_span!("reconnect").entered();
        self.pool.wait_idle(&mut self.backend)?;

        if config.max_textures != self.config.max_textures {
            if !self.textures.is_empty() {
                warn!(dropped = self.textures.len(), "texture table resized, textures must be sent again");
            }
            self.textures = TextureRegistry::new(&mut self.backend, config.max_textures)?;
        }
        self.pool = FrameResourcePool::new(&mut self.backend, config.ring_depth, binding_layout(&config))?;
        self.caches.reconnect(&mut self.backend, &config.cache)?;
        self.assembler = TopLevelAssembler::new(config.max_instances);
        self.config = config;
        self.stats.reconnects += 1;
        Ok(())
    }

    /// Block until every submitted frame has completed.
    pub fn wait_idle(&mut self) -> Result<()> {
        self.pool.wait_idle(&mut self.backend)
    }
}

impl<B: RtBackend> EngineEvents for SceneAccelerator<B> {
    /// Drop the retained static geometry and start a new cache run.
    fn on_world_reloaded(&mut self) -> Result<()> {
        self.static_arrays = Default::default();
        self.static_generation += 1;
        self.caches.restart_run();
        self.stats.world_reloads += 1;
        info!(generation = self.static_generation, "world reloaded");
        Ok(())
    }

    fn on_texture_ready(&mut self, id: u32, width: u32, height: u32, pixels: &[u8]) -> Result<()> {
        self.textures.insert(&mut self.backend, id, width, height, pixels)
    }
}

impl<B: RtBackend> Drop for SceneAccelerator<B> {
    fn drop(&mut self) {
        if let Err(e) = self.pool.wait_idle(&mut self.backend) {
            warn!(error = %e, "wait on drop failed");
        }
    }
}
