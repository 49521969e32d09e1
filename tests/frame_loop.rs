//! Frame loop decisions observed through the host backend.

use rtaccel::backend::host::{HostBindingTable, HostBlas, HostBuffer, HostFence, HostTexture, HostTlas};
use rtaccel::backend::{
    BindingLayout, BlasGeometry, BufferUsage, BuildFlags, BuildMode, GeometryBinding, HostBackend, HostCommand,
    RtBackend, Stage, TlasMode,
};
use rtaccel::geometry::{BuildDecision, GeometryArrays, TriangleAttributes};
use rtaccel::persistent_cache::CacheState;
use rtaccel::top_level::TlasDecision;
use rtaccel::{
    AccelConfig, CacheConfig, EngineAdapter, EngineEvents, Error, FrameInput, FrameOutput, SceneAccelerator,
    SceneFrame, StaticGeometry,
};

fn strip(quads: u32, z: f32) -> GeometryArrays {
    let mut a = GeometryArrays::new();
    for q in 0..quads {
        let x = q as f32;
        let base = a.vertex_count();
        for (dx, dy) in [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)] {
            a.positions.extend_from_slice(&[x + dx, dy, z]);
        }
        a.indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        a.attributes.extend_from_slice(&[TriangleAttributes::default(); 2]);
    }
    a.prev_positions = a.positions.clone();
    a
}

fn accel_with(config: AccelConfig) -> SceneAccelerator<HostBackend> {
    SceneAccelerator::new(HostBackend::new(), config).unwrap()
}

fn accel(ring_depth: u32) -> SceneAccelerator<HostBackend> {
    accel_with(AccelConfig { ring_depth, cache: CacheConfig::small(), ..Default::default() })
}

fn loaded(dynamic: GeometryArrays) -> FrameInput {
    FrameInput { world_loaded: true, dynamic, ..Default::default() }
}

fn with_static(dynamic: GeometryArrays, opaque: GeometryArrays) -> FrameInput {
    FrameInput {
        static_geometry: Some(StaticGeometry { opaque, transparent: GeometryArrays::new() }),
        ..loaded(dynamic)
    }
}

fn scene(accel: &mut SceneAccelerator<HostBackend>, input: FrameInput) -> SceneFrame {
    match accel.render_frame(input).unwrap() {
        FrameOutput::Scene(scene) => scene,
        other => panic!("expected a scene, got {other:?}"),
    }
}

#[test]
fn test_dynamic_update_vs_rebuild() {
    let mut accel = accel(1);

    assert_eq!(scene(&mut accel, loaded(strip(4, 0.0))).dynamic, Some(BuildDecision::Build));
    // Same topology, moved vertices
    assert_eq!(scene(&mut accel, loaded(strip(4, 0.5))).dynamic, Some(BuildDecision::Update));

    let forced = FrameInput { force_rebuild: true, ..loaded(strip(4, 1.0)) };
    assert_eq!(scene(&mut accel, forced).dynamic, Some(BuildDecision::Rebuild));

    // Topology change
    assert_eq!(scene(&mut accel, loaded(strip(5, 1.0))).dynamic, Some(BuildDecision::Build));

    let stats = accel.stats();
    assert_eq!(
        (stats.dynamic_builds, stats.dynamic_updates, stats.dynamic_rebuilds),
        (2, 1, 1)
    );
    let group = &accel.slot(0).unwrap().dynamic_groups()[0];
    assert_eq!(group.counts(), (20, 10));
}

#[test]
fn test_periodic_rebuild_of_refitted_bvh() {
    let mut accel = accel_with(AccelConfig {
        ring_depth: 1,
        dynamic_rebuild_interval: 3,
        cache: CacheConfig::small(),
        ..Default::default()
    });
    let decisions: Vec<_> = (0..6)
        .map(|f| scene(&mut accel, loaded(strip(2, f as f32))).dynamic.unwrap())
        .collect();
    use BuildDecision::*;
    assert_eq!(decisions, vec![Build, Update, Update, Update, Rebuild, Update]);
    assert_eq!(accel.slot(0).unwrap().dynamic_groups()[0].last_rebuild_iteration, 4);
}

#[test]
fn test_tlas_refit_compares_same_slot() {
    let mut accel = accel(2);
    let tlas = |accel: &mut SceneAccelerator<HostBackend>, input| scene(accel, input).tlas;

    // First use of each slot builds
    assert_eq!(tlas(&mut accel, loaded(strip(2, 0.0))), TlasDecision::Rebuild);
    assert_eq!(tlas(&mut accel, loaded(strip(2, 0.1))), TlasDecision::Rebuild);
    // Slot 0 again, one instance as before
    assert_eq!(tlas(&mut accel, loaded(strip(2, 0.2))), TlasDecision::Refit);

    // Static geometry appears on slot 1: two instances
    assert_eq!(tlas(&mut accel, with_static(strip(2, 0.3), strip(8, -1.0))), TlasDecision::Rebuild);
    // Slot 0 last had one instance, even though the previous frame had two
    assert_eq!(tlas(&mut accel, loaded(strip(2, 0.4))), TlasDecision::Rebuild);
    assert_eq!(tlas(&mut accel, loaded(strip(2, 0.5))), TlasDecision::Refit);

    let stats = accel.stats();
    assert_eq!((stats.tlas_rebuilds, stats.tlas_refits), (4, 2));
    assert_eq!(accel.backend().stats().tlas_refits, 2);
}

#[test]
fn test_instances_and_bindings() {
    let mut accel = accel(1);
    let frame = scene(&mut accel, with_static(strip(3, 0.0), strip(8, -1.0)));
    assert_eq!(frame.instance_count, 2);

    let slot = accel.slot(frame.slot).unwrap();
    let tlas = slot.tlas().unwrap();
    assert_eq!(tlas.instance_count(), 2);
    for (i, inst) in tlas.instances().iter().enumerate() {
        assert_eq!(inst.custom_index(), i as u32);
        assert_eq!(inst.mask(), 0xFF);
    }

    let table = slot.binding_table();
    assert_eq!(table.tlas(), Some(tlas.id()));
    let groups: Vec<_> = slot.groups().collect();
    assert_eq!(table.geometry(0).unwrap().vertices, groups[0].vertices.raw().id());
    assert_eq!(table.geometry(1).unwrap().vertices, groups[1].vertices.raw().id());
    // Unused indices up to max_instances hold the dummy
    let dummy = table.geometry(2).unwrap().vertices;
    assert!((2..16).all(|i| table.geometry(i).unwrap().vertices == dummy));
}

#[test]
fn test_capacity_exceeded_rejects_frame() {
    let mut accel = accel_with(AccelConfig {
        max_instances: 1,
        ring_depth: 1,
        cache: CacheConfig::small(),
        ..Default::default()
    });
    let err = accel.render_frame(with_static(strip(1, 0.0), strip(4, -1.0))).unwrap_err();
    assert!(matches!(err, Error::CapacityExceeded { live: 2, max: 1 }));
    assert!(err.is_fatal());
    assert_eq!(accel.backend().stats().submissions, 0);
    assert_eq!(accel.backend().stats().blas_builds, 0);

    // Static geometry alone fits
    let frame = scene(&mut accel, loaded(GeometryArrays::new()));
    assert_eq!(frame.instance_count, 1);
    assert_eq!(frame.dynamic, None);
}

#[test]
fn test_empty_scene_clears_tlas() {
    let mut accel = accel(1);
    scene(&mut accel, loaded(strip(2, 0.0)));

    let out = accel.render_frame(loaded(GeometryArrays::new())).unwrap();
    assert_eq!(out, FrameOutput::Cleared { frame: 1, slot: Some(0) });

    let slot = accel.slot(0).unwrap();
    assert!(slot.tlas().is_none());
    assert_eq!(slot.last_instance_count(), 0);
    assert!(slot.dynamic_groups().is_empty());
    let table = slot.binding_table();
    assert_eq!(table.tlas(), None);
    assert_eq!(table.geometry(0).unwrap().vertices, table.geometry(1).unwrap().vertices);

    // Geometry returns: fresh TLAS, not a refit of the released one
    assert_eq!(scene(&mut accel, loaded(strip(2, 0.0))).tlas, TlasDecision::Rebuild);
}

#[test]
fn test_world_not_loaded_skips_everything() {
    let mut accel = accel(2);
    for frame in 0..3 {
        let input = FrameInput { world_loaded: false, dynamic: strip(4, 0.0), ..Default::default() };
        assert_eq!(accel.render_frame(input).unwrap(), FrameOutput::Cleared { frame, slot: None });
    }
    let host = accel.backend().stats();
    assert_eq!(host.submissions, 0);
    assert_eq!(host.blas_builds, 0);
    assert_eq!(accel.stats().cleared_frames, 3);
    // No run started yet
    assert_eq!(accel.cache_state(), CacheState::Running { iteration: 0 });
}

#[test]
fn test_nearest_fit_reuses_larger_buffers() {
    let mut accel = accel(1);
    scene(&mut accel, loaded(strip(8, 0.0)));
    let vb = accel.slot(0).unwrap().dynamic_groups()[0].vertices.raw().id();
    let allocations = accel.buffer_stats().allocations;

    // Smaller topology: fresh BVH in the previous, larger buffers
    assert_eq!(scene(&mut accel, loaded(strip(5, 0.0))).dynamic, Some(BuildDecision::Build));
    assert_eq!(accel.slot(0).unwrap().dynamic_groups()[0].vertices.raw().id(), vb);
    assert_eq!(accel.buffer_stats().allocations, allocations);

    // Larger than anything pooled: new buffers
    scene(&mut accel, loaded(strip(20, 0.0)));
    assert_ne!(accel.slot(0).unwrap().dynamic_groups()[0].vertices.raw().id(), vb);
}

#[test]
fn test_parallel_extraction_matches_serial() {
    let accel = accel_with(AccelConfig {
        extraction_workers: 4,
        cache: CacheConfig::small(),
        ..Default::default()
    });
    let entities: Vec<u32> = (1..=13).collect();
    let emit = |n: &u32, out: &mut GeometryArrays| out.append(&strip(*n % 3 + 1, *n as f32));

    let parallel = accel.extract(&entities, emit);
    let mut serial = GeometryArrays::new();
    for e in &entities {
        emit(e, &mut serial);
    }
    assert_eq!(parallel, serial);
    assert!(parallel.validate().is_ok());
}

#[test]
fn test_reconfigure() {
    let mut accel = accel(2);
    for f in 0..3 {
        scene(&mut accel, loaded(strip(2, f as f32)));
    }

    let runtime = AccelConfig { dynamic_rebuild_interval: 10, ..accel.config().clone() };
    assert!(!accel.reconfigure(runtime).unwrap());
    assert_eq!(accel.config().dynamic_rebuild_interval, 10);

    // Grid parameters keep every buffer size but still reconnect
    let mut grid = accel.config().clone();
    grid.cache.static_grid_width = 10.0;
    assert!(accel.reconfigure(grid).unwrap());
    assert_eq!(accel.stats().reconnects, 1);
    assert_eq!(accel.cache_state(), CacheState::Running { iteration: 0 });
    assert_eq!(accel.config().cache.static_grid_width, 10.0);
    let frame = scene(&mut accel, loaded(strip(2, 0.0)));
    assert_eq!((frame.slot, frame.run_iteration), (0, 0));
    assert_eq!(frame.dynamic, Some(BuildDecision::Build));

    let mut recovery = accel.config().clone();
    recovery.cache.fast_recovery = !recovery.cache.fast_recovery;
    assert!(accel.reconfigure(recovery).unwrap());
    assert_eq!(accel.stats().reconnects, 2);

    let deeper = AccelConfig { ring_depth: 3, ..accel.config().clone() };
    assert!(accel.reconfigure(deeper).unwrap());
    assert_eq!(accel.ring_depth(), 3);
    assert_eq!(accel.stats().reconnects, 3);

    let frame = scene(&mut accel, loaded(strip(2, 0.0)));
    assert_eq!((frame.slot, frame.run_iteration), (0, 0));
    assert_eq!(frame.dynamic, Some(BuildDecision::Build));

    let invalid = AccelConfig { ring_depth: 0, ..accel.config().clone() };
    assert!(matches!(accel.reconfigure(invalid), Err(Error::InvalidConfig(_))));
    assert_eq!(accel.backend().stats().hazards, 0);
}

#[test]
fn test_engine_adapter_drives_accelerator() {
    let mut adapter = EngineAdapter::new();
    adapter.register(accel(2)).unwrap();
    assert!(matches!(adapter.register(accel(2)), Err(Error::AlreadyRegistered)));

    adapter.texture_ready(3, 2, 2, &[200; 16]).unwrap();
    assert!(adapter.texture_ready(3, 2, 2, &[200; 15]).is_err());

    let accel = adapter.handler_mut().unwrap();
    let frame = scene(accel, loaded(strip(1, 0.0)));
    let texture = accel.textures().get(3).id;
    let slot = accel.slot(frame.slot).unwrap();
    assert_eq!(slot.binding_table().texture(3), Some(texture));
    assert_eq!(slot.binding_table().texture(4), Some(accel.textures().dummy().id));

    accel.on_world_reloaded().unwrap();
    assert_eq!(accel.stats().world_reloads, 1);
}

/// Host backend whose bottom-level builds fail while `fail_blas` is set.
struct FlakyBackend {
    inner: HostBackend,
    fail_blas: bool,
}

impl RtBackend for FlakyBackend {
    type Buffer = HostBuffer;
    type Texture = HostTexture;
    type Blas = HostBlas;
    type Tlas = HostTlas;
    type BindingTable = HostBindingTable;
    type Fence = HostFence;

    fn create_buffer(&mut self, size: u64, usage: BufferUsage, label: &str) -> rtaccel::Result<HostBuffer> {
        self.inner.create_buffer(size, usage, label)
    }

    fn write_buffer(&mut self, buffer: &HostBuffer, offset: u64, data: &[u8]) -> rtaccel::Result<()> {
        self.inner.write_buffer(buffer, offset, data)
    }

    fn fill_zero(&mut self, buffer: &HostBuffer) -> rtaccel::Result<()> {
        self.inner.fill_zero(buffer)
    }

    fn buffer_barrier(&mut self, buffer: &HostBuffer, src: Stage, dst: Stage) {
        self.inner.buffer_barrier(buffer, src, dst)
    }

    fn global_barrier(&mut self, src: Stage, dst: Stage) {
        self.inner.global_barrier(src, dst)
    }

    fn create_blas(&mut self, label: &str) -> rtaccel::Result<HostBlas> {
        self.inner.create_blas(label)
    }

    fn build_blas(
        &mut self,
        blas: &mut HostBlas,
        geometry: &BlasGeometry<'_, Self>,
        flags: BuildFlags,
        mode: BuildMode,
    ) -> rtaccel::Result<()> {
        if self.fail_blas {
            return Err(Error::backend("device lost during BLAS build"));
        }
        let geometry = BlasGeometry::<HostBackend> {
            vertices: geometry.vertices,
            vertex_count: geometry.vertex_count,
            indices: geometry.indices,
            primitive_count: geometry.primitive_count,
        };
        self.inner.build_blas(blas, &geometry, flags, mode)
    }

    fn blas_address(&self, blas: &HostBlas) -> u64 {
        self.inner.blas_address(blas)
    }

    fn create_tlas(&mut self, label: &str) -> rtaccel::Result<HostTlas> {
        self.inner.create_tlas(label)
    }

    fn build_tlas(
        &mut self,
        tlas: &mut HostTlas,
        instances: &HostBuffer,
        instance_count: u32,
        mode: TlasMode,
    ) -> rtaccel::Result<()> {
        self.inner.build_tlas(tlas, instances, instance_count, mode)
    }

    fn create_binding_table(&mut self, layout: BindingLayout, label: &str) -> rtaccel::Result<HostBindingTable> {
        self.inner.create_binding_table(layout, label)
    }

    fn write_geometry_binding(
        &mut self,
        table: &mut HostBindingTable,
        index: u32,
        binding: &GeometryBinding<'_, Self>,
    ) -> rtaccel::Result<()> {
        let binding = GeometryBinding::<HostBackend> {
            vertices: binding.vertices,
            prev_vertices: binding.prev_vertices,
            indices: binding.indices,
            attributes: binding.attributes,
        };
        self.inner.write_geometry_binding(table, index, &binding)
    }

    fn write_tlas_binding(&mut self, table: &mut HostBindingTable, tlas: Option<&HostTlas>) -> rtaccel::Result<()> {
        self.inner.write_tlas_binding(table, tlas)
    }

    fn write_texture_binding(
        &mut self,
        table: &mut HostBindingTable,
        index: u32,
        texture: &HostTexture,
    ) -> rtaccel::Result<()> {
        self.inner.write_texture_binding(table, index, texture)
    }

    fn create_texture(&mut self, width: u32, height: u32, pixels: &[u8], label: &str) -> rtaccel::Result<HostTexture> {
        self.inner.create_texture(width, height, pixels, label)
    }

    fn submit(&mut self) -> rtaccel::Result<HostFence> {
        self.inner.submit()
    }

    fn discard(&mut self) {
        self.inner.discard()
    }

    fn wait(&mut self, fence: &HostFence) -> rtaccel::Result<()> {
        self.inner.wait(fence)
    }
}

#[test]
fn test_failed_frame_is_discarded_and_recovers() {
    let backend = FlakyBackend { inner: HostBackend::new(), fail_blas: false };
    let config = AccelConfig { ring_depth: 1, cache: CacheConfig::small(), ..Default::default() };
    let mut accel = SceneAccelerator::new(backend, config).unwrap();

    accel.render_frame(with_static(strip(2, 0.0), strip(1, 5.0))).unwrap();
    accel.render_frame(loaded(strip(2, 0.1))).unwrap();
    let submitted = accel.backend().inner.stats().submissions;

    accel.backend_mut().fail_blas = true;
    let failed = accel.render_frame(with_static(strip(2, 0.2), strip(3, 5.0)));
    assert!(matches!(failed, Err(Error::Backend(_))));

    let host = &accel.backend().inner;
    assert_eq!(host.stats().submissions, submitted);
    assert_eq!(host.stats().discards, 1);
    assert!(host.log().contains(&HostCommand::Discard { submission: submitted + 1 }));
    assert_eq!(accel.cache_state(), CacheState::Running { iteration: 2 });
    assert_eq!(accel.stats().abandoned_frames, 1);
    let slot = accel.slot(0).unwrap();
    assert!(slot.tlas().is_none());
    assert!(slot.static_group(0).is_none());
    assert!(slot.dynamic_groups().is_empty());
    assert!(slot.binding_table().tlas().is_none());

    accel.backend_mut().fail_blas = false;
    let out = accel.render_frame(loaded(strip(2, 0.3))).unwrap();
    let FrameOutput::Scene(recovered) = out else {
        panic!("expected a scene, got {out:?}");
    };
    assert_eq!(recovered.run_iteration, 2);
    assert_eq!(recovered.tlas, TlasDecision::Rebuild);
    assert_eq!(recovered.dynamic, Some(BuildDecision::Build));
    assert_eq!(recovered.instance_count, 2);
    let slot = accel.slot(0).unwrap();
    assert_eq!(slot.static_group(0).map(|g| g.counts()), Some((12, 6)));
    assert_eq!(accel.stats().static_builds, 2);
    assert_eq!(accel.backend().inner.stats().submissions, submitted + 1);
    assert_eq!(accel.backend().inner.stats().hazards, 0);
}
