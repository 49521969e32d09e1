//! Frames in flight never observe each other's writes.
//!
//! The host backend counts a hazard whenever the host mutates a buffer or
//! binding table still referenced by a submission nobody waited on.

use rtaccel::backend::host::HostBuffer;
use rtaccel::backend::{HostBackend, HostCommand, Stage};
use rtaccel::geometry::{GeometryArrays, TriangleAttributes};
use rtaccel::persistent_cache::CacheState;
use rtaccel::{AccelConfig, CacheConfig, EngineEvents, FrameInput, FrameOutput, RtBackend, SceneAccelerator, StaticGeometry};

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

fn accel(ring_depth: u32) -> SceneAccelerator<HostBackend> {
    let config = AccelConfig { ring_depth, cache: CacheConfig::small(), ..Default::default() };
    SceneAccelerator::new(HostBackend::new(), config).unwrap()
}

fn statics(rows: u32) -> Option<StaticGeometry> {
    let mut opaque = GeometryArrays::new();
    for r in 0..rows {
        opaque.append(&strip(4, -(r as f32)));
    }
    Some(StaticGeometry { opaque, transparent: strip(1, 3.0) })
}

/// Animated scene with topology changes, forced rebuilds, empty frames, a
/// texture upload and a world reload.
fn run_scene(accel: &mut SceneAccelerator<HostBackend>, frames: u64) {
    for f in 0..frames {
        if f == 10 {
            accel.on_texture_ready(7, 2, 2, &[40; 16]).unwrap();
        }
        if f == 20 {
            accel.on_world_reloaded().unwrap();
        }
        let quads = if (35..38).contains(&f) { 0 } else { 3 + (f / 7 % 3) as u32 };
        let input = FrameInput {
            world_loaded: true,
            dynamic: strip(quads, f as f32 * 0.1),
            static_geometry: match f {
                0 => statics(2),
                20 => statics(3),
                _ => None,
            },
            force_rebuild: f == 30,
        };
        accel.render_frame(input).unwrap();
    }
}

#[test]
fn test_no_hazards_for_any_ring_depth() {
    for depth in 1..=4 {
        let mut accel = accel(depth);
        run_scene(&mut accel, 50);
        let host = accel.backend().stats();
        assert_eq!(host.hazards, 0, "ring depth {depth}");
        assert_eq!(host.submissions, 50);
        assert_eq!(accel.stats().frames, 50);
        assert!(accel.stats().dynamic_updates > 0);
    }
}

#[test]
fn test_slot_waits_before_host_writes() {
    for depth in 1..=3u64 {
        let mut accel = accel(depth as u32);
        run_scene(&mut accel, 24);

        // Frame i reuses the slot of frame i - depth, submission i - depth + 1
        let mut frame = 0u64;
        let mut waited = false;
        let mut writes = 0;
        for cmd in accel.backend().log() {
            match cmd {
                HostCommand::Wait { submission } if frame >= depth && *submission == frame + 1 - depth => {
                    waited = true;
                }
                HostCommand::Write { .. }
                | HostCommand::BindGeometry { .. }
                | HostCommand::BindTlas { .. }
                | HostCommand::BindTexture { .. }
                    if frame >= depth =>
                {
                    assert!(waited, "frame {frame} wrote before waiting (depth {depth})");
                    writes += 1;
                }
                HostCommand::Submit { submission } => {
                    assert_eq!(*submission, frame + 1);
                    frame += 1;
                    waited = false;
                }
                _ => {}
            }
        }
        assert_eq!(frame, 24);
        assert!(writes > 0);
    }
}

#[test]
fn test_detector_sees_write_in_flight() {
    let mut accel = accel(2);
    run_scene(&mut accel, 1);
    let vertices: HostBuffer = accel.slot(0).unwrap().dynamic_groups()[0].vertices.raw().clone();

    // Submission 1 was never waited on
    accel.backend_mut().write_buffer(&vertices, 0, &[0; 4]).unwrap();
    assert_eq!(accel.backend().stats().hazards, 1);
}

fn cache_buffers(accel: &SceneAccelerator<HostBackend>) -> Vec<HostBuffer> {
    let b = accel.cache_bindings();
    vec![b.directional.buffer.clone(), b.light_cache.buffer.clone(), b.distance.buffer.clone()]
}

fn dirty(accel: &mut SceneAccelerator<HostBackend>) {
    for buf in cache_buffers(accel) {
        let junk = vec![0x5A; buf.size() as usize];
        accel.backend_mut().write_buffer(&buf, 0, &junk).unwrap();
    }
}

fn all_zero(accel: &SceneAccelerator<HostBackend>) -> bool {
    cache_buffers(accel).iter().all(|b| b.read_bytes().iter().all(|&x| x == 0))
}

fn frame(accel: &mut SceneAccelerator<HostBackend>) -> u64 {
    let input = FrameInput { world_loaded: true, dynamic: strip(2, 0.0), ..Default::default() };
    match accel.render_frame(input).unwrap() {
        FrameOutput::Scene(scene) => scene.run_iteration,
        other => panic!("expected a scene, got {other:?}"),
    }
}

#[test]
fn test_cache_zero_fill_at_iteration_zero_and_after_reconnect() {
    let mut accel = accel(1);
    // Garbage before the first frame
    dirty(&mut accel);
    assert_eq!(frame(&mut accel), 0);
    assert!(all_zero(&accel));

    accel.wait_idle().unwrap();
    dirty(&mut accel);
    assert_eq!(frame(&mut accel), 1);
    assert!(!all_zero(&accel), "accumulated state survives later iterations");

    let mut bigger = accel.config().clone();
    bigger.cache.light_cache_buffer_size = 8191;
    assert!(accel.reconfigure(bigger).unwrap());
    assert_eq!(accel.cache_state(), CacheState::Running { iteration: 0 });
    assert_eq!(accel.cache_bindings().light_cache.records, 8191);

    dirty(&mut accel);
    assert_eq!(frame(&mut accel), 0);
    assert!(all_zero(&accel));
    assert_eq!(accel.backend().stats().hazards, 0);
}

#[test]
fn test_zero_fill_precedes_shader_barrier() {
    let mut accel = accel(1);
    frame(&mut accel);
    let log = accel.backend().log();
    let fills: Vec<usize> = log
        .iter()
        .enumerate()
        .filter(|(_, c)| matches!(c, HostCommand::FillZero { .. }))
        .map(|(i, _)| i)
        .collect();
    // Dummy geometry buffer, then the three caches
    assert_eq!(fills.len(), 4);
    let after = &log[fills[3] + 1];
    assert!(matches!(
        after,
        HostCommand::Barrier { buffer: None, src: Stage::Transfer, dst: Stage::Shader }
    ));
}

#[test]
fn test_textures_rebound_per_slot() {
    let mut accel = accel(2);
    frame(&mut accel);
    frame(&mut accel);

    accel.on_texture_ready(5, 1, 1, &[1, 2, 3, 4]).unwrap();
    let texture = accel.textures().get(5).id;
    let dummy = accel.textures().dummy().id;

    frame(&mut accel);
    assert_eq!(accel.slot(0).unwrap().binding_table().texture(5), Some(texture));
    // Slot 1 may still be read by its frame in flight
    assert_eq!(accel.slot(1).unwrap().binding_table().texture(5), Some(dummy));

    frame(&mut accel);
    assert_eq!(accel.slot(1).unwrap().binding_table().texture(5), Some(texture));
    assert_eq!(accel.backend().stats().hazards, 0);
}

#[test]
fn test_world_reload_rebuilds_static_per_slot() {
    let mut accel = accel(3);
    let input = |static_geometry| FrameInput {
        world_loaded: true,
        dynamic: strip(1, 0.0),
        static_geometry,
        force_rebuild: false,
    };
    accel.render_frame(input(statics(1))).unwrap();
    accel.render_frame(input(None)).unwrap();
    accel.render_frame(input(None)).unwrap();
    let counts = |accel: &SceneAccelerator<HostBackend>, slot: usize| {
        accel.slot(slot).unwrap().static_group(0).map(|g| g.counts())
    };
    assert!((0..3).all(|s| counts(&accel, s) == Some((16, 8))));

    accel.on_world_reloaded().unwrap();
    accel.render_frame(input(statics(2))).unwrap();
    assert_eq!(counts(&accel, 0), Some((32, 16)));
    // Not acquired yet: keeps the old world until reused
    assert_eq!(counts(&accel, 1), Some((16, 8)));

    accel.render_frame(input(None)).unwrap();
    assert_eq!(counts(&accel, 1), Some((32, 16)));
    assert_eq!(counts(&accel, 2), Some((16, 8)));

    // Opaque and transparent per slot: 3 slots at first, then 2 more
    assert_eq!(accel.stats().static_builds, 10);
    assert_eq!(accel.backend().stats().hazards, 0);
}
