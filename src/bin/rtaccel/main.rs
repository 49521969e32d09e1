//! rtaccel-sim - drive the frame loop on the host backend.
//!
//! Runs a deterministic synthetic scene through `SceneAccelerator` and
//! reports what the decision layer did: builds, refits, buffer reuse and
//! ring hazards.

use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context};
use glam::Vec3;
use rtaccel::backend::host::{LightCachePassStats, LightSample};
use rtaccel::backend::HostBackend;
use rtaccel::geometry::{GeometryArrays, TriangleAttributes};
use rtaccel::{AccelConfig, CacheConfig, EngineAdapter, FrameInput, FrameOutput, SceneAccelerator, StaticGeometry};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[cfg(feature = "chrome-trace")]
type TraceGuard = Option<tracing_chrome::FlushGuard>;
#[cfg(not(feature = "chrome-trace"))]
type TraceGuard = ();

/// Console logging at `level` unless `RUST_LOG` says otherwise, plus a
/// Chrome trace in `trace.json` when `RTACCEL_TRACE=1`.
#[cfg(feature = "chrome-trace")]
fn init_tracing(level: &str) -> TraceGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let fmt = tracing_subscriber::fmt::layer().with_target(false);

    if env::var("RTACCEL_TRACE").ok().as_deref() == Some("1") {
        let (chrome, guard) = tracing_chrome::ChromeLayerBuilder::new().file("trace.json").build();
        tracing_subscriber::registry().with(filter).with(fmt).with(chrome).init();
        return Some(guard);
    }
    tracing_subscriber::registry().with(filter).with(fmt).init();
    None
}

#[cfg(not(feature = "chrome-trace"))]
fn init_tracing(level: &str) -> TraceGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let fmt = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry().with(filter).with(fmt).init();
}

fn main() {
    let args: Vec<String> = env::args().collect();

    // Parse global flags
    let mut level = "info";
    let mut filtered_args: Vec<&str> = Vec::new();
    for arg in &args[1..] {
        match arg.as_str() {
            "-v" | "--verbose" => level = "debug",
            "-vv" | "--trace" => level = "trace",
            "-q" | "--quiet" => level = "error",
            _ => filtered_args.push(arg),
        }
    }
    let _guard = init_tracing(level);

    if filtered_args.is_empty() {
        print_help();
        return;
    }

    let result = match filtered_args[0] {
        "simulate" | "sim" | "s" => SimOptions::parse(&filtered_args[1..]).and_then(cmd_simulate),
        "config" | "c" => cmd_config(&filtered_args[1..]),
        "version" | "-V" | "--version" => {
            cmd_version();
            Ok(())
        }
        "help" | "h" | "-h" | "--help" => {
            print_help();
            Ok(())
        }
        other => {
            eprintln!("Error: unknown command '{other}'");
            print_help();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn print_help() {
    println!("rtaccel-sim - acceleration structure frame loop simulator");
    println!();
    println!("USAGE:");
    println!("    rtaccel-sim [OPTIONS] <COMMAND> [ARGS]");
    println!();
    println!("COMMANDS:");
    println!("    s, simulate [sim options]     Run the synthetic scene on the host backend");
    println!("    c, config [--save]            Show config path and effective config");
    println!("    version                       Show version and build date");
    println!("    h, help                       Show this help");
    println!();
    println!("SIMULATE OPTIONS:");
    println!("    --frames <n>           Frames to render (default 240)");
    println!("    --ring <n>             Frames in flight, 1..=8 (default from config)");
    println!("    --reload-at <n>        Frame of the world reload (default frames/2)");
    println!("    --topology-every <n>   Frames between dynamic topology changes (default 30)");
    println!("    --config <file>        Load config from file instead of the defaults");
    println!();
    println!("OPTIONS:");
    println!("    -v, --verbose    Show debug output");
    println!("    -vv, --trace     Show trace output (very verbose)");
    println!("    -q, --quiet      Errors only");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG          Overrides the log filter");
    println!("    RTACCEL_TRACE=1   Write a Chrome trace to trace.json");
}

fn cmd_version() {
    println!(
        "rtaccel-sim {} ({} build {}, backends: {})",
        env!("CARGO_PKG_VERSION"),
        rtaccel::BUILD_PROFILE,
        rtaccel::BUILD_STAMP,
        rtaccel::BACKENDS
    );
}

fn cmd_config(args: &[&str]) -> anyhow::Result<()> {
    let path = AccelConfig::path();
    match &path {
        Some(p) => println!("Config path: {}", p.display()),
        None => println!("Config path: <none on this platform>"),
    }
    let config = AccelConfig::load();
    if args.contains(&"--save") {
        config.save().context("saving config")?;
        println!("Saved.");
    }
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

struct SimOptions {
    frames: u64,
    ring: Option<u32>,
    reload_at: Option<u64>,
    topology_every: u64,
    config: Option<PathBuf>,
}

impl SimOptions {
    fn parse(args: &[&str]) -> anyhow::Result<Self> {
        let mut opts = SimOptions {
            frames: 240,
            ring: None,
            reload_at: None,
            topology_every: 30,
            config: None,
        };
        let mut it = args.iter();
        while let Some(&arg) = it.next() {
            let mut value = || it.next().copied().with_context(|| format!("missing value for {arg}"));
            match arg {
                "--frames" | "-n" => opts.frames = value()?.parse().context("--frames")?,
                "--ring" => opts.ring = Some(value()?.parse().context("--ring")?),
                "--reload-at" => opts.reload_at = Some(value()?.parse().context("--reload-at")?),
                "--topology-every" => opts.topology_every = value()?.parse().context("--topology-every")?,
                "--config" => opts.config = Some(PathBuf::from(value()?)),
                other => bail!("unknown simulate option '{other}'"),
            }
        }
        if opts.topology_every == 0 {
            bail!("--topology-every must be positive");
        }
        Ok(opts)
    }
}

/// One animated strip of quads.
struct Entity {
    quads: u32,
    phase: f32,
}

/// Quad strip along x at height `y`, displaced in z by a wave.
fn emit_strip(out: &mut GeometryArrays, quads: u32, y: f32, wave: impl Fn(f32) -> f32) {
    for q in 0..quads {
        let x = q as f32;
        let base = out.vertex_count();
        for (dx, dy) in [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)] {
            let p = [x + dx, y + dy, wave(x + dx)];
            out.positions.extend_from_slice(&p);
            out.prev_positions.extend_from_slice(&p);
        }
        out.indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        let attr = TriangleAttributes { texture_alpha: (q % 4) as u16 | 0xF000, ..Default::default() };
        out.attributes.extend_from_slice(&[attr, attr]);
    }
}

fn world_level(opaque_rows: u32) -> StaticGeometry {
    let mut opaque = GeometryArrays::new();
    for row in 0..opaque_rows {
        emit_strip(&mut opaque, 16, row as f32, |_| 0.0);
    }
    let mut transparent = GeometryArrays::new();
    emit_strip(&mut transparent, 4, 2.0, |_| 1.5);
    StaticGeometry { opaque, transparent }
}

fn entities(frame: u64, topology_every: u64) -> Vec<Entity> {
    let extra = ((frame / topology_every) % 4) as u32;
    (0..6 + extra)
        .map(|i| Entity { quads: 2 + i % 3, phase: i as f32 * 0.7 })
        .collect()
}

/// Fixed camera the light cache cells are sized against.
const CAMERA: Vec3 = Vec3::new(8.0, 4.0, -12.0);

/// One light sample per dynamic vertex, brighter at the wave crests.
fn light_samples(dynamic: &GeometryArrays) -> Vec<LightSample> {
    dynamic
        .positions
        .chunks_exact(3)
        .map(|p| {
            let position = Vec3::new(p[0], p[1], p[2]);
            let lum = 0.5 + 0.25 * (position.z + 1.0);
            LightSample { position, irradiance: [lum, lum * 0.9, lum * 0.8] }
        })
        .collect()
}

fn cmd_simulate(opts: SimOptions) -> anyhow::Result<()> {
    let mut config = match &opts.config {
        Some(path) => AccelConfig::load_from(path).with_context(|| format!("loading {}", path.display()))?,
        None => AccelConfig { cache: CacheConfig::small(), ..AccelConfig::default() },
    };
    if let Some(ring) = opts.ring {
        config.ring_depth = ring;
    }
    let reload_at = opts.reload_at.unwrap_or(opts.frames / 2);

    let accel = SceneAccelerator::new(HostBackend::new().without_log(), config)?;
    let mut adapter = EngineAdapter::new();
    adapter.register(accel)?;
    for id in 0..4u32 {
        let shade = (id * 60) as u8;
        adapter.texture_ready(id, 4, 4, &[shade; 64])?;
    }

    let mut scenes = 0u64;
    let mut cleared = 0u64;
    let mut light = LightCachePassStats::default();
    for frame in 0..opts.frames {
        // No world for the first two frames
        let world_loaded = frame >= 2;
        let first_world_frame = frame == 2 || frame == reload_at;
        if frame == reload_at && frame > 2 {
            adapter.world_reloaded()?;
        }
        let accel = adapter.handler_mut().context("accelerator not registered")?;

        let t = frame as f32 * 0.1;
        let dynamic = if world_loaded {
            let list = entities(frame, opts.topology_every);
            accel.extract(&list, |e, out| {
                emit_strip(out, e.quads, e.phase * 3.0, |x| (t + e.phase + x * 0.5).sin());
            })
        } else {
            GeometryArrays::new()
        };
        let samples = light_samples(&dynamic);
        let static_geometry = first_world_frame.then(|| world_level(if frame < reload_at { 4 } else { 6 }));

        let input = FrameInput {
            world_loaded,
            dynamic,
            static_geometry,
            force_rebuild: false,
        };
        match accel.render_frame(input)? {
            FrameOutput::Scene(scene) => {
                scenes += 1;
                tracing::debug!(
                    frame = scene.frame,
                    slot = scene.slot,
                    instances = scene.instance_count,
                    iteration = scene.run_iteration,
                    tlas = ?scene.tlas,
                    dynamic = ?scene.dynamic,
                    "frame"
                );
                let buffer = accel.cache_bindings().light_cache.buffer.clone();
                let grid = accel.config().cache.light_cache_grid();
                let pass = accel.backend_mut().light_cache_pass(&buffer, grid, CAMERA, &samples)?;
                light.merged += pass.merged;
                light.replaced += pass.replaced;
                light.canceled += pass.canceled;
            }
            FrameOutput::Cleared { .. } => cleared += 1,
        }
    }

    let accel = adapter.handler_mut().context("accelerator not registered")?;
    accel.wait_idle()?;
    let stats = accel.stats();
    let buffers = accel.buffer_stats();
    let host = accel.backend().stats();

    println!("Frames:           {} ({} scene, {} cleared)", stats.frames, scenes, cleared);
    println!("Ring depth:       {}", accel.ring_depth());
    println!("Static builds:    {}", stats.static_builds);
    println!(
        "Dynamic BLAS:     {} builds, {} updates, {} rebuilds",
        stats.dynamic_builds, stats.dynamic_updates, stats.dynamic_rebuilds
    );
    println!("TLAS:             {} rebuilds, {} refits", stats.tlas_rebuilds, stats.tlas_refits);
    println!("World reloads:    {}", stats.world_reloads);
    println!(
        "Buffers:          {} allocated ({} bytes), {} reused, {} bytes uploaded",
        buffers.allocations, buffers.bytes_allocated, buffers.reuses, buffers.bytes_uploaded
    );
    println!("Cache clears:     {}", host.zero_fills);
    println!(
        "Light cache:      {} passes, {} merged, {} replaced, {} canceled",
        host.light_cache_passes, light.merged, light.replaced, light.canceled
    );
    println!("Submissions:      {} ({} waits, {} discarded)", host.submissions, host.waits, host.discards);
    println!("Abandoned frames: {}", stats.abandoned_frames);
    println!("Hazards:          {}", host.hazards);

    if host.hazards > 0 {
        bail!("{} ring hazards detected", host.hazards);
    }
    Ok(())
}
