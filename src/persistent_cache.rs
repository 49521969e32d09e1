//! Fixed-size hash-grid cache buffers owned on behalf of the shading kernels.
//!
//! Three flat record arrays, allocated once per configuration and never
//! resized in place. The lifecycle is a two-state machine:
//!
//! ```text
//! Running { iteration } --any config change--> Reconnecting --reconnect--> Running { iteration: 0 }
//! ```
//!
//! Iteration 0 of every run zero-fills all three buffers, followed by a
//! transfer to shader barrier, before the kernels read them.

use hash_grid::{DirectionalGuideState, DistanceGuideState, LightCacheVertex};
use tracing::{debug, info};

use crate::backend::{BufferUsage, RtBackend, Stage};
use crate::buffer_cache::DeviceBuffer;
use crate::config::CacheConfig;
use crate::util::{Error, Result};

/// Lifecycle of the cache buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Buffers valid; `iteration` is the next frame's run iteration.
    Running { iteration: u64 },
    /// A layout change was requested; buffers must be reallocated.
    Reconnecting,
}

/// One cache buffer as published to the kernels.
pub struct CacheBinding<'a, B: RtBackend> {
    pub buffer: &'a B::Buffer,
    pub records: u64,
}

/// The three cache buffers of the current frame.
pub struct CacheBindings<'a, B: RtBackend> {
    pub directional: CacheBinding<'a, B>,
    pub light_cache: CacheBinding<'a, B>,
    pub distance: CacheBinding<'a, B>,
    pub fast_recovery: bool,
}

/// Directional, light and distance guide buffers.
pub struct PersistentCacheBuffers<B: RtBackend> {
    directional: DeviceBuffer<B>,
    light_cache: DeviceBuffer<B>,
    distance: DeviceBuffer<B>,
    config: CacheConfig,
    state: CacheState,
    clears: u64,
}

fn allocate<B: RtBackend, T>(backend: &mut B, records: u64, label: &str) -> Result<DeviceBuffer<B>> {
    let bytes = (records * std::mem::size_of::<T>() as u64).next_multiple_of(4).max(4);
    let usage = BufferUsage::STORAGE | BufferUsage::TRANSFER_DST;
    let raw = backend.create_buffer(bytes, usage, label)?;
    debug!(label, records, bytes, "cache buffer");
    Ok(DeviceBuffer::new(raw, bytes, usage))
}

impl<B: RtBackend> PersistentCacheBuffers<B> {
    /// Allocate all three buffers. The first frame clears them.
    pub fn new(backend: &mut B, config: &CacheConfig) -> Result<Self> {
        let directional =
            allocate::<B, DirectionalGuideState>(backend, config.directional_records(), "directional_guide")?;
        let light_cache = allocate::<B, LightCacheVertex>(backend, config.light_cache_records(), "light_cache")?;
        let distance = allocate::<B, DistanceGuideState>(backend, config.distance_records(), "distance_guide")?;
        Ok(Self {
            directional,
            light_cache,
            distance,
            config: config.clone(),
            state: CacheState::Running { iteration: 0 },
            clears: 0,
        })
    }

    pub fn state(&self) -> CacheState {
        self.state
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of zero-fills issued so far.
    pub fn clears(&self) -> u64 {
        self.clears
    }

    /// Start a new run; the next frame is iteration 0.
    pub fn restart_run(&mut self) {
        self.rewind(0);
    }

    /// Record this frame's clear if it is the first of a run and return the
    /// frame's run iteration.
    pub fn begin_frame(&mut self, backend: &mut B) -> Result<u64> {
        let CacheState::Running { iteration } = self.state else {
            return Err(Error::NeedsReconnect("cache buffers are awaiting reallocation".into()));
        };
        if iteration == 0 {
            for buffer in [&self.directional, &self.light_cache, &self.distance] {
                backend.fill_zero(buffer.raw())?;
            }
            backend.global_barrier(Stage::Transfer, Stage::Shader);
            self.clears += 1;
            debug!("cache buffers cleared");
        }
        self.state = CacheState::Running { iteration: iteration + 1 };
        Ok(iteration)
    }

    /// Request a new cache config. An identical config is a no-op; any
    /// other change, grid parameters included, moves to `Reconnecting` and
    /// fails with [`Error::NeedsReconnect`].
    pub fn resize(&mut self, config: &CacheConfig) -> Result<()> {
        if *config == self.config {
            return Ok(());
        }
        self.state = CacheState::Reconnecting;
        Err(Error::NeedsReconnect(format!(
            "cache layout changes from ({}, {}, {}) to ({}, {}, {}) records",
            self.config.directional_records(),
            self.config.light_cache_records(),
            self.config.distance_records(),
            config.directional_records(),
            config.light_cache_records(),
            config.distance_records(),
        )))
    }

    /// Put the run back at `iteration` after a frame that was never
    /// submitted. A pending clear at iteration 0 is re-recorded next frame.
    pub fn rewind(&mut self, iteration: u64) {
        if let CacheState::Running { iteration: current } = &mut self.state {
            *current = iteration;
        }
    }

    /// Reallocate from `config` and re-enter `Running` at iteration 0.
    ///
    /// The caller must have waited for every submission reading the old
    /// buffers.
    pub fn reconnect(&mut self, backend: &mut B, config: &CacheConfig) -> Result<()> {
        let clears = self.clears;
        *self = Self::new(backend, config)?;
        self.clears = clears;
        info!(
            directional = config.directional_records(),
            light_cache = config.light_cache_records(),
            distance = config.distance_records(),
            "cache buffers reconnected"
        );
        Ok(())
    }

    pub fn bindings(&self) -> CacheBindings<'_, B> {
        CacheBindings {
            directional: CacheBinding {
                buffer: self.directional.raw(),
                records: self.config.directional_records(),
            },
            light_cache: CacheBinding {
                buffer: self.light_cache.raw(),
                records: self.config.light_cache_records(),
            },
            distance: CacheBinding {
                buffer: self.distance.raw(),
                records: self.config.distance_records(),
            },
            fast_recovery: self.config.fast_recovery,
        }
    }
}
