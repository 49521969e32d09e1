//! Host execution of the light cache update kernel.
//!
//! Each sample hashes its position on the adaptive grid (cell size follows
//! the distance to the camera), then races the other samples of the pass
//! for the addressed record with the optimistic single-claim protocol of
//! [`AtomicLightCacheVertex`].

use glam::Vec3;
use hash_grid::{AdaptiveGrid, AtomicLightCacheVertex, LightCacheVertex, UpdateOutcome};
use rayon::prelude::*;

/// Running means stop growing their sample count here.
pub const LIGHT_CACHE_MAX_N: u16 = 1024;

/// One irradiance estimate at a surface point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightSample {
    pub position: Vec3,
    pub irradiance: [f32; 3],
}

/// Outcome counts of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LightCachePassStats {
    pub merged: u64,
    pub replaced: u64,
    pub canceled: u64,
}

impl LightCachePassStats {
    fn count(mut self, outcome: UpdateOutcome) -> Self {
        match outcome {
            UpdateOutcome::Merged => self.merged += 1,
            UpdateOutcome::Replaced => self.replaced += 1,
            UpdateOutcome::Canceled => self.canceled += 1,
        }
        self
    }

    fn merge(mut self, other: Self) -> Self {
        self.merged += other.merged;
        self.replaced += other.replaced;
        self.canceled += other.canceled;
        self
    }
}

/// Apply `samples` to `records` in place.
pub(super) fn update_records(
    records: &mut [LightCacheVertex],
    grid: AdaptiveGrid,
    camera: Vec3,
    samples: &[LightSample],
) -> LightCachePassStats {
    if records.is_empty() {
        return LightCachePassStats::default();
    }
    let len = records.len() as u32;
    let cells: Vec<AtomicLightCacheVertex> = records.iter().map(AtomicLightCacheVertex::from_record).collect();
    let stats = samples
        .par_iter()
        .fold(LightCachePassStats::default, |stats, sample| {
            let key = grid.key(sample.position.to_array(), sample.position.distance(camera));
            let outcome = cells[key.index(len) as usize].update(key.checksum32(), sample.irradiance, LIGHT_CACHE_MAX_N);
            stats.count(outcome)
        })
        .reduce(LightCachePassStats::default, LightCachePassStats::merge);
    for (record, cell) in records.iter_mut().zip(&cells) {
        *record = cell.load();
    }
    stats
}
