//! Host reference of the light cache update protocol.
//!
//! Many kernel invocations update the same light cache vertex concurrently.
//! An update reads the `lock` version word, claims it with a single
//! compare-and-swap (making it odd), writes the merged value and publishes
//! the next even version. A claim that fails, or that finds the record
//! already claimed, drops its sample and counts a cancellation. There is no
//! retry.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use half::f16;

use crate::records::LightCacheVertex;

/// Result of one update attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Sample merged into the running mean of the same cell.
    Merged,
    /// Record belonged to another cell (or was empty) and was taken over.
    Replaced,
    /// Record was claimed by another update; sample dropped.
    Canceled,
}

/// Light cache vertex with atomic fields, mirroring [`LightCacheVertex`].
#[derive(Debug, Default)]
pub struct AtomicLightCacheVertex {
    hash: AtomicU32,
    lock: AtomicU32,
    // irr (3 x f16) in the low 48 bits, N in the high 16
    irr_n: AtomicU64,
    update_succeeded: AtomicU32,
    update_canceled: AtomicU32,
}

impl AtomicLightCacheVertex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_record(record: &LightCacheVertex) -> Self {
        Self {
            hash: AtomicU32::new(record.hash),
            lock: AtomicU32::new(record.lock),
            irr_n: AtomicU64::new(pack(record.irr, record.n)),
            update_succeeded: AtomicU32::new(record.update_succeeded),
            update_canceled: AtomicU32::new(record.update_canceled),
        }
    }

    /// Try to merge one irradiance sample for the cell with `checksum`.
    ///
    /// The running mean weights the new sample by `1 / N` with `N` capped at
    /// `max_n`, so old cells keep adapting.
    pub fn update(&self, checksum: u32, irradiance: [f32; 3], max_n: u16) -> UpdateOutcome {
        let version = self.lock.load(Ordering::Acquire);
        if version & 1 == 1
            || self
                .lock
                .compare_exchange(
                    version,
                    version.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_err()
        {
            self.update_canceled.fetch_add(1, Ordering::Relaxed);
            return UpdateOutcome::Canceled;
        }

        let (irr, n) = unpack(self.irr_n.load(Ordering::Relaxed));
        let same_cell = n > 0 && self.hash.load(Ordering::Relaxed) == checksum;

        let ((new_irr, new_n), outcome) = if same_cell {
            let n = n.saturating_add(1).min(max_n.max(1));
            let alpha = 1.0 / n as f32;
            let mut merged = [f16::ZERO; 3];
            for c in 0..3 {
                let old = irr[c].to_f32();
                merged[c] = f16::from_f32(old + (irradiance[c] - old) * alpha);
            }
            ((merged, n), UpdateOutcome::Merged)
        } else {
            let merged = irradiance.map(f16::from_f32);
            ((merged, 1), UpdateOutcome::Replaced)
        };

        self.hash.store(checksum, Ordering::Relaxed);
        self.irr_n.store(pack(new_irr, new_n), Ordering::Relaxed);
        self.lock.store(version.wrapping_add(2), Ordering::Release);
        self.update_succeeded.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    /// Snapshot as a plain record.
    pub fn load(&self) -> LightCacheVertex {
        let (irr, n) = unpack(self.irr_n.load(Ordering::Acquire));
        LightCacheVertex {
            hash: self.hash.load(Ordering::Relaxed),
            lock: self.lock.load(Ordering::Relaxed),
            irr,
            n,
            update_succeeded: self.update_succeeded.load(Ordering::Relaxed),
            update_canceled: self.update_canceled.load(Ordering::Relaxed),
        }
    }
}

#[inline]
fn pack(irr: [f16; 3], n: u16) -> u64 {
    irr[0].to_bits() as u64
        | (irr[1].to_bits() as u64) << 16
        | (irr[2].to_bits() as u64) << 32
        | (n as u64) << 48
}

#[inline]
fn unpack(bits: u64) -> ([f16; 3], u16) {
    (
        [
            f16::from_bits(bits as u16),
            f16::from_bits((bits >> 16) as u16),
            f16::from_bits((bits >> 32) as u16),
        ],
        (bits >> 48) as u16,
    )
}
