//! Record layouts of the persistent cache arrays.
//!
//! Layouts follow std430 rules with the padding spelled out, so a
//! `bytemuck::cast_slice` of the GPU buffer yields these records directly.
//! The all-zero bit pattern is the empty state of every record.

use bytemuck::{Pod, Zeroable};
use half::f16;

/// Upper bound of distance guide states stored per screen-space vertex.
pub const MAX_DISTANCE_STATES_PER_VERTEX: u32 = 10;

/// Directional guiding state of one hash grid cell (80 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, PartialEq)]
pub struct DirectionalGuideState {
    pub tgt_change: [f32; 3],
    pub w_change: f32,
    pub cos_change: f32,
    pub _pad0: [f32; 3],
    pub w_tgt: [f32; 3],
    pub sum_w: f32,
    pub w_cos: f32,
    pub _pad1: f32,
    /// Motion vector of the cell, for reprojection.
    pub mv: [f16; 3],
    pub _pad2: u16,
    pub t: f32,
    /// Sample count.
    pub n: u16,
    /// Checksum of grid index and level.
    pub hash: u16,
    pub _pad3: [u32; 2],
}

/// Light cache vertex of one hash grid cell (24 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, PartialEq)]
pub struct LightCacheVertex {
    /// Checksum of grid index and level.
    pub hash: u32,
    /// Version word for optimistic locking; odd while an update is in progress.
    pub lock: u32,
    pub irr: [f16; 3],
    pub n: u16,
    pub update_succeeded: u32,
    pub update_canceled: u32,
}

/// Distance guiding state (16 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, PartialEq)]
pub struct DistanceGuideState {
    pub sum_w: f32,
    pub n: u32,
    pub moments: [f32; 2],
}

macro_rules! impl_is_empty {
    ($($ty:ty),*) => {
        $(
            impl $ty {
                /// True if the record is in its cleared state.
                #[inline]
                pub fn is_empty(&self) -> bool {
                    bytemuck::bytes_of(self).iter().all(|&b| b == 0)
                }
            }
        )*
    };
}

impl_is_empty!(DirectionalGuideState, LightCacheVertex, DistanceGuideState);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes() {
        assert_eq!(std::mem::size_of::<DirectionalGuideState>(), 80);
        assert_eq!(std::mem::size_of::<LightCacheVertex>(), 24);
        assert_eq!(std::mem::size_of::<DistanceGuideState>(), 16);
    }

    #[test]
    fn test_zeroed_is_empty() {
        assert!(DirectionalGuideState::zeroed().is_empty());
        assert!(LightCacheVertex::zeroed().is_empty());
        assert!(DistanceGuideState::zeroed().is_empty());

        let state = DistanceGuideState { n: 1, ..Zeroable::zeroed() };
        assert!(!state.is_empty());
    }

    #[test]
    fn test_cast_from_bytes() {
        let bytes = vec![0u8; 24 * 4];
        let records: &[LightCacheVertex] = bytemuck::cast_slice(&bytes);
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(LightCacheVertex::is_empty));
    }
}
