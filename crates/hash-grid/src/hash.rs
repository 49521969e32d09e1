//! Cell quantization and hashing.
//!
//! A world position is quantized to an integer cell at some resolution
//! level, the cell key is mixed into 64 bits, and the result is split into a
//! buffer index and a checksum. The checksum is stored in the record so a
//! lookup can tell its own cell from a colliding one.

/// Smallest cell width of the adaptive grid, in world units.
pub const MIN_CELL_WIDTH: f32 = 0.01;

/// Resolution levels addressable by a [`CellKey`].
pub const MAX_LEVELS: u32 = 32;

/// Integer cell coordinates plus resolution level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellKey {
    pub cell: [i32; 3],
    pub level: u32,
}

impl CellKey {
    /// Quantize a position with the given cell width.
    pub fn quantize(position: [f32; 3], width: f32, level: u32) -> Self {
        let inv = 1.0 / width;
        Self {
            cell: [
                (position[0] * inv).floor() as i32,
                (position[1] * inv).floor() as i32,
                (position[2] * inv).floor() as i32,
            ],
            level,
        }
    }

    /// 64-bit hash of the key.
    #[inline]
    pub fn hash64(&self) -> u64 {
        let mut h = self.cell[0] as u32 as u64;
        h = fmix64(h ^ ((self.cell[1] as u32 as u64) << 21));
        h = fmix64(h ^ ((self.cell[2] as u32 as u64) << 42));
        fmix64(h ^ (self.level as u64).rotate_left(17))
    }

    /// Index into a buffer of `len` records.
    #[inline]
    pub fn index(&self, len: u32) -> u32 {
        debug_assert!(len > 0);
        (self.hash64() % len as u64) as u32
    }

    /// 32-bit checksum, never zero (zero marks an empty record).
    #[inline]
    pub fn checksum32(&self) -> u32 {
        ((self.hash64() >> 32) as u32).max(1)
    }

    /// 16-bit checksum, never zero.
    #[inline]
    pub fn checksum16(&self) -> u16 {
        ((self.hash64() >> 48) as u16).max(1)
    }
}

/// Grid whose resolution follows the distance to the camera.
///
/// The cell width at distance `d` approximates the footprint
/// `2 * d * tan(alpha / 2)`, quantized to powers of two above
/// [`MIN_CELL_WIDTH`] and clamped to `levels` steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveGrid {
    pub tan_alpha_half: f32,
    pub levels: u32,
}

impl AdaptiveGrid {
    pub fn level_for_distance(&self, distance: f32) -> u32 {
        let footprint = (2.0 * distance * self.tan_alpha_half).max(MIN_CELL_WIDTH);
        let level = (footprint / MIN_CELL_WIDTH).log2().ceil();
        (level.max(0.0) as u32).min(self.levels.saturating_sub(1))
    }

    pub fn cell_width(&self, level: u32) -> f32 {
        MIN_CELL_WIDTH * (1u32 << level.min(31)) as f32
    }

    pub fn key(&self, position: [f32; 3], distance: f32) -> CellKey {
        let level = self.level_for_distance(distance);
        CellKey::quantize(position, self.cell_width(level), level)
    }
}

/// Finalization mix of MurmurHash3.
#[inline]
fn fmix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^= h >> 33;
    h
}
