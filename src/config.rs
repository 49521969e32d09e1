//! Persistent configuration.
//!
//! Every field except `dynamic_rebuild_interval` and `extraction_workers`
//! is structural: changing it tears down and rebuilds all
//! frame slots and the persistent cache buffers.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::util::{Error, Result};

/// Largest ring of frames in flight.
pub const MAX_RING_DEPTH: u32 = 8;

/// Instance custom indices are 24 bits wide.
pub const MAX_INSTANCE_LIMIT: u32 = 1 << 24;

/// Sizing of the hash-grid caches read and written by the shading kernels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    // Light cache
    pub light_cache_buffer_size: u32,
    pub light_cache_levels: u32,
    pub light_cache_tan_alpha_half: f32,

    // Directional guiding: adaptive grid followed by static grid in one buffer
    pub adaptive_buffer_size: u32,
    pub adaptive_grid_levels: u32,
    pub adaptive_grid_tan_alpha_half: f32,
    pub static_buffer_size: u32,
    pub static_grid_width: f32,

    // Distance guiding, sized from the render resolution
    pub distance_grid_width: f32,
    pub render_width: u32,
    pub render_height: u32,

    /// Published to the kernels, which own the policy.
    pub fast_recovery: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            light_cache_buffer_size: 4_000_000,
            light_cache_levels: 32,
            light_cache_tan_alpha_half: 0.002,
            adaptive_buffer_size: 32_777_259,
            adaptive_grid_levels: 10,
            adaptive_grid_tan_alpha_half: 0.003,
            static_buffer_size: 800_009,
            static_grid_width: 25.3,
            distance_grid_width: 25.0,
            render_width: 1920,
            render_height: 1080,
            fast_recovery: true,
        }
    }
}

impl CacheConfig {
    /// Small caches for headless runs and tests.
    pub fn small() -> Self {
        Self {
            light_cache_buffer_size: 4093,
            adaptive_buffer_size: 8191,
            static_buffer_size: 1021,
            render_width: 320,
            render_height: 240,
            ..Self::default()
        }
    }

    /// Record count of the directional guide buffer.
    pub fn directional_records(&self) -> u64 {
        self.adaptive_buffer_size as u64 + self.static_buffer_size as u64
    }

    pub fn light_cache_records(&self) -> u64 {
        self.light_cache_buffer_size as u64
    }

    /// Hash grid the light cache records are addressed with.
    pub fn light_cache_grid(&self) -> hash_grid::AdaptiveGrid {
        hash_grid::AdaptiveGrid {
            tan_alpha_half: self.light_cache_tan_alpha_half,
            levels: self.light_cache_levels,
        }
    }

    /// Distance grid vertices times the states kept per vertex.
    pub fn distance_records(&self) -> u64 {
        let cells_x = (self.render_width as f32 / self.distance_grid_width) as u64 + 2;
        let cells_y = (self.render_height as f32 / self.distance_grid_width) as u64 + 2;
        cells_x * cells_y * hash_grid::MAX_DISTANCE_STATES_PER_VERTEX as u64
    }

    fn validate(&self) -> Result<()> {
        let sizes = [
            ("light_cache_buffer_size", self.light_cache_buffer_size),
            ("adaptive_buffer_size", self.adaptive_buffer_size),
            ("static_buffer_size", self.static_buffer_size),
            ("render_width", self.render_width),
            ("render_height", self.render_height),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(Error::invalid_config(format!("{name} must be positive")));
            }
        }
        for (name, levels) in [
            ("light_cache_levels", self.light_cache_levels),
            ("adaptive_grid_levels", self.adaptive_grid_levels),
        ] {
            if !(1..=hash_grid::MAX_LEVELS).contains(&levels) {
                return Err(Error::invalid_config(format!(
                    "{name} = {levels}, expected 1..={}",
                    hash_grid::MAX_LEVELS
                )));
            }
        }
        for (name, value) in [
            ("light_cache_tan_alpha_half", self.light_cache_tan_alpha_half),
            ("adaptive_grid_tan_alpha_half", self.adaptive_grid_tan_alpha_half),
        ] {
            if !(value > 0.0 && value < 1.0) {
                return Err(Error::invalid_config(format!("{name} = {value}, expected (0, 1)")));
            }
        }
        for (name, value) in [
            ("static_grid_width", self.static_grid_width),
            ("distance_grid_width", self.distance_grid_width),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(Error::invalid_config(format!("{name} = {value}, expected a positive width")));
            }
        }
        Ok(())
    }
}

/// Configuration of a [`SceneAccelerator`](crate::SceneAccelerator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccelConfig {
    // Binding table sizes
    pub max_instances: u32,
    pub max_textures: u32,

    /// Frames in flight.
    pub ring_depth: u32,

    /// Frames a refitted dynamic BVH may age before a forced rebuild.
    pub dynamic_rebuild_interval: u64,

    /// Extraction workers, 0 = rayon pool size.
    pub extraction_workers: usize,

    pub cache: CacheConfig,
}

impl Default for AccelConfig {
    fn default() -> Self {
        Self {
            max_instances: 16,
            max_textures: 4096,
            ring_depth: 2,
            dynamic_rebuild_interval: 1000,
            extraction_workers: 0,
            cache: CacheConfig::default(),
        }
    }
}

impl AccelConfig {
    /// Config file location.
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut p| {
            p.push("rtaccel");
            p.push("config.json");
            p
        })
    }

    /// Load from the default location, falling back to defaults when the file
    /// is missing, unreadable or invalid.
    pub fn load() -> Self {
        let Some(path) = Self::path() else {
            return Self::default();
        };
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(Error::ConfigNotFound(_)) => Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring config file");
                Self::default()
            }
        }
    }

    /// Load and validate a config file.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::ConfigNotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to the default location.
    pub fn save(&self) -> Result<()> {
        let path = Self::path().ok_or_else(|| Error::invalid_config("no config directory on this platform"))?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_INSTANCE_LIMIT).contains(&self.max_instances) {
            return Err(Error::invalid_config(format!(
                "max_instances = {}, expected 1..={MAX_INSTANCE_LIMIT}",
                self.max_instances
            )));
        }
        if self.max_textures == 0 {
            return Err(Error::invalid_config("max_textures must be positive"));
        }
        if !(1..=MAX_RING_DEPTH).contains(&self.ring_depth) {
            return Err(Error::invalid_config(format!(
                "ring_depth = {}, expected 1..={MAX_RING_DEPTH}",
                self.ring_depth
            )));
        }
        self.cache.validate()
    }

    /// True when switching from `self` to `next` needs a full reconnect.
    ///
    /// Any cache parameter counts, including grid shape and
    /// `fast_recovery`: the stored records are only meaningful under the
    /// parameters that wrote them. `dynamic_rebuild_interval` and
    /// `extraction_workers` apply at runtime.
    pub fn requires_reconnect(&self, next: &AccelConfig) -> bool {
        self.max_instances != next.max_instances
            || self.max_textures != next.max_textures
            || self.ring_depth != next.ring_depth
            || self.cache != next.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = AccelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_instances, 16);
        assert_eq!(config.max_textures, 4096);
        assert_eq!(config.cache.directional_records(), 32_777_259 + 800_009);
    }

    #[test]
    fn test_distance_records() {
        // (1920/25 + 2) * (1080/25 + 2) * 10
        assert_eq!(CacheConfig::default().distance_records(), 78 * 45 * 10);
    }

    #[test]
    fn test_light_cache_grid() {
        let cache = CacheConfig::default();
        let grid = cache.light_cache_grid();
        assert_eq!(grid.levels, cache.light_cache_levels);
        assert!(grid.level_for_distance(1.0e9) < cache.light_cache_levels);
    }

    #[test]
    fn test_validation() {
        let mut config = AccelConfig { ring_depth: 0, ..Default::default() };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        config.ring_depth = MAX_RING_DEPTH + 1;
        assert!(config.validate().is_err());
        config.ring_depth = 3;
        config.cache.distance_grid_width = 0.0;
        assert!(config.validate().is_err());
        config.cache.distance_grid_width = 10.0;
        config.cache.adaptive_grid_levels = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reconnect_detection() {
        let a = AccelConfig::default();
        let mut b = a.clone();
        b.dynamic_rebuild_interval = 10;
        b.extraction_workers = 3;
        assert!(!a.requires_reconnect(&b));

        b.cache.light_cache_buffer_size += 1;
        assert!(a.requires_reconnect(&b));

        // Grid parameters at unchanged buffer sizes still reconnect.
        let grid_changes: [fn(&mut CacheConfig); 6] = [
            |c| c.static_grid_width *= 2.0,
            |c| c.adaptive_grid_tan_alpha_half *= 0.5,
            |c| c.light_cache_tan_alpha_half *= 0.5,
            |c| c.adaptive_grid_levels += 1,
            |c| c.light_cache_levels += 1,
            |c| c.fast_recovery = !c.fast_recovery,
        ];
        for change in grid_changes {
            let mut next = a.clone();
            change(&mut next.cache);
            assert!(a.requires_reconnect(&next), "{:?}", next.cache);
        }

        let c = AccelConfig { ring_depth: 3, ..a.clone() };
        assert!(a.requires_reconnect(&c));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = AccelConfig { max_instances: 32, cache: CacheConfig::small(), ..Default::default() };
        config.save_to(&path).unwrap();
        assert_eq!(AccelConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "ring_depth": 3, "cache": { "render_width": 640 } }"#).unwrap();
        let config = AccelConfig::load_from(&path).unwrap();
        assert_eq!(config.ring_depth, 3);
        assert_eq!(config.max_instances, 16);
        assert_eq!(config.cache.render_width, 640);
        assert_eq!(config.cache.render_height, 1080);
    }

    #[test]
    fn test_missing_and_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert!(matches!(AccelConfig::load_from(&path), Err(Error::ConfigNotFound(_))));

        std::fs::write(&path, r#"{ "ring_depth": 99 }"#).unwrap();
        assert!(matches!(AccelConfig::load_from(&path), Err(Error::InvalidConfig(_))));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(AccelConfig::load_from(&path), Err(Error::Json(_))));
    }
}
