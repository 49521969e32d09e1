//! Texture registry shared by all frame slots.
//!
//! Textures arrive from the engine at any time. Each slot's binding table is
//! brought up to date when the slot is next acquired, so a table is never
//! rewritten while a frame reading it may still be in flight. Unbound indices
//! point at a 2x2 magenta texture.

use tracing::debug;

use crate::backend::RtBackend;
use crate::util::{Error, Result};

/// Side of the placeholder texture.
pub const DUMMY_TEXTURE_SIZE: u32 = 2;

/// RGBA8 magenta, 2x2.
pub const DUMMY_TEXTURE_PIXELS: [u8; 16] = [
    255, 0, 255, 255, 255, 0, 255, 255, //
    255, 0, 255, 255, 255, 0, 255, 255,
];

struct Entry<B: RtBackend> {
    texture: B::Texture,
    version: u64,
}

/// Textures by engine id with a version per id.
pub struct TextureRegistry<B: RtBackend> {
    dummy: B::Texture,
    entries: Vec<Option<Entry<B>>>,
    /// Bumped on every change; slots compare it to skip unchanged frames.
    generation: u64,
}

impl<B: RtBackend> TextureRegistry<B> {
    pub fn new(backend: &mut B, max_textures: u32) -> Result<Self> {
        let dummy = backend.create_texture(
            DUMMY_TEXTURE_SIZE,
            DUMMY_TEXTURE_SIZE,
            &DUMMY_TEXTURE_PIXELS,
            "dummy_texture",
        )?;
        let mut entries = Vec::new();
        entries.resize_with(max_textures as usize, || None);
        Ok(Self { dummy, entries, generation: 0 })
    }

    pub fn capacity(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn dummy(&self) -> &B::Texture {
        &self.dummy
    }

    /// Number of ids with an uploaded texture.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Upload a texture for `id`, replacing any previous one.
    pub fn insert(&mut self, backend: &mut B, id: u32, width: u32, height: u32, pixels: &[u8]) -> Result<()> {
        let capacity = self.capacity();
        let slot = self.entries.get_mut(id as usize).ok_or_else(|| {
            Error::InvalidTexture(format!("texture id {id} exceeds the binding table size {capacity}"))
        })?;
        if width == 0 || height == 0 || pixels.len() != width as usize * height as usize * 4 {
            return Err(Error::InvalidTexture(format!(
                "texture {id}: {width}x{height} RGBA8 needs {} bytes, got {}",
                width as usize * height as usize * 4,
                pixels.len()
            )));
        }
        let texture = backend.create_texture(width, height, pixels, "engine_texture")?;
        self.generation += 1;
        *slot = Some(Entry { texture, version: self.generation });
        debug!(id, width, height, generation = self.generation, "texture ready");
        Ok(())
    }

    /// Version of `id`, 0 for the dummy.
    pub fn version(&self, id: u32) -> u64 {
        self.entries
            .get(id as usize)
            .and_then(Option::as_ref)
            .map_or(0, |e| e.version)
    }

    /// Texture bound at `id` (the dummy when none was uploaded).
    pub fn get(&self, id: u32) -> &B::Texture {
        self.entries
            .get(id as usize)
            .and_then(Option::as_ref)
            .map_or(&self.dummy, |e| &e.texture)
    }

    /// Rewrite the texture bindings of `table` whose version differs from
    /// `bound`. Returns how many were rewritten.
    pub fn sync_table(&self, backend: &mut B, table: &mut B::BindingTable, bound: &mut [u64]) -> Result<usize> {
        let mut written = 0;
        for (id, bound_version) in bound.iter_mut().enumerate().take(self.entries.len()) {
            let version = self.version(id as u32);
            if version != *bound_version {
                backend.write_texture_binding(table, id as u32, self.get(id as u32))?;
                *bound_version = version;
                written += 1;
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BindingLayout, HostBackend};

    #[test]
    fn test_dummy_is_magenta() {
        let mut backend = HostBackend::new();
        let registry = TextureRegistry::new(&mut backend, 8).unwrap();
        let dummy = registry.dummy();
        assert_eq!((dummy.width, dummy.height), (2, 2));
        assert!(dummy.pixels.chunks(4).all(|p| p == [255, 0, 255, 255]));
        assert_eq!(registry.get(3).id, dummy.id);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_insert_and_sync() {
        let mut backend = HostBackend::new();
        let mut registry = TextureRegistry::new(&mut backend, 4).unwrap();
        let layout = BindingLayout { max_geometries: 1, max_textures: 4 };
        let mut table = backend.create_binding_table(layout, "t").unwrap();
        let mut bound = vec![u64::MAX; 4];

        // Fresh table: everything bound to the dummy
        assert_eq!(registry.sync_table(&mut backend, &mut table, &mut bound).unwrap(), 4);
        assert_eq!(table.texture(2), Some(registry.dummy().id));

        registry.insert(&mut backend, 2, 1, 1, &[1, 2, 3, 4]).unwrap();
        assert_eq!(registry.sync_table(&mut backend, &mut table, &mut bound).unwrap(), 1);
        assert_eq!(table.texture(2), Some(registry.get(2).id));
        assert_eq!(registry.sync_table(&mut backend, &mut table, &mut bound).unwrap(), 0);

        // Re-upload bumps the version and rebinds only that index
        registry.insert(&mut backend, 2, 1, 1, &[5, 6, 7, 8]).unwrap();
        assert_eq!(registry.sync_table(&mut backend, &mut table, &mut bound).unwrap(), 1);
        assert_eq!(table.texture(2), Some(registry.get(2).id));
        assert_eq!(table.texture(1), Some(registry.dummy().id));
    }

    #[test]
    fn test_rejects_bad_input() {
        let mut backend = HostBackend::new();
        let mut registry = TextureRegistry::new(&mut backend, 4).unwrap();
        assert!(matches!(
            registry.insert(&mut backend, 4, 1, 1, &[0; 4]),
            Err(Error::InvalidTexture(_))
        ));
        assert!(registry.insert(&mut backend, 0, 2, 1, &[0; 4]).is_err());
        assert_eq!(registry.generation(), 0);
    }
}
