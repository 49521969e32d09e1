//! Engine event interface.
//!
//! The engine reports world reloads and texture uploads through
//! [`EngineEvents`]. A handler is registered once with an [`EngineAdapter`];
//! a second registration is refused.

use tracing::trace;

use crate::util::{Error, Result};

/// Notifications the renderer reacts to.
pub trait EngineEvents {
    /// A new world was loaded; static geometry must be rebuilt.
    fn on_world_reloaded(&mut self) -> Result<()>;

    /// RGBA8 pixels for texture `id` are available.
    fn on_texture_ready(&mut self, id: u32, width: u32, height: u32, pixels: &[u8]) -> Result<()>;
}

/// Engine-side owner of the single event handler.
pub struct EngineAdapter<H: EngineEvents> {
    handler: Option<H>,
}

impl<H: EngineEvents> Default for EngineAdapter<H> {
    fn default() -> Self {
        Self { handler: None }
    }
}

impl<H: EngineEvents> EngineAdapter<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the handler. Fails if one is already registered.
    pub fn register(&mut self, handler: H) -> Result<()> {
        if self.handler.is_some() {
            return Err(Error::AlreadyRegistered);
        }
        self.handler = Some(handler);
        Ok(())
    }

    /// Remove and return the handler.
    pub fn unregister(&mut self) -> Option<H> {
        self.handler.take()
    }

    pub fn is_registered(&self) -> bool {
        self.handler.is_some()
    }

    pub fn handler(&self) -> Option<&H> {
        self.handler.as_ref()
    }

    pub fn handler_mut(&mut self) -> Option<&mut H> {
        self.handler.as_mut()
    }

    pub fn world_reloaded(&mut self) -> Result<()> {
        match self.handler.as_mut() {
            Some(h) => h.on_world_reloaded(),
            None => {
                trace!("world reload without handler");
                Ok(())
            }
        }
    }

    pub fn texture_ready(&mut self, id: u32, width: u32, height: u32, pixels: &[u8]) -> Result<()> {
        match self.handler.as_mut() {
            Some(h) => h.on_texture_ready(id, width, height, pixels),
            None => {
                trace!(id, "texture without handler");
                Ok(())
            }
        }
    }
}
