//! Error types for the acceleration structure manager.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for frame building and resource management.
#[derive(Error, Debug)]
pub enum Error {
    /// More live geometry groups than binding table slots.
    /// The frame is rejected instead of silently dropping geometry.
    #[error("Instance capacity exceeded: {live} live geometry groups, maximum is {max}")]
    CapacityExceeded { live: usize, max: u32 },

    /// A fixed-size resource would have to change size.
    /// The caller must tear down and rebuild the whole pipeline.
    #[error("Reconnect required: {0}")]
    NeedsReconnect(String),

    /// Malformed per-frame geometry arrays from the extractor
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Texture id or pixel data rejected by the registry
    #[error("Invalid texture: {0}")]
    InvalidTexture(String),

    /// Configuration value out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An event handler is already registered with the engine adapter
    #[error("An event handler is already registered")]
    AlreadyRegistered,

    /// Failure reported by the ray tracing backend
    #[error("Backend error: {0}")]
    Backend(String),

    /// Configuration file does not exist
    #[error("Config file not found: {0}")]
    ConfigNotFound(PathBuf),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a backend error from a string.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create an invalid geometry error.
    pub fn invalid_geometry(msg: impl Into<String>) -> Self {
        Self::InvalidGeometry(msg.into())
    }

    /// Create an invalid config error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// True for conditions that must terminate rendering.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::NeedsReconnect(_))
    }
}

/// Result type alias for acceleration structure operations.
pub type Result<T> = std::result::Result<T, Error>;
