//! Utility types shared across the crate.
//!
//! - [`Error`] / [`Result`] - Error handling
//! - Instance transform layout

mod error;
mod math;

pub use error::*;
pub use math::*;
