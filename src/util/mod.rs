//! Basic shared types: errors, fixed-point and timestamp encodings.

pub mod error;
pub mod fixed;

pub use error::{Error, Result};
