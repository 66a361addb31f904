//! Courier - Core traits, types, and constants.
//!
//! This module provides the foundational types shared by every layer.
//! It has minimal dependencies and no I/O.

mod constants;
mod error;
mod traits;
mod types;

pub use constants::*;
pub use error::*;
pub use traits::*;
pub use types::*;
