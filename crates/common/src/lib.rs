//! Common utilities and types shared across the VIP controller crates.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
