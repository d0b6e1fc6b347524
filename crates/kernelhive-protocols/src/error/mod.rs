//! Error types for the KernelHive protocol layer.

mod engine;
mod kernel;

pub use engine::*;
pub use kernel::*;
