//! Kernel manifest parsing and compilation
//!
//! This module converts the human-readable kernel manifest into compiled kernels
//! whose shader bindings have been checked against their declared slots.

mod executable_kernel;
mod kernel_specs;

pub use executable_kernel::*;
pub use kernel_specs::*;
