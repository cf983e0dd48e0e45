//! Compute kernels compiled from `wgsl/kernels.yaml` by the build script
//!
//! * [`BILATERAL`] implements the single-pass topology.
//! * [`ACCUMULATE`] and [`NORMALIZE`] implement the two halves of the two-pass topology.

include!(concat!(env!("OUT_DIR"), "/kernels.rs"));
