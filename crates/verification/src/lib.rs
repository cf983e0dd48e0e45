//! Verification utilities for denoise-wgpu
//!
//! This crate provides CPU reference implementations of the denoising kernels
//! and tools for comparing accelerator output against them.

pub mod compare;
pub mod reference;
pub mod synthetic;
