//! Kernel program definitions
//!
//! This module defines the runtime form of the compute kernels embedded by the
//! build script, plus the host-side layouts of the data they exchange with the
//! device (the shared uniform parameter block and the accumulation texel).

use bytemuck::{Pod, Zeroable};

/// How a compute program accesses one of its bindings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingClass {
    /// A sampled 2D image read with `textureLoad`
    Image,
    /// A storage buffer the program only reads
    StorageRead,
    /// A storage buffer the program writes (and possibly reads back)
    StorageReadWrite,
    /// A uniform block of per-dispatch scalar parameters
    Uniform,
}

/// The logical role of a slot within a filter topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotRole {
    /// Final filtered pixels
    Output,
    /// Source pixels of the single-pass topology
    Input,
    /// The frame being denoised by the accumulation topology
    Target,
    /// The frame blended into the target during one accumulation dispatch
    Neighbour,
    /// Per-pixel (weighted color sum, weight) texels
    Accumulation,
    /// Per-dispatch scalar parameters
    Parameters,
}

/// Binding information for one kernel slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSlot {
    /// Role of the resource bound here
    pub role: SlotRole,
    /// Shader binding point index (group 0)
    pub binding: u32,
    /// Access class of the WGSL declaration
    pub class: BindingClass,
}

/// A compute kernel embedded at build time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelProgram {
    /// Human-readable name for debugging
    pub name: &'static str,
    /// Compute entry point
    pub entry_point: &'static str,
    /// Square work-group edge length
    pub tile_size: u32,
    /// WGSL shader source code
    pub shader: &'static str,
    /// Declared slots sorted by binding
    pub slots: &'static [KernelSlot],
}

impl KernelProgram {
    /// Returns the slot that plays `role`, if the kernel declares one
    pub fn slot(&self, role: SlotRole) -> Option<&KernelSlot> {
        self.slots.iter().find(|slot| slot.role == role)
    }

    /// Number of work-groups needed to cover a `width` x `height` image
    pub fn dispatch_size(&self, width: u32, height: u32) -> (u32, u32) {
        (width.div_ceil(self.tile_size), height.div_ceil(self.tile_size))
    }
}

/// Uniform block shared by every kernel
///
/// Kernels ignore the fields that do not apply to them.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct DispatchParams {
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
    /// Window radius (bilateral) or patch radius (accumulation)
    pub radius: u32,
    /// Non-zero when the neighbour buffer holds packed RGBA8 words
    pub packed: u32,
    /// Spatial sigma of the bilateral filter
    pub sigma_spatial: f32,
    /// Range sigma of the bilateral filter
    pub sigma_range: f32,
    /// Accumulation filter strength `h`
    pub strength: f32,
    reserved: f32,
}

impl DispatchParams {
    /// Size of the uniform block in bytes
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    /// Parameters carrying only the image dimensions
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Self::zeroed()
        }
    }
}

/// One accumulation buffer texel: weighted color sum and total weight
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct AccumTexel {
    /// Sum of weighted RGBA samples
    pub color: [f32; 4],
    /// Sum of weights
    pub weight: f32,
    padding: [f32; 3],
}

impl AccumTexel {
    /// Size of one texel in a WGSL storage array
    pub const STRIDE: u64 = std::mem::size_of::<Self>() as u64;

    /// Creates a texel
    pub fn new(color: [f32; 4], weight: f32) -> Self {
        Self { color, weight, padding: [0.0; 3] }
    }

    /// The normalized color, or `None` for a zero weight
    pub fn normalized(&self) -> Option<[f32; 4]> {
        (self.weight > 0.0).then(|| self.color.map(|c| c / self.weight))
    }
}
