//! Kernel manifest parser
//!
//! This module parses the YAML manifest that describes every compute kernel
//! shipped with denoise-wgpu: which WGSL file implements it, which entry point
//! to call, the work-group tile size, and the slots (bindings) the kernel
//! expects together with the role each slot plays in a filter topology.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// How a compute program accesses one of its bindings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
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

impl fmt::Display for BindingClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Image => "image",
            Self::StorageRead => "storage_read",
            Self::StorageReadWrite => "storage_read_write",
            Self::Uniform => "uniform",
        };
        f.write_str(name)
    }
}

/// The logical role of a slot within a filter topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
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

impl fmt::Display for SlotRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Output => "output",
            Self::Input => "input",
            Self::Target => "target",
            Self::Neighbour => "neighbour",
            Self::Accumulation => "accumulation",
            Self::Parameters => "parameters",
        };
        f.write_str(name)
    }
}

/// A binding declared by a kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct SlotSpec {
    /// Role of the resource bound here
    pub role: SlotRole,
    /// Shader binding point index (group 0)
    pub binding: u32,
    /// Access class the WGSL declaration must have
    pub class: BindingClass,
}

fn default_entry_point() -> String {
    "main".to_string()
}

/// A single kernel entry in the manifest
#[derive(Debug, Clone, Deserialize)]
pub struct KernelSpec {
    /// Unique identifier, used as the generated constant name
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Optional description
    #[serde(default)]
    pub description: Option<String>,
    /// WGSL file path relative to the manifest
    pub file: String,
    /// Compute entry point (defaults to `main`)
    #[serde(default = "default_entry_point")]
    pub entry_point: String,
    /// Square work-group edge length the entry point is declared with
    pub tile_size: u32,
    /// Declared bindings
    pub slots: Vec<SlotSpec>,
}

/// Raw kernel manifest as parsed from YAML
#[derive(Debug, Clone, Deserialize)]
pub struct KernelManifest {
    /// All kernels described by this manifest
    pub kernels: Vec<KernelSpec>,
}

impl KernelManifest {
    /// Parses a kernel manifest from YAML content
    pub fn from_yaml(yaml_content: &str) -> Result<Self, serde_norway::Error> {
        serde_norway::from_str(yaml_content)
    }

    /// Parses a kernel manifest from a YAML file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_yaml(&content)?)
    }

    /// Validates the manifest for structural errors
    ///
    /// Checks identifier uniqueness, tile sizes, and that every kernel declares
    /// each binding point and each role at most once.
    pub fn validate(&self) -> Result<(), ManifestValidationError> {
        if self.kernels.is_empty() {
            return Err(ManifestValidationError::NoKernels);
        }

        let mut ids = HashSet::new();
        for kernel in &self.kernels {
            if kernel.id.is_empty() {
                return Err(ManifestValidationError::EmptyId);
            }
            if !ids.insert(kernel.id.as_str()) {
                return Err(ManifestValidationError::DuplicateId(kernel.id.clone()));
            }
            if kernel.tile_size == 0 {
                return Err(ManifestValidationError::ZeroTileSize(kernel.id.clone()));
            }
            if kernel.slots.is_empty() {
                return Err(ManifestValidationError::NoSlots(kernel.id.clone()));
            }

            let mut bindings = HashSet::new();
            let mut roles = HashSet::new();
            for slot in &kernel.slots {
                if !bindings.insert(slot.binding) {
                    return Err(ManifestValidationError::DuplicateBinding {
                        kernel: kernel.id.clone(),
                        binding: slot.binding,
                    });
                }
                if !roles.insert(slot.role) {
                    return Err(ManifestValidationError::DuplicateRole {
                        kernel: kernel.id.clone(),
                        role: slot.role,
                    });
                }
            }
        }

        Ok(())
    }
}

/// Structural errors found by [`KernelManifest::validate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestValidationError {
    /// The manifest lists no kernels
    NoKernels,
    /// A kernel has an empty identifier
    EmptyId,
    /// Two kernels share an identifier
    DuplicateId(String),
    /// A kernel declares a zero tile size
    ZeroTileSize(String),
    /// A kernel declares no slots
    NoSlots(String),
    /// A binding point is declared twice within one kernel
    DuplicateBinding { kernel: String, binding: u32 },
    /// A role is declared twice within one kernel
    DuplicateRole { kernel: String, role: SlotRole },
}

impl fmt::Display for ManifestValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoKernels => write!(f, "Manifest declares no kernels"),
            Self::EmptyId => write!(f, "Kernel ID cannot be empty"),
            Self::DuplicateId(id) => write!(f, "Duplicate kernel ID '{id}'"),
            Self::ZeroTileSize(id) => write!(f, "Kernel '{id}' declares a zero tile size"),
            Self::NoSlots(id) => write!(f, "Kernel '{id}' declares no slots"),
            Self::DuplicateBinding { kernel, binding } => write!(f, "Kernel '{kernel}' declares binding {binding} more than once"),
            Self::DuplicateRole { kernel, role } => write!(f, "Kernel '{kernel}' declares role '{role}' more than once"),
        }
    }
}

impl std::error::Error for ManifestValidationError {}
