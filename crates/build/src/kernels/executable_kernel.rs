//! ExecutableKernel compilation
//!
//! Turns a manifest [`KernelSpec`] into an [`ExecutableKernel`]: the WGSL source is
//! loaded, checked against the declared slots through naga reflection, optionally
//! minified, and the slots are sorted by binding so bind group layouts can be
//! generated directly from them.

use super::{KernelManifest, KernelSpec, SlotSpec};
use crate::reflect::{ReflectError, check_declared_slots};
use serde::Serialize;
use std::fmt;

/// A compiled kernel ready to be embedded into the runtime crate
#[derive(Debug, Clone, Serialize)]
pub struct ExecutableKernel {
    /// Unique identifier, used as the generated constant name
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Optional description
    pub description: Option<String>,
    /// Compute entry point
    pub entry_point: String,
    /// Square work-group edge length
    pub tile_size: u32,
    /// WGSL shader source code
    pub shader: String,
    /// Declared slots sorted by binding
    pub slots: Vec<SlotSpec>,
}

/// Errors raised while compiling a kernel manifest
#[derive(Debug)]
pub enum KernelCompileError {
    /// The shader file could not be loaded
    Io { kernel: String, source: std::io::Error },
    /// The shader does not match its manifest declaration
    Reflect { kernel: String, source: ReflectError },
}

impl fmt::Display for KernelCompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { kernel, source } => write!(f, "Failed to load shader of kernel '{kernel}': {source}"),
            Self::Reflect { kernel, source } => write!(f, "Kernel '{kernel}' does not match its shader: {source}"),
        }
    }
}

impl std::error::Error for KernelCompileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Reflect { source, .. } => Some(source),
        }
    }
}

impl KernelSpec {
    /// Compiles this kernel specification into an executable kernel
    ///
    /// # Arguments
    /// * `load_shader_file` - Function to load (and optionally minify) shader source files
    ///
    /// # Returns
    /// The compiled kernel, or an error if the shader cannot be loaded or does not match the declared slots
    pub fn compile(&self, load_shader_file: impl Fn(&str) -> Result<String, std::io::Error>) -> Result<ExecutableKernel, KernelCompileError> {
        let shader = load_shader_file(&self.file).map_err(|source| KernelCompileError::Io { kernel: self.id.clone(), source })?;

        check_declared_slots(&shader, &self.entry_point, self.tile_size, &self.slots).map_err(|source| KernelCompileError::Reflect { kernel: self.id.clone(), source })?;

        let mut slots = self.slots.clone();
        slots.sort_by_key(|slot| slot.binding);

        Ok(ExecutableKernel {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            entry_point: self.entry_point.clone(),
            tile_size: self.tile_size,
            shader,
            slots,
        })
    }
}

impl ExecutableKernel {
    /// Compiles every kernel of a YAML manifest file
    ///
    /// # Arguments
    /// * `path` - Path to the YAML manifest file
    /// * `load_shader_file` - Function to load shader source files
    ///
    /// # Returns
    /// The compiled kernels in manifest order
    pub fn from_file<P: AsRef<std::path::Path>>(path: P, load_shader_file: impl Fn(&str) -> Result<String, std::io::Error>) -> Result<Vec<Self>, Box<dyn std::error::Error>> {
        let manifest = KernelManifest::from_file(path)?;
        manifest.validate()?;

        let mut kernels = Vec::with_capacity(manifest.kernels.len());
        for spec in &manifest.kernels {
            kernels.push(spec.compile(&load_shader_file)?);
        }
        Ok(kernels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{BindingClass, SlotRole};

    const SHADER: &str = r#"
struct Params { width: u32, height: u32 }

@group(0) @binding(2) var<uniform> params: Params;
@group(0) @binding(0) var<storage, read_write> output: array<vec4<f32>>;
@group(0) @binding(1) var input: texture_2d<f32>;

@compute @workgroup_size(16, 16, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x >= params.width || id.y >= params.height) { return; }
    output[id.y * params.width + id.x] = textureLoad(input, vec2<i32>(id.xy), 0);
}
"#;

    fn spec() -> KernelSpec {
        KernelSpec {
            id: "COPY".to_string(),
            name: "Copy".to_string(),
            description: None,
            file: "copy.wgsl".to_string(),
            entry_point: "main".to_string(),
            tile_size: 16,
            slots: vec![
                SlotSpec { role: SlotRole::Parameters, binding: 2, class: BindingClass::Uniform },
                SlotSpec { role: SlotRole::Output, binding: 0, class: BindingClass::StorageReadWrite },
                SlotSpec { role: SlotRole::Input, binding: 1, class: BindingClass::Image },
            ],
        }
    }

    #[test]
    fn test_compile_sorts_slots() {
        let kernel = spec().compile(|_| Ok(SHADER.to_string())).unwrap();
        let bindings: Vec<u32> = kernel.slots.iter().map(|slot| slot.binding).collect();
        assert_eq!(bindings, vec![0, 1, 2]);
        assert_eq!(kernel.shader, SHADER);
    }

    #[test]
    fn test_compile_reports_missing_file() {
        let result = spec().compile(|name| Err(std::io::Error::new(std::io::ErrorKind::NotFound, name.to_string())));
        assert!(matches!(result, Err(KernelCompileError::Io { .. })));
    }

    #[test]
    fn test_compile_rejects_class_mismatch() {
        let mut spec = spec();
        spec.slots[2].class = BindingClass::StorageRead;
        let result = spec.compile(|_| Ok(SHADER.to_string()));
        assert!(matches!(result, Err(KernelCompileError::Reflect { .. })));
    }
}
