//! denoise-wgpu build utilities
//!
//! This crate turns the WGSL kernel manifest of denoise-wgpu into compiled kernel
//! descriptions. Every kernel's shader is reflected with naga so that the bindings
//! it declares match the slots listed in the manifest, and is optionally minified
//! before being embedded into the runtime crate by its build script.

mod minify;

pub mod kernels;
pub mod reflect;

pub use minify::minify_wgsl;

/// Converts a WGSL kernel manifest file to compiled ExecutableKernels
///
/// Loads a YAML kernel manifest, reads each kernel's WGSL file relative to the
/// manifest directory, checks the shader against the declared slots, and minifies
/// it when requested.
///
/// # Arguments
/// * `wgsl_manifest_filepath` - Path to the YAML manifest file
/// * `minify` - Whether to minify the WGSL code
///
/// # Returns
/// The compiled kernels in manifest order
pub fn wgsl_manifest_to_executable_kernels(wgsl_manifest_filepath: &str, minify: bool) -> Result<Vec<kernels::ExecutableKernel>, std::boxed::Box<dyn std::error::Error>> {
    let dir = std::path::Path::new(wgsl_manifest_filepath).parent().unwrap_or(std::path::Path::new("."));
    kernels::ExecutableKernel::from_file(wgsl_manifest_filepath, |filename: &str| {
        let path = dir.join(filename);
        let code = std::fs::read_to_string(&path).inspect_err(|e| {
            eprintln!("Error reading file {path:?}: {e}");
        })?;
        let code = if minify {
            minify_wgsl(&code).map_err(|e| {
                eprintln!("Error minifying WGSL code in file {path:?}: {e}");
                std::io::Error::new(std::io::ErrorKind::InvalidData, format!("Failed to minify WGSL code in file {path:?}"))
            })?
        } else {
            code
        };
        Ok(code)
    })
}
