//! WGSL shader minification utilities.
//!
//! This module provides functionality to reduce the size of WGSL kernel source code.

use crate::reflect::parse_and_validate;

/// Minifies WGSL shader source code to reduce binary size.
///
/// Uses `naga` to parse, validate, and regenerate the WGSL code in a more compact form.
/// Entry point names are preserved; bindings keep their group and binding indices.
///
/// # Arguments
///
/// * `shader` - A string slice containing the WGSL shader source code.
///
/// # Returns
///
/// A `Result` containing the minified WGSL source code as a `String`, or an error if parsing fails.
pub fn minify_wgsl(shader: &str) -> Result<String, std::boxed::Box<dyn std::error::Error>> {
    let (mut module, _) = parse_and_validate(shader)?;

    wgsl_minifier::minify_module(&mut module);

    let mut validator = naga::valid::Validator::new(naga::valid::ValidationFlags::all(), naga::valid::Capabilities::all());
    let info = validator.validate(&module)?;
    let output = naga::back::wgsl::write_string(&module, &info, naga::back::wgsl::WriterFlags::empty())?;

    Ok(wgsl_minifier::minify_wgsl_source(&output))
}
