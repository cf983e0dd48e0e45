//! Build script for denoise-wgpu crate
//!
//! This build script compiles the WGSL kernel manifest into Rust constants.
//! Each kernel's shader is checked against the slots declared in the manifest,
//! minified, and embedded directly into the compiled binary as a `KernelProgram`.

use denoise_wgpu_build::{kernels::ExecutableKernel, wgsl_manifest_to_executable_kernels};

/// Converts WGSL shader source into a Rust string literal
fn dump_shader_string_literal(shader: &str) -> String {
    let escaped_shader = shader.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n");
    format!("\"{escaped_shader}\"")
}

/// Generates Rust code for a KernelProgram constant
fn dump_kernel_program(kernel: &ExecutableKernel) -> String {
    let mut output = String::new();
    output.push_str("KernelProgram {\n");
    output.push_str(&format!("    name: {:?},\n", kernel.name));
    output.push_str(&format!("    entry_point: {:?},\n", kernel.entry_point));
    output.push_str(&format!("    tile_size: {},\n", kernel.tile_size));
    output.push_str(&format!("    shader: {},\n", dump_shader_string_literal(&kernel.shader)));

    output.push_str("    slots: &[\n");
    for slot in &kernel.slots {
        output.push_str("        KernelSlot {\n");
        output.push_str(&format!("            role: SlotRole::{:?},\n", slot.role));
        output.push_str(&format!("            binding: {},\n", slot.binding));
        output.push_str(&format!("            class: BindingClass::{:?},\n", slot.class));
        output.push_str("        },\n");
    }
    output.push_str("    ],\n");
    output.push('}');

    output
}

/// Generates the kernels.rs file with one constant per manifest entry
fn write_code() {
    let manifest_dir = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let manifest_path = manifest_dir.join("wgsl").join("kernels.yaml");
    let manifest_path = manifest_path.to_str().expect("Failed to convert path to string");

    println!("cargo:rerun-if-changed=wgsl");

    let kernels = wgsl_manifest_to_executable_kernels(manifest_path, true).expect("Failed to compile WGSL kernel manifest");

    let mut code = String::new();
    code.push_str("// This file is generated by the build script.\n\n");
    code.push_str("use crate::kernel::*;\n\n");
    for kernel in &kernels {
        println!("Processing kernel: {} ({})", kernel.id, kernel.name);
        if let Some(description) = &kernel.description {
            code.push_str(&format!("/// {description}\n"));
        }
        code.push_str(&format!("pub const {}: KernelProgram = {};\n\n", kernel.id, dump_kernel_program(kernel)));
    }
    code.push_str("// END OF GENERATED CODE\n");

    let out_dir = std::env::var("OUT_DIR").expect("OUT_DIR not set");
    let output_path = std::path::PathBuf::from(out_dir).join("kernels.rs");
    std::fs::write(output_path, code).expect("Failed to write kernels.rs");
}

/// Build script main function
///
/// Sets up conditional compilation flags and generates all kernel constants.
fn main() {
    cfg_aliases::cfg_aliases! {
        // Platforms where wgpu ships a Vulkan backend
        vulkan: {
            any(
                windows,
                all(
                    unix,
                    not(any(target_os = "macos", target_os = "ios", target_os = "emscripten"))
                )
            )
        },
    }

    write_code();
}
