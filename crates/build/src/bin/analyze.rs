//! Kernel manifest analysis tool
//!
//! This binary loads a denoise-wgpu kernel manifest, compiles every kernel it
//! lists (checking each shader's bindings against the declared slots), and dumps
//! the result to stdout.

use denoise_wgpu_build::kernels::ExecutableKernel;
use std::env;
use std::fs;
use std::path::Path;
use std::process;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args.len() > 3 || (args.len() == 3 && args[2] != "--json") {
        eprintln!("Usage: {} <kernels.yaml> [--json]", args[0]);
        eprintln!("Analyzes a YAML kernel manifest and dumps the compiled kernels to stdout");
        process::exit(1);
    }

    let manifest_path = &args[1];
    let as_json = args.len() == 3;

    if !Path::new(manifest_path).exists() {
        eprintln!("Error: Manifest file '{manifest_path}' does not exist");
        process::exit(1);
    }

    let load_shader_file = |file_path: &str| -> Result<String, std::io::Error> {
        let manifest_dir = Path::new(manifest_path).parent().unwrap_or(Path::new("."));
        let shader_path = manifest_dir.join(file_path);

        if shader_path.exists() { fs::read_to_string(shader_path) } else { fs::read_to_string(file_path) }
    };

    match ExecutableKernel::from_file(manifest_path, load_shader_file) {
        Ok(kernels) if as_json => match serde_json::to_string_pretty(&kernels) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Error serializing kernels: {e}");
                process::exit(1);
            }
        },
        Ok(kernels) => {
            for kernel in &kernels {
                println!("{kernel:#?}");
            }
        }
        Err(e) => {
            eprintln!("Error compiling manifest '{manifest_path}': {e}");
            process::exit(1);
        }
    }
}
