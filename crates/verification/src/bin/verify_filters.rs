//! Filter verification binary
//!
//! This binary runs both denoising topologies on the accelerator and compares
//! the results with the CPU reference kernels. It uses the given image as the
//! target (the two-pass burst adds noisy copies of it), or a synthetic noisy
//! gradient when no image is given.

use denoise_wgpu::{AccumulationParams, BilateralParams, ContextOptions, Frame, FrameSource, GpuContext, PixelFormat, Run, RunConfig, Topology};
use denoise_wgpu_verification::{
    compare::{CompareResult, compare_pixels},
    reference,
    synthetic::{add_noise, noisy_burst, noisy_gradient},
};
use std::time::{Duration, Instant};

const TOLERANCE: f32 = 1e-4;
const BURST: usize = 4;

fn load_target(path: Option<&String>) -> Result<Frame, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let image = image::open(path).map_err(|e| format!("Failed to open input image: {e}"))?.to_rgba8();
            Ok(Frame::new(image.width(), image.height(), PixelFormat::Rgba8Unorm, image.into_raw())?)
        }
        None => Ok(noisy_gradient(96, 64, PixelFormat::Rgba8Unorm, 0.08, 1)?),
    }
}

fn report(name: &str, result: CompareResult, gpu: Duration, cpu: Duration) -> bool {
    match result {
        CompareResult::Match { max_error } => {
            println!("✓ {name} matches the reference (max error {max_error:.2e}, GPU: {gpu:.2?}, CPU: {cpu:.2?})");
            true
        }
        CompareResult::DimensionMismatch { reference_pixels, actual_pixels } => {
            eprintln!("✗ {name}: reference has {reference_pixels} pixels, GPU output has {actual_pixels}");
            false
        }
        CompareResult::PixelMismatch {
            max_error,
            first_mismatch,
            r_matched,
            g_matched,
            b_matched,
            a_matched,
        } => {
            eprintln!("✗ {name}: max error {max_error:.2e} at pixel {first_mismatch} and later: R {r_matched}, G {g_matched}, B {b_matched}, A {a_matched}");
            false
        }
    }
}

fn boxed(frames: &[Frame]) -> Vec<Box<dyn FrameSource>> {
    frames.iter().cloned().map(|frame| Box::new(frame) as Box<dyn FrameSource>).collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 2 {
        eprintln!("Usage: {} [input_image]", args[0]);
        return Ok(());
    }

    let target = load_target(args.get(1))?;
    println!("Target: {}", target.shape());

    let ctx = GpuContext::new(&ContextOptions::default()).await?;
    println!("Adapter: {} ({:?})", ctx.adapter_info().name, ctx.adapter_info().backend);

    let mut all_matched = true;

    for params in [
        BilateralParams { sigma_spatial: 1.0, sigma_range: 0.1 },
        BilateralParams { sigma_spatial: 3.0, sigma_range: 0.3 },
    ] {
        let config = RunConfig::default().with_topology(Topology::SinglePass(params));
        let mut run = Run::configure(config, boxed(std::slice::from_ref(&target)))?;
        let started = Instant::now();
        let output = run.run(&ctx)?;
        let gpu = started.elapsed();

        let started = Instant::now();
        let expected = reference::bilateral(&target, &params);
        let cpu = started.elapsed();

        let name = format!("bilateral σs={} σr={}", params.sigma_spatial, params.sigma_range);
        all_matched &= report(&name, compare_pixels(&expected, &output.float_pixels[0], TOLERANCE), gpu, cpu);
    }

    let burst = match args.get(1) {
        Some(_) => {
            let mut burst = vec![target.clone()];
            for seed in 1..BURST as u32 {
                burst.push(add_noise(&target, 0.05, seed)?);
            }
            burst
        }
        None => noisy_burst(target.width(), target.height(), PixelFormat::Rgba8Unorm, 0.08, BURST)?,
    };

    let params = AccumulationParams { strength: 0.15, patch_radius: 1 };
    let started = Instant::now();
    let (expected, _) = reference::denoise_sequence(&burst, &params)?;
    let cpu = started.elapsed();

    for overlap in [false, true] {
        let config = RunConfig::default().with_topology(Topology::TwoPass(params)).with_overlap(overlap);
        let mut run = Run::configure(config, boxed(&burst))?;
        let started = Instant::now();
        let output = run.run(&ctx)?;
        let gpu = started.elapsed();

        let name = format!("two-pass {} frames{}", burst.len(), if overlap { " (overlap)" } else { "" });
        all_matched &= report(&name, compare_pixels(&expected, &output.float_pixels[0], TOLERANCE), gpu, cpu);
        println!("  {} passes, compute {:.2?}, transfer {:.2?}", output.passes, output.totals.exec(), output.totals.transfer());
    }

    if !all_matched {
        std::process::exit(1);
    }
    Ok(())
}
