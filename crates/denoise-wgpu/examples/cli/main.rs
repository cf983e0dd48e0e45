//! Denoise CLI
//!
//! A command-line tool that denoises an image, or a burst of aligned frames,
//! on the GPU. The single-pass topology filters every input with an edge-aware
//! bilateral kernel; the two-pass topology blends all inputs into the first one
//! with patch-similarity weights.
//!
//! # Usage
//! ```bash
//! denoise-cli noisy.png -o clean.png --sigma-spatial 2 --sigma-range 0.1
//! denoise-cli f0.png f1.png f2.png -o clean.png --topology two-pass --overlap
//! ```

use clap::{Parser, ValueEnum};
use denoise_wgpu::{AccumulationParams, BilateralParams, BoxError, ContextOptions, Frame, FrameSource, GpuContext, PixelFormat, Run, RunConfig, Topology};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TopologyArg {
    /// Edge-aware bilateral filter, one output per input
    Single,
    /// Patch-weighted accumulation over all inputs, then normalization
    TwoPass,
}

/// Command-line arguments for the denoiser
#[derive(Parser)]
#[command(version, about = "CLI tool for denoising images on the GPU")]
struct Args {
    /// Input image files; the first one is the denoising target of the two-pass topology
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Output image file path
    #[arg(long, short)]
    output: PathBuf,

    /// Filter topology
    #[arg(long, short, value_enum, default_value = "single")]
    topology: TopologyArg,

    /// Upload the next neighbour frame while the current one is accumulated (two-pass only)
    #[arg(long)]
    overlap: bool,

    /// Spatial sigma of the bilateral filter in pixels
    #[arg(long, default_value = "2.0")]
    sigma_spatial: f32,

    /// Range sigma of the bilateral filter
    #[arg(long, default_value = "0.1")]
    sigma_range: f32,

    /// Strength of the accumulation filter
    #[arg(long, default_value = "0.1")]
    strength: f32,

    /// Patch radius of the accumulation filter
    #[arg(long, default_value = "1")]
    patch_radius: u32,

    /// Load inputs as 32-bit float RGBA instead of 8-bit
    #[arg(long)]
    hdr: bool,

    /// Upper bound on one GPU submission in milliseconds
    #[arg(long, default_value = "10000")]
    timeout_ms: u64,

    /// Log debug output
    #[arg(long, short)]
    verbose: bool,
}

/// An image file loaded when the run first needs it
struct ImageFile {
    path: PathBuf,
    hdr: bool,
}

impl FrameSource for ImageFile {
    fn load_frame(&self) -> Result<Frame, BoxError> {
        let image = image::open(&self.path)?;
        let frame = if self.hdr {
            let rgba = image.to_rgba32f();
            Frame::from_rgba32f(rgba.width(), rgba.height(), rgba.as_raw())?
        } else {
            let rgba = image.to_rgba8();
            Frame::new(rgba.width(), rgba.height(), PixelFormat::Rgba8Unorm, rgba.into_raw())?
        };
        Ok(frame)
    }

    fn label(&self) -> String {
        self.path.display().to_string()
    }
}

fn save_frame(frame: &Frame, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    match frame.format() {
        PixelFormat::Rgba8Unorm => {
            let image = image::RgbaImage::from_raw(frame.width(), frame.height(), frame.data().to_vec()).ok_or("output buffer does not match its dimensions")?;
            image.save(path)?;
        }
        PixelFormat::Rgba32Float => {
            let pixels: Vec<f32> = frame.to_float_pixels().into_iter().flatten().collect();
            let image = image::Rgba32FImage::from_raw(frame.width(), frame.height(), pixels).ok_or("output buffer does not match its dimensions")?;
            image::DynamicImage::ImageRgba32F(image).to_rgb32f().save(path)?;
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let subscriber = tracing_subscriber::fmt().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let topology = match args.topology {
        TopologyArg::Single => Topology::SinglePass(BilateralParams {
            sigma_spatial: args.sigma_spatial,
            sigma_range: args.sigma_range,
        }),
        TopologyArg::TwoPass => Topology::TwoPass(AccumulationParams {
            strength: args.strength,
            patch_radius: args.patch_radius,
        }),
    };
    let config = RunConfig::default()
        .with_topology(topology)
        .with_overlap(args.overlap)
        .with_submission_timeout(Duration::from_millis(args.timeout_ms));

    let sources: Vec<Box<dyn FrameSource>> = args
        .inputs
        .iter()
        .map(|path| Box::new(ImageFile { path: path.clone(), hdr: args.hdr }) as Box<dyn FrameSource>)
        .collect();
    let mut run = Run::configure(config, sources)?;

    println!("Initializing GPU...");
    let ctx = GpuContext::new_blocking(&ContextOptions::default())?;
    println!("Using adapter: {} ({:?})", ctx.adapter_info().name, ctx.adapter_info().backend);

    let output = run.run(&ctx)?;
    let frame = output.frames.first().ok_or("run produced no output")?;
    save_frame(frame, &args.output)?;
    println!("Saved {} to {}", frame.shape(), args.output.display());

    println!(
        "{} passes, compute {:.2?}, transfer {:.2?}",
        output.passes,
        output.totals.exec(),
        output.totals.transfer()
    );
    if output.frames.len() > 1 {
        println!("Note: only the first of {} outputs was saved", output.frames.len());
    }

    Ok(())
}
