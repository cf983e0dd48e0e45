use denoise_wgpu::{AccumulationParams, BilateralParams, ContextOptions, Frame, FrameSource, GpuContext, PixelFormat, Run, RunConfig, Topology};
use denoise_wgpu_verification::{
    compare::compare_pixels,
    reference,
    synthetic::{noisy_burst, noisy_gradient},
};

const TOLERANCE: f32 = 1e-4;

fn context() -> Option<GpuContext> {
    match GpuContext::new_blocking(&ContextOptions::default()) {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            eprintln!("skipping: no GPU adapter available ({e})");
            None
        }
    }
}

fn boxed(frames: &[Frame]) -> Vec<Box<dyn FrameSource>> {
    frames.iter().cloned().map(|frame| Box::new(frame) as Box<dyn FrameSource>).collect()
}

#[test]
fn bilateral_matches_reference() {
    let Some(ctx) = context() else { return };

    for format in [PixelFormat::Rgba8Unorm, PixelFormat::Rgba32Float] {
        let frame = noisy_gradient(45, 30, format, 0.1, 5).unwrap();
        let params = BilateralParams { sigma_spatial: 1.5, sigma_range: 0.2 };
        let mut run = Run::configure(RunConfig::default().with_topology(Topology::SinglePass(params)), boxed(std::slice::from_ref(&frame))).unwrap();
        let output = run.run(&ctx).unwrap();

        let result = compare_pixels(&reference::bilateral(&frame, &params), &output.float_pixels[0], TOLERANCE);
        assert!(result.is_match(), "{format}: {result:?}");
    }
}

#[test]
fn two_pass_matches_reference() {
    let Some(ctx) = context() else { return };

    for format in [PixelFormat::Rgba8Unorm, PixelFormat::Rgba32Float] {
        let frames = noisy_burst(33, 18, format, 0.1, 4).unwrap();
        let params = AccumulationParams { strength: 0.2, patch_radius: 2 };
        let (expected, expected_accumulation) = reference::denoise_sequence(&frames, &params).unwrap();

        let config = RunConfig::default().with_topology(Topology::TwoPass(params)).with_overlap(true).with_capture_accumulation(true);
        let mut run = Run::configure(config, boxed(&frames)).unwrap();
        let output = run.run(&ctx).unwrap();

        let result = compare_pixels(&expected, &output.float_pixels[0], TOLERANCE);
        assert!(result.is_match(), "{format}: {result:?}");

        let accumulation = output.accumulation.unwrap();
        for (expected, actual) in expected_accumulation.iter().zip(&accumulation) {
            assert!((expected.weight - actual.weight).abs() < TOLERANCE, "{expected:?} vs {actual:?}");
        }
    }
}
