mod common;

use common::{boxed, constant_rgba32f, context, max_abs_difference, pattern_rgba8};
use denoise_wgpu::{BilateralParams, Error, Frame, PixelFormat, Run, RunConfig, Topology};

fn bilateral(sigma_spatial: f32, sigma_range: f32) -> RunConfig {
    RunConfig::default().with_topology(Topology::SinglePass(BilateralParams { sigma_spatial, sigma_range }))
}

#[test]
fn constant_gray_is_a_fixed_point() {
    let Some(ctx) = context() else { return };

    for (sigma_spatial, sigma_range) in [(0.5, 0.05), (2.0, 0.1), (4.0, 1.0)] {
        let gray = constant_rgba32f(4, 4, [0.5, 0.5, 0.5, 1.0]);
        let mut run = Run::configure(bilateral(sigma_spatial, sigma_range), boxed(vec![gray.clone()])).unwrap();
        let output = run.run(&ctx).unwrap();

        assert_eq!(output.frames.len(), 1);
        assert!(max_abs_difference(&output.float_pixels[0], &gray.to_float_pixels()) < 1e-6);
        assert_eq!(run.outstanding_allocations(), 0);
    }

    let gray8 = Frame::new(4, 4, PixelFormat::Rgba8Unorm, vec![128u8; 64]).unwrap();
    let mut run = Run::configure(bilateral(2.0, 0.1), boxed(vec![gray8.clone()])).unwrap();
    let output = run.run(&ctx).unwrap();
    assert_eq!(output.frames[0], gray8);
}

#[test]
fn output_dimensions_match_input() {
    let Some(ctx) = context() else { return };

    for (width, height) in [(1, 1), (17, 5), (37, 19), (64, 16)] {
        let frame = pattern_rgba8(width, height, 7);
        let mut run = Run::configure(bilateral(1.5, 0.2), boxed(vec![frame])).unwrap();
        let output = run.run(&ctx).unwrap();

        let result = &output.frames[0];
        assert_eq!((result.width(), result.height(), result.format()), (width, height, PixelFormat::Rgba8Unorm));
        assert_eq!(output.float_pixels[0].len(), (width * height) as usize);
    }
}

#[test]
fn repeated_runs_are_bit_identical() {
    let Some(ctx) = context() else { return };

    let frame = pattern_rgba8(33, 21, 3);
    let mut run = Run::configure(bilateral(2.0, 0.15), boxed(vec![frame])).unwrap();
    let first = run.run(&ctx).unwrap();
    assert_eq!(run.outstanding_allocations(), 0);
    let second = run.run(&ctx).unwrap();
    assert_eq!(run.outstanding_allocations(), 0);

    assert_eq!(first.frames, second.frames);
    let bits = |pixels: &[[f32; 4]]| pixels.iter().flatten().map(|v| v.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(&first.float_pixels[0]), bits(&second.float_pixels[0]));
}

#[test]
fn every_frame_is_filtered_in_order() {
    let Some(ctx) = context() else { return };

    let frames: Vec<Frame> = (0..3).map(|seed| pattern_rgba8(20, 12, seed)).collect();
    let mut run = Run::configure(bilateral(1.0, 0.1), boxed(frames.clone())).unwrap();
    let output = run.run(&ctx).unwrap();
    assert_eq!(output.frames.len(), 3);
    // upload and dispatch are separate passes for every frame
    assert_eq!(output.passes, 6);

    for (index, frame) in frames.into_iter().enumerate() {
        let mut single = Run::configure(bilateral(1.0, 0.1), boxed(vec![frame])).unwrap();
        assert_eq!(single.run(&ctx).unwrap().frames[0], output.frames[index]);
    }
}

#[test]
fn mismatched_frames_abort_and_release_everything() {
    let Some(ctx) = context() else { return };

    let frames = vec![pattern_rgba8(8, 8, 1), pattern_rgba8(8, 9, 2)];
    let mut run = Run::configure(bilateral(1.0, 0.1), boxed(frames)).unwrap();
    let result = run.run(&ctx);
    assert!(matches!(result, Err(Error::FrameMismatch { index: 1, .. })), "{result:?}");
    assert_eq!(run.outstanding_allocations(), 0);
}

#[test]
fn overlap_is_rejected_before_touching_the_device() {
    let config = bilateral(1.0, 0.1).with_overlap(true);
    let result = Run::configure(config, boxed(vec![pattern_rgba8(4, 4, 0)]));
    assert!(matches!(result, Err(Error::FatalConfiguration(_))));
}

#[test]
fn underflowing_sigmas_are_rejected_before_touching_the_device() {
    for config in [bilateral(1.0, 1e-23), bilateral(1e-23, 0.1), bilateral(1.0, f32::MIN_POSITIVE)] {
        let result = Run::configure(config, boxed(vec![pattern_rgba8(4, 4, 0)]));
        assert!(matches!(result, Err(Error::FatalConfiguration(_))), "{result:?}");
    }
}
