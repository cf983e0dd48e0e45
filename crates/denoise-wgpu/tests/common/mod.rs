//! Shared helpers for device-backed integration tests

#![allow(dead_code)]

use denoise_wgpu::{ContextOptions, Frame, FrameSource, GpuContext, PixelFormat};

/// Acquires a device, or returns `None` when the machine has no usable adapter
pub fn context() -> Option<GpuContext> {
    match GpuContext::new_blocking(&ContextOptions::default()) {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            eprintln!("skipping: no GPU adapter available ({e})");
            None
        }
    }
}

pub fn boxed(frames: Vec<Frame>) -> Vec<Box<dyn FrameSource>> {
    frames.into_iter().map(|frame| Box::new(frame) as Box<dyn FrameSource>).collect()
}

/// A deterministic 8-bit test pattern with a little per-seed noise
pub fn pattern_rgba8(width: u32, height: u32, seed: u32) -> Frame {
    let mut state = seed.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
    let span = |n: u32| n.saturating_sub(1).max(1);
    let mut data = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let noise = (state % 17) as i32 - 8;
            let base = [x * 255 / span(width), y * 255 / span(height), (x + y) * 4];
            for channel in base {
                data.push((channel as i32 + noise).clamp(0, 255) as u8);
            }
            data.push(255);
        }
    }
    Frame::new(width, height, PixelFormat::Rgba8Unorm, data).unwrap()
}

pub fn constant_rgba32f(width: u32, height: u32, value: [f32; 4]) -> Frame {
    let pixels = vec![value; (width * height) as usize];
    Frame::from_float_pixels(width, height, PixelFormat::Rgba32Float, &pixels).unwrap()
}

pub fn max_abs_difference(a: &[[f32; 4]], b: &[[f32; 4]]) -> f32 {
    assert_eq!(a.len(), b.len());
    a.iter().flatten().zip(b.iter().flatten()).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}
