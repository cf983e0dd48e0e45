//! Deterministic synthetic test frames

use denoise_wgpu::{Frame, PixelFormat, Result};

/// Xorshift32 noise source
struct Noise(u32);

impl Noise {
    fn next(&mut self) -> f32 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 17;
        self.0 ^= self.0 << 5;
        (self.0 >> 8) as f32 / (1u32 << 24) as f32
    }
}

/// A smooth color gradient: red grows left to right, green top to bottom
pub fn gradient(width: u32, height: u32, format: PixelFormat) -> Result<Frame> {
    let span = |n: u32| n.saturating_sub(1).max(1) as f32;
    let mut pixels = Vec::with_capacity(width as usize * height as usize);
    for y in 0..height {
        for x in 0..width {
            pixels.push([x as f32 / span(width), y as f32 / span(height), 0.5, 1.0]);
        }
    }
    Frame::from_float_pixels(width, height, format, &pixels)
}

/// Adds uniform noise of peak `amplitude` to the color channels of `frame`
///
/// # Arguments
/// * `frame` - Source frame; the result keeps its pixel format
/// * `amplitude` - Peak noise amplitude in normalized units
/// * `seed` - Noise seed; equal seeds give equal frames
pub fn add_noise(frame: &Frame, amplitude: f32, seed: u32) -> Result<Frame> {
    let mut noise = Noise(seed.wrapping_mul(2_654_435_761).max(1));
    let pixels: Vec<[f32; 4]> = frame
        .to_float_pixels()
        .into_iter()
        .map(|[r, g, b, a]| {
            let [r, g, b] = [r, g, b].map(|v| (v + (noise.next() - 0.5) * 2.0 * amplitude).clamp(0.0, 1.0));
            [r, g, b, a]
        })
        .collect();
    Frame::from_float_pixels(frame.width(), frame.height(), frame.format(), &pixels)
}

/// A [`gradient`] with [`add_noise`] applied
pub fn noisy_gradient(width: u32, height: u32, format: PixelFormat, amplitude: f32, seed: u32) -> Result<Frame> {
    add_noise(&gradient(width, height, format)?, amplitude, seed)
}

/// A burst of frames sharing the same gradient with independent noise
pub fn noisy_burst(width: u32, height: u32, format: PixelFormat, amplitude: f32, count: usize) -> Result<Vec<Frame>> {
    (0..count).map(|i| noisy_gradient(width, height, format, amplitude, i as u32 + 1)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_are_reproducible() {
        let a = noisy_gradient(7, 5, PixelFormat::Rgba8Unorm, 0.1, 3).unwrap();
        let b = noisy_gradient(7, 5, PixelFormat::Rgba8Unorm, 0.1, 3).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, noisy_gradient(7, 5, PixelFormat::Rgba8Unorm, 0.1, 4).unwrap());
        assert_eq!(a.shape(), "7x5 rgba8");
    }

    #[test]
    fn test_noise_stays_in_range() {
        let frame = noisy_gradient(16, 16, PixelFormat::Rgba32Float, 0.3, 9).unwrap();
        assert!(frame.to_float_pixels().iter().flatten().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(noisy_burst(4, 4, PixelFormat::Rgba8Unorm, 0.0, 3).unwrap().len(), 3);
    }
}
