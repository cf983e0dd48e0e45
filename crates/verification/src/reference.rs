//! CPU reference kernels
//!
//! Straightforward single-threaded versions of the WGSL kernels embedded in
//! denoise-wgpu, using the same `f32` arithmetic and clamp-to-edge addressing.

use denoise_wgpu::{AccumTexel, AccumulationParams, BilateralParams, Frame};

/// Errors raised by the reference pipeline
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReferenceError {
    /// The frame sequence is empty
    #[error("no frames to denoise")]
    NoFrames,
    /// A frame has different dimensions than the target
    #[error("frame {index} is {found} but the target is {expected}")]
    FrameMismatch { index: usize, expected: String, found: String },
}

/// Clamp-to-edge accessor over a row-major pixel array
struct Pixels<'a> {
    data: &'a [[f32; 4]],
    width: u32,
    height: u32,
}

impl Pixels<'_> {
    fn at(&self, x: i32, y: i32) -> [f32; 4] {
        let x = x.clamp(0, self.width as i32 - 1) as usize;
        let y = y.clamp(0, self.height as i32 - 1) as usize;
        self.data[y * self.width as usize + x]
    }
}

fn rgb_distance(a: [f32; 4], b: [f32; 4]) -> f32 {
    (0..3).map(|c| (a[c] - b[c]) * (a[c] - b[c])).sum()
}

/// Applies the edge-aware bilateral filter
///
/// # Arguments
/// * `frame` - Input frame
/// * `params` - Filter sigmas; the window radius is derived from the spatial sigma
///
/// # Returns
/// Filtered RGBA pixels in row-major order
pub fn bilateral(frame: &Frame, params: &BilateralParams) -> Vec<[f32; 4]> {
    let data = frame.to_float_pixels();
    let pixels = Pixels {
        data: &data,
        width: frame.width(),
        height: frame.height(),
    };
    let r = params.radius() as i32;
    let inv_spatial = 1.0 / (2.0 * params.sigma_spatial * params.sigma_spatial);
    let inv_range = 1.0 / (2.0 * params.sigma_range * params.sigma_range);

    let mut output = Vec::with_capacity(data.len());
    for y in 0..frame.height() as i32 {
        for x in 0..frame.width() as i32 {
            let center = pixels.at(x, y);
            let mut sum = [0.0f32; 4];
            let mut total = 0.0f32;
            for dy in -r..=r {
                for dx in -r..=r {
                    let texel = pixels.at(x + dx, y + dy);
                    let w = (-((dx * dx + dy * dy) as f32) * inv_spatial - rgb_distance(texel, center) * inv_range).exp();
                    for c in 0..4 {
                        sum[c] += w * texel[c];
                    }
                    total += w;
                }
            }
            output.push(sum.map(|v| v / total));
        }
    }
    output
}

/// Blends one neighbour frame into an accumulation buffer
///
/// # Arguments
/// * `accumulation` - One texel per pixel, updated in place
/// * `target` - The frame being denoised
/// * `neighbour` - The frame blended in
/// * `params` - Filter strength and patch radius
pub fn accumulate(accumulation: &mut [AccumTexel], target: &Frame, neighbour: &Frame, params: &AccumulationParams) {
    let (width, height) = (target.width(), target.height());
    let target_data = target.to_float_pixels();
    let neighbour_data = neighbour.to_float_pixels();
    let target = Pixels {
        data: &target_data,
        width,
        height,
    };
    let neighbour = Pixels {
        data: &neighbour_data,
        width,
        height,
    };
    let p = params.patch_radius as i32;
    let side = (2 * p + 1) as f32;

    for y in 0..height as i32 {
        for x in 0..width as i32 {
            let mut patch_distance = 0.0f32;
            for dy in -p..=p {
                for dx in -p..=p {
                    patch_distance += rgb_distance(target.at(x + dx, y + dy), neighbour.at(x + dx, y + dy));
                }
            }
            patch_distance /= side * side;

            let w = (-patch_distance / (params.strength * params.strength)).exp();
            let texel = &mut accumulation[y as usize * width as usize + x as usize];
            let sample = neighbour.at(x, y);
            for c in 0..4 {
                texel.color[c] += w * sample[c];
            }
            texel.weight += w;
        }
    }
}

/// Divides every accumulated color by its weight
pub fn normalize(accumulation: &[AccumTexel]) -> Vec<[f32; 4]> {
    accumulation.iter().map(|texel| texel.color.map(|c| c / texel.weight)).collect()
}

/// Runs the full two-pass filter over a frame sequence
///
/// Frame 0 is the target and also the first neighbour.
///
/// # Returns
/// The normalized output pixels and the final accumulation buffer
pub fn denoise_sequence(frames: &[Frame], params: &AccumulationParams) -> Result<(Vec<[f32; 4]>, Vec<AccumTexel>), ReferenceError> {
    let target = frames.first().ok_or(ReferenceError::NoFrames)?;
    let mut accumulation = vec![AccumTexel::new([0.0; 4], 0.0); target.pixel_count()];
    for (index, neighbour) in frames.iter().enumerate() {
        if (neighbour.width(), neighbour.height()) != (target.width(), target.height()) {
            return Err(ReferenceError::FrameMismatch {
                index,
                expected: target.shape(),
                found: neighbour.shape(),
            });
        }
        accumulate(&mut accumulation, target, neighbour, params);
    }
    Ok((normalize(&accumulation), accumulation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use denoise_wgpu::PixelFormat;

    fn gray(value: f32) -> Frame {
        Frame::from_float_pixels(4, 4, PixelFormat::Rgba32Float, &[[value, value, value, 1.0]; 16]).unwrap()
    }

    #[test]
    fn test_bilateral_constant_fixed_point() {
        let frame = gray(0.5);
        let output = bilateral(&frame, &BilateralParams { sigma_spatial: 1.3, sigma_range: 0.07 });
        assert!(output.iter().all(|pixel| *pixel == [0.5, 0.5, 0.5, 1.0]));
    }

    #[test]
    fn test_bilateral_preserves_a_hard_edge() {
        let mut pixels = vec![[0.0, 0.0, 0.0, 1.0]; 16];
        for row in pixels.chunks_mut(4) {
            row[2] = [1.0, 1.0, 1.0, 1.0];
            row[3] = [1.0, 1.0, 1.0, 1.0];
        }
        let frame = Frame::from_float_pixels(4, 4, PixelFormat::Rgba32Float, &pixels).unwrap();
        let output = bilateral(&frame, &BilateralParams { sigma_spatial: 2.0, sigma_range: 0.05 });
        assert!(output[1][0] < 1e-6);
        assert!(output[2][0] > 1.0 - 1e-6);
    }

    #[test]
    fn test_identical_neighbours_reproduce_the_target() {
        let frame = Frame::from_rgb8(2, 2, &[10, 20, 30, 40, 50, 60, 70, 80, 90, 100, 110, 120]).unwrap();
        let (output, accumulation) = denoise_sequence(&[frame.clone(), frame.clone()], &AccumulationParams::default()).unwrap();
        assert_eq!(output, frame.to_float_pixels());
        assert!(accumulation.iter().all(|texel| texel.weight == 2.0));
    }

    #[test]
    fn test_dissimilar_neighbour_gets_less_weight() {
        let (_, accumulation) = denoise_sequence(&[gray(0.2), gray(0.8)], &AccumulationParams { strength: 0.5, patch_radius: 1 }).unwrap();
        for texel in &accumulation {
            assert!(texel.weight > 1.0 && texel.weight < 2.0);
        }
    }

    #[test]
    fn test_sequence_errors() {
        assert_eq!(denoise_sequence(&[], &AccumulationParams::default()).unwrap_err(), ReferenceError::NoFrames);

        let other = Frame::from_rgb8(1, 1, &[0, 0, 0]).unwrap();
        assert!(matches!(denoise_sequence(&[gray(0.5), other], &AccumulationParams::default()), Err(ReferenceError::FrameMismatch { index: 1, .. })));
    }
}
