//! Pixel comparison utilities for verification
//!
//! This module compares accelerator output with CPU reference output. Kernels
//! evaluate `exp` with device precision, so comparisons take a tolerance on the
//! maximum absolute per-channel error.

/// Result of comparing two pixel arrays
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompareResult {
    /// Every channel is within the tolerance
    Match {
        /// Largest absolute channel difference
        max_error: f32,
    },
    /// The arrays hold different numbers of pixels
    DimensionMismatch {
        /// Pixel count of the reference output
        reference_pixels: usize,
        /// Pixel count of the accelerator output
        actual_pixels: usize,
    },
    /// Some channel differs by more than the tolerance
    PixelMismatch {
        /// Largest absolute channel difference
        max_error: f32,
        /// Index of the first pixel out of tolerance
        first_mismatch: usize,
        /// Whether red component values are within tolerance
        r_matched: bool,
        /// Whether green component values are within tolerance
        g_matched: bool,
        /// Whether blue component values are within tolerance
        b_matched: bool,
        /// Whether alpha component values are within tolerance
        a_matched: bool,
    },
}

impl CompareResult {
    /// Whether the comparison passed
    pub fn is_match(&self) -> bool {
        matches!(self, CompareResult::Match { .. })
    }
}

/// Compares two RGBA pixel arrays channel by channel
///
/// # Arguments
/// * `reference` - Output of the CPU reference kernels
/// * `actual` - Output read back from the accelerator
/// * `tolerance` - Largest accepted absolute difference per channel
///
/// # Returns
/// A `CompareResult` describing whether the arrays match and where they differ
pub fn compare_pixels(reference: &[[f32; 4]], actual: &[[f32; 4]], tolerance: f32) -> CompareResult {
    if reference.len() != actual.len() {
        return CompareResult::DimensionMismatch {
            reference_pixels: reference.len(),
            actual_pixels: actual.len(),
        };
    }

    let mut matched = [true; 4];
    let mut max_error = 0.0f32;
    let mut first_mismatch = None;

    for (index, (expected, found)) in reference.iter().zip(actual).enumerate() {
        for channel in 0..4 {
            let error = (expected[channel] - found[channel]).abs();
            if error.is_nan() || error > tolerance {
                matched[channel] = false;
                first_mismatch.get_or_insert(index);
            }
            if error.is_nan() {
                max_error = f32::NAN;
            } else if !max_error.is_nan() {
                max_error = max_error.max(error);
            }
        }
    }

    match first_mismatch {
        None => CompareResult::Match { max_error },
        Some(first_mismatch) => CompareResult::PixelMismatch {
            max_error,
            first_mismatch,
            r_matched: matched[0],
            g_matched: matched[1],
            b_matched: matched[2],
            a_matched: matched[3],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_tolerance() {
        let result = compare_pixels(&[[0.5, 0.5, 0.5, 1.0]], &[[0.50005, 0.5, 0.49995, 1.0]], 1e-4);
        assert!(result.is_match());
    }

    #[test]
    fn test_mismatch_reports_channels() {
        let reference = [[0.0; 4], [1.0; 4]];
        let actual = [[0.0; 4], [1.0, 0.5, 1.0, 1.0]];
        assert_eq!(
            compare_pixels(&reference, &actual, 1e-3),
            CompareResult::PixelMismatch {
                max_error: 0.5,
                first_mismatch: 1,
                r_matched: true,
                g_matched: false,
                b_matched: true,
                a_matched: true,
            }
        );
    }

    #[test]
    fn test_nan_and_length_mismatch() {
        assert!(!compare_pixels(&[[0.0; 4]], &[[f32::NAN, 0.0, 0.0, 0.0]], 1.0).is_match());
        assert_eq!(
            compare_pixels(&[[0.0; 4]], &[], 0.0),
            CompareResult::DimensionMismatch {
                reference_pixels: 1,
                actual_pixels: 0,
            }
        );
    }
}
