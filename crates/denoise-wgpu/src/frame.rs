//! Frames and frame sources
//!
//! A [`Frame`] is an immutable row-major RGBA pixel grid. Frames are produced by
//! an external loader behind the [`FrameSource`] trait and are never mutated by
//! the denoiser.

use crate::error::{BoxError, Error, Result};
use bytes::Bytes;
use std::fmt;

/// Pixel layouts accepted by the denoiser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8-bit normalized RGBA
    Rgba8Unorm,
    /// 32-bit floating-point RGBA
    Rgba32Float,
}

impl PixelFormat {
    /// Number of bytes one pixel occupies
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgba8Unorm => 4,
            PixelFormat::Rgba32Float => 16,
        }
    }

    /// Matching device image format
    pub fn texture_format(self) -> wgpu::TextureFormat {
        match self {
            PixelFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            PixelFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Rgba8Unorm => f.write_str("rgba8"),
            PixelFormat::Rgba32Float => f.write_str("rgba32f"),
        }
    }
}

/// An immutable 2D pixel grid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Bytes,
}

impl Frame {
    /// Creates a frame from raw row-major pixel bytes
    ///
    /// # Arguments
    /// * `width` - Width in pixels (non-zero)
    /// * `height` - Height in pixels (non-zero)
    /// * `format` - Pixel layout of `data`
    /// * `data` - Exactly `width * height * bytes_per_pixel` bytes
    pub fn new(width: u32, height: u32, format: PixelFormat, data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        if width == 0 || height == 0 {
            return Err(Error::InvalidFrame(format!("frame dimensions {width}x{height} must be non-zero")));
        }
        let expected = width as usize * height as usize * format.bytes_per_pixel() as usize;
        if data.len() != expected {
            return Err(Error::InvalidFrame(format!("{width}x{height} {format} frame needs {expected} bytes, got {}", data.len())));
        }
        Ok(Self { width, height, format, data })
    }

    /// Creates an 8-bit frame from RGB bytes, filling alpha with 255
    pub fn from_rgb8(width: u32, height: u32, rgb: &[u8]) -> Result<Self> {
        if rgb.len() % 3 != 0 {
            return Err(Error::InvalidFrame(format!("RGB data length {} is not a multiple of 3", rgb.len())));
        }
        let rgba: Vec<u8> = rgb.chunks_exact(3).flat_map(|px| [px[0], px[1], px[2], 255]).collect();
        Self::new(width, height, PixelFormat::Rgba8Unorm, rgba)
    }

    /// Creates a float frame from RGB values, filling alpha with 1.0
    pub fn from_rgb32f(width: u32, height: u32, rgb: &[f32]) -> Result<Self> {
        if rgb.len() % 3 != 0 {
            return Err(Error::InvalidFrame(format!("RGB data length {} is not a multiple of 3", rgb.len())));
        }
        let rgba: Vec<f32> = rgb.chunks_exact(3).flat_map(|px| [px[0], px[1], px[2], 1.0]).collect();
        Self::from_rgba32f(width, height, &rgba)
    }

    /// Creates a float frame from RGBA values
    pub fn from_rgba32f(width: u32, height: u32, rgba: &[f32]) -> Result<Self> {
        Self::new(width, height, PixelFormat::Rgba32Float, Bytes::copy_from_slice(bytemuck::cast_slice(rgba)))
    }

    /// Creates a frame from normalized float pixels, converting to `format`
    ///
    /// 8-bit output clamps each channel to [0, 1] and rounds `v * 255`.
    pub fn from_float_pixels(width: u32, height: u32, format: PixelFormat, pixels: &[[f32; 4]]) -> Result<Self> {
        match format {
            PixelFormat::Rgba32Float => Self::from_rgba32f(width, height, bytemuck::cast_slice(pixels)),
            PixelFormat::Rgba8Unorm => {
                let bytes: Vec<u8> = pixels.iter().flatten().map(|&v| (v.clamp(0.0, 1.0) * 255.0).round() as u8).collect();
                Self::new(width, height, format, bytes)
            }
        }
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixel layout
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Raw row-major pixel bytes
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Bytes in one unpadded row
    pub fn row_bytes(&self) -> u32 {
        self.width * self.format.bytes_per_pixel()
    }

    /// Number of pixels
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Pixels converted to normalized floats
    pub fn to_float_pixels(&self) -> Vec<[f32; 4]> {
        match self.format {
            PixelFormat::Rgba8Unorm => self.data.chunks_exact(4).map(|px| [0, 1, 2, 3].map(|c| px[c] as f32 / 255.0)).collect(),
            PixelFormat::Rgba32Float => self
                .data
                .chunks_exact(16)
                .map(|px| [0, 1, 2, 3].map(|c| f32::from_ne_bytes([px[4 * c], px[4 * c + 1], px[4 * c + 2], px[4 * c + 3]])))
                .collect(),
        }
    }

    /// Short description used in mismatch errors
    pub fn shape(&self) -> String {
        format!("{}x{} {}", self.width, self.height, self.format)
    }
}

/// A lazily loaded input frame
///
/// The denoiser pulls each source exactly once per run, in order.
pub trait FrameSource {
    /// Loads the frame
    fn load_frame(&self) -> std::result::Result<Frame, BoxError>;

    /// Label used in logs and errors
    fn label(&self) -> String;
}

impl FrameSource for Frame {
    fn load_frame(&self) -> std::result::Result<Frame, BoxError> {
        Ok(self.clone())
    }

    fn label(&self) -> String {
        format!("in-memory {}", self.shape())
    }
}
