//! Filter topologies and their parameters
//!
//! The denoiser supports exactly two shapes: a single edge-aware pass writing
//! the output directly, and an accumulate-then-normalize pair. The shape is
//! chosen at configuration time and validated before any device work happens.

use crate::{
    error::{Error, Result},
    kernel::DispatchParams,
};

/// Largest bilateral window radius
pub const MAX_BILATERAL_RADIUS: u32 = 8;
/// Largest accumulation patch radius
pub const MAX_PATCH_RADIUS: u32 = 4;

/// Parameters of the edge-aware single-pass filter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BilateralParams {
    /// Spatial standard deviation in pixels
    pub sigma_spatial: f32,
    /// Range standard deviation in normalized color units
    pub sigma_range: f32,
}

impl Default for BilateralParams {
    fn default() -> Self {
        Self {
            sigma_spatial: 2.0,
            sigma_range: 0.1,
        }
    }
}

impl BilateralParams {
    /// Window radius derived from the spatial sigma, `clamp(ceil(2 * sigma), 1, 8)`
    pub fn radius(&self) -> u32 {
        ((2.0 * self.sigma_spatial).ceil() as u32).clamp(1, MAX_BILATERAL_RADIUS)
    }
}

/// Parameters of the two-pass accumulation filter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccumulationParams {
    /// Filter strength `h`; larger values blend more dissimilar neighbours
    pub strength: f32,
    /// Half-size of the patch compared between target and neighbour
    pub patch_radius: u32,
}

impl Default for AccumulationParams {
    fn default() -> Self {
        Self {
            strength: 0.1,
            patch_radius: 1,
        }
    }
}

/// The filter shape of a run
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Topology {
    /// One bilateral dispatch per frame
    SinglePass(BilateralParams),
    /// Accumulation over every frame, then one normalization
    TwoPass(AccumulationParams),
}

impl Default for Topology {
    fn default() -> Self {
        Self::SinglePass(BilateralParams::default())
    }
}

/// Which kind of topology, without its parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyKind {
    SinglePass,
    TwoPass,
}

/// Accepts a sigma or strength only if the kernels' `1 / (2 v^2)` stays finite
fn check_scale(name: &str, value: f32) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(Error::FatalConfiguration(format!("{name} must be finite and positive, got {value}")));
    }
    let squared = value * value;
    if !squared.is_normal() || !(1.0 / (2.0 * squared)).is_finite() {
        return Err(Error::FatalConfiguration(format!("{name} = {value} is too small, its square underflows")));
    }
    Ok(())
}

impl Topology {
    /// The kind of this topology
    pub fn kind(&self) -> TopologyKind {
        match self {
            Topology::SinglePass(_) => TopologyKind::SinglePass,
            Topology::TwoPass(_) => TopologyKind::TwoPass,
        }
    }

    /// Rejects parameters no kernel can work with
    pub fn validate(&self) -> Result<()> {
        match self {
            Topology::SinglePass(params) => {
                check_scale("sigma_spatial", params.sigma_spatial)?;
                check_scale("sigma_range", params.sigma_range)
            }
            Topology::TwoPass(params) => {
                check_scale("strength", params.strength)?;
                if params.patch_radius > MAX_PATCH_RADIUS {
                    return Err(Error::FatalConfiguration(format!("patch radius {} exceeds {MAX_PATCH_RADIUS}", params.patch_radius)));
                }
                Ok(())
            }
        }
    }

    /// Uniform parameters for every dispatch of this topology
    ///
    /// # Arguments
    /// * `width` - Frame width in pixels
    /// * `height` - Frame height in pixels
    /// * `packed` - Whether neighbour frames are uploaded as packed RGBA8 words
    pub fn dispatch_params(&self, width: u32, height: u32, packed: bool) -> DispatchParams {
        let mut params = DispatchParams::new(width, height);
        params.packed = packed as u32;
        match self {
            Topology::SinglePass(bilateral) => {
                params.radius = bilateral.radius();
                params.sigma_spatial = bilateral.sigma_spatial;
                params.sigma_range = bilateral.sigma_range;
            }
            Topology::TwoPass(accumulation) => {
                params.radius = accumulation.patch_radius;
                params.strength = accumulation.strength;
            }
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bilateral_radius_is_clamped() {
        let radius = |sigma_spatial| BilateralParams { sigma_spatial, sigma_range: 0.1 }.radius();
        assert_eq!(radius(0.1), 1);
        assert_eq!(radius(1.0), 2);
        assert_eq!(radius(1.2), 3);
        assert_eq!(radius(10.0), MAX_BILATERAL_RADIUS);
    }

    #[test]
    fn test_validation() {
        assert!(Topology::default().validate().is_ok());
        assert!(Topology::TwoPass(AccumulationParams::default()).validate().is_ok());

        let bad = [
            Topology::SinglePass(BilateralParams { sigma_spatial: 0.0, sigma_range: 0.1 }),
            Topology::SinglePass(BilateralParams { sigma_spatial: 1.0, sigma_range: f32::NAN }),
            Topology::TwoPass(AccumulationParams { strength: -1.0, patch_radius: 1 }),
            Topology::TwoPass(AccumulationParams { strength: 0.1, patch_radius: MAX_PATCH_RADIUS + 1 }),
        ];
        for topology in bad {
            assert!(matches!(topology.validate(), Err(Error::FatalConfiguration(_))), "{topology:?}");
        }
    }

    #[test]
    fn test_underflowing_scales_are_rejected() {
        for tiny in [1e-23, f32::MIN_POSITIVE, f32::from_bits(1)] {
            let bad = [
                Topology::SinglePass(BilateralParams { sigma_spatial: tiny, sigma_range: 0.1 }),
                Topology::SinglePass(BilateralParams { sigma_spatial: 1.0, sigma_range: tiny }),
                Topology::TwoPass(AccumulationParams { strength: tiny, patch_radius: 1 }),
            ];
            for topology in bad {
                assert!(matches!(topology.validate(), Err(Error::FatalConfiguration(_))), "{topology:?}");
            }
        }

        assert!(check_scale("strength", 1e-18).is_ok());
        assert!(Topology::TwoPass(AccumulationParams { strength: 1e-3, patch_radius: 0 }).validate().is_ok());
    }

    #[test]
    fn test_dispatch_params() {
        let params = Topology::SinglePass(BilateralParams { sigma_spatial: 1.5, sigma_range: 0.2 }).dispatch_params(8, 4, false);
        assert_eq!((params.width, params.height, params.radius, params.packed), (8, 4, 3, 0));
        assert_eq!(params.sigma_range, 0.2);
        assert_eq!(params.strength, 0.0);

        let params = Topology::TwoPass(AccumulationParams { strength: 0.3, patch_radius: 2 }).dispatch_params(8, 4, true);
        assert_eq!((params.radius, params.packed), (2, 1));
        assert_eq!(params.strength, 0.3);
    }
}
