//! Chessboard inner-corner detection.
//!
//! [`find_pattern_corners`] runs four stages on a grayscale image:
//!
//! 1. adaptive local thresholding ([`threshold`]),
//! 2. saddle-point search on the smoothed image, each candidate verified as an
//!    X-junction against the binarized image ([`saddle`]),
//! 3. ordering of the candidates into the `corners_x x corners_y` lattice
//!    ([`grid`]),
//! 4. subpixel refinement ([`subpix`]).
//!
//! The result lists corners row-major, columns left to right, matching
//! [`crate::geometry::pattern_object_points`].

use crate::geometry::PatternSize;
use crate::optimization::TerminationCriteria;
use image::GrayImage;
use log::debug;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

pub mod grid;
pub mod saddle;
pub mod subpix;
pub mod threshold;

pub use subpix::refine_corners;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DetectionError {
    #[error("Pattern not found: {reason}")]
    PatternNotFound { reason: String },
    #[error("Invalid detector parameters: {0}")]
    InvalidParams(String),
}

/// Tuning knobs of the corner detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Side of the thresholding window in pixels (odd).
    pub block_size: u32,
    /// A pixel is white when `value > local_mean - threshold_offset`.
    pub threshold_offset: f32,
    /// Gaussian sigma applied before the saddle response.
    pub blur_sigma: f32,
    pub nms_radius: u32,
    /// Fraction of the strongest saddle response a candidate must reach.
    pub response_threshold: f32,
    /// Radius of the circle sampled by the four-transition X-junction test.
    pub ring_radius: f32,
    /// Half size of the subpixel refinement window.
    pub window_half_size: u32,
    pub criteria: TerminationCriteria,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            block_size: 31,
            threshold_offset: 5.0,
            blur_sigma: 1.5,
            nms_radius: 3,
            response_threshold: 0.1,
            ring_radius: 6.0,
            window_half_size: 5,
            criteria: TerminationCriteria::new(30, 1e-3),
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<(), DetectionError> {
        if self.block_size < 3 || self.block_size % 2 == 0 {
            return Err(DetectionError::InvalidParams(format!(
                "block_size must be odd and at least 3, got {}",
                self.block_size
            )));
        }
        if !(self.response_threshold > 0.0 && self.response_threshold < 1.0) {
            return Err(DetectionError::InvalidParams(
                "response_threshold must lie in (0, 1)".to_string(),
            ));
        }
        if !(self.ring_radius >= 2.0) || !self.blur_sigma.is_finite() || self.blur_sigma < 0.0 {
            return Err(DetectionError::InvalidParams(
                "ring_radius must be at least 2 and blur_sigma non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Locates and refines the inner corners of a chessboard.
///
/// # Arguments
///
/// * `image` - Grayscale image of the pattern
/// * `size` - Inner-corner grid dimensions
/// * `config` - Thresholding and refinement settings
///
/// # Returns
///
/// * `Result<Vec<Point2<f64>>, DetectionError>` - Exactly `size.num_corners()`
///   points in row-major order, or [`DetectionError::PatternNotFound`]
///   explaining which stage failed
pub fn find_pattern_corners(
    image: &GrayImage,
    size: PatternSize,
    config: &DetectorConfig,
) -> Result<Vec<Point2<f64>>, DetectionError> {
    config.validate()?;
    if size.corners_x < 2 || size.corners_y < 2 {
        return Err(DetectionError::InvalidParams(format!(
            "pattern needs at least 2x2 inner corners, got {}x{}",
            size.corners_x, size.corners_y
        )));
    }
    let (width, height) = image.dimensions();
    let min_side = 2 * (config.ring_radius.ceil() as u32 + 1);
    if width < min_side || height < min_side {
        return Err(DetectionError::PatternNotFound {
            reason: format!("image of {width}x{height} is too small"),
        });
    }

    let binary = threshold::adaptive_threshold(image, config.block_size, config.threshold_offset);
    let response = saddle::saddle_response(image, config.blur_sigma);
    let saddles = saddle::find_saddles(&response, config.nms_radius, config.response_threshold);
    let candidates: Vec<Point2<f64>> = saddles
        .iter()
        .filter(|s| saddle::is_x_junction(&binary, &s.position, config.ring_radius))
        .map(|s| s.position)
        .collect();
    debug!(
        "{} saddle points, {} verified X-junctions, pattern has {}",
        saddles.len(),
        candidates.len(),
        size.num_corners()
    );

    if candidates.len() < size.num_corners() {
        return Err(DetectionError::PatternNotFound {
            reason: format!(
                "only {} of {} corners visible",
                candidates.len(),
                size.num_corners()
            ),
        });
    }

    let ordered = grid::order_corners(&candidates, size)
        .map_err(|reason| DetectionError::PatternNotFound { reason })?;

    Ok(refine_corners(
        image,
        &ordered,
        config.window_half_size,
        &config.criteria,
    ))
}
