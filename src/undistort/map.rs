//! Per-pixel source-coordinate tables.

use crate::camera::{validation, Distortion, Intrinsics, Resolution};
use crate::cancel::CancelFlag;
use crate::undistort::UndistortError;
use log::debug;
use nalgebra::Point2;
use rayon::prelude::*;

/// Source coordinate for every output pixel, row-major.
///
/// Coordinates that cannot be computed are NaN and fall outside any image.
/// The table always holds exactly `width * height` entries.
#[derive(Debug, Clone, PartialEq)]
pub struct UndistortionMap {
    width: u32,
    height: u32,
    coords: Vec<Point2<f32>>,
}

/// Which direction of the lens model a map encodes.
#[derive(Debug, Clone, Copy)]
enum Direction {
    /// Output is an ideal pinhole image, source is the distorted capture.
    Undistort,
    /// Output is a distorted image, source is an ideal pinhole image.
    Distort,
}

fn validate(
    intrinsics: &Intrinsics,
    distortion: &Distortion,
    target: &Intrinsics,
    resolution: Resolution,
) -> Result<(), UndistortError> {
    validation::validate_intrinsics(intrinsics)?;
    validation::validate_intrinsics(target)?;
    validation::validate_coefficients(&distortion.coefficients())?;
    if resolution.width == 0 || resolution.height == 0 {
        return Err(UndistortError::InvalidParams(format!(
            "output resolution {}x{} is empty",
            resolution.width, resolution.height
        )));
    }
    Ok(())
}

fn to_f32(p: Point2<f64>) -> Point2<f32> {
    if p.x.is_finite() && p.y.is_finite() {
        Point2::new(p.x as f32, p.y as f32)
    } else {
        Point2::new(f32::NAN, f32::NAN)
    }
}

impl UndistortionMap {
    /// Wraps a table computed elsewhere, checking that it covers the
    /// `width x height` output exactly.
    pub fn from_parts(
        width: u32,
        height: u32,
        coords: Vec<Point2<f32>>,
    ) -> Result<Self, UndistortError> {
        let expected = width as usize * height as usize;
        if coords.len() != expected {
            return Err(UndistortError::InvalidParams(format!(
                "map of {width}x{height} needs {expected} coordinates, found {}",
                coords.len()
            )));
        }
        Ok(Self {
            width,
            height,
            coords,
        })
    }

    /// Table for undistorting images of the camera `(intrinsics, distortion)`.
    ///
    /// Each output pixel is unprojected with `target` (the camera of the
    /// undistorted image, `intrinsics` when `None`), distorted, and projected
    /// with `intrinsics` into the source image.
    ///
    /// # Arguments
    ///
    /// * `intrinsics` - Projection of the distorted source camera
    /// * `distortion` - Lens model of the source camera
    /// * `target` - Projection of the undistorted output; `None` reuses `intrinsics`
    /// * `resolution` - Size of the output image
    ///
    /// # Returns
    ///
    /// * `Result<UndistortionMap, UndistortError>` - The lookup table, or
    ///   `InvalidParams` for non-physical intrinsics or an empty resolution
    pub fn build(
        intrinsics: &Intrinsics,
        distortion: &Distortion,
        target: Option<&Intrinsics>,
        resolution: Resolution,
    ) -> Result<Self, UndistortError> {
        Self::build_impl(intrinsics, distortion, target, resolution, Direction::Undistort, None)
    }

    /// [`UndistortionMap::build`] that stops between rows once `cancel` is set.
    pub fn build_with_cancel(
        intrinsics: &Intrinsics,
        distortion: &Distortion,
        target: Option<&Intrinsics>,
        resolution: Resolution,
        cancel: &CancelFlag,
    ) -> Result<Self, UndistortError> {
        Self::build_impl(
            intrinsics,
            distortion,
            target,
            resolution,
            Direction::Undistort,
            Some(cancel),
        )
    }

    /// Inverse table: remapping an ideal image taken with `target` (or
    /// `intrinsics`) through it synthesizes what the distorted camera sees.
    pub fn build_distortion(
        intrinsics: &Intrinsics,
        distortion: &Distortion,
        target: Option<&Intrinsics>,
        resolution: Resolution,
    ) -> Result<Self, UndistortError> {
        Self::build_impl(intrinsics, distortion, target, resolution, Direction::Distort, None)
    }

    fn build_impl(
        intrinsics: &Intrinsics,
        distortion: &Distortion,
        target: Option<&Intrinsics>,
        resolution: Resolution,
        direction: Direction,
        cancel: Option<&CancelFlag>,
    ) -> Result<Self, UndistortError> {
        let target = target.unwrap_or(intrinsics);
        validate(intrinsics, distortion, target, resolution)?;

        let width = resolution.width as usize;
        let mut coords = vec![Point2::new(0.0f32, 0.0); resolution.num_pixels()];
        coords
            .par_chunks_mut(width)
            .enumerate()
            .try_for_each(|(v, row)| {
                if cancel.is_some_and(CancelFlag::is_cancelled) {
                    return Err(UndistortError::Cancelled);
                }
                for (u, coord) in row.iter_mut().enumerate() {
                    let pixel = Point2::new(u as f64, v as f64);
                    let source = match direction {
                        Direction::Undistort => {
                            let ideal = target.pixel_to_normalized(&pixel);
                            intrinsics.normalized_to_pixel(&distortion.distort(&ideal))
                        }
                        Direction::Distort => {
                            let distorted = intrinsics.pixel_to_normalized(&pixel);
                            target.normalized_to_pixel(&distortion.undistort(&distorted))
                        }
                    };
                    *coord = to_f32(source);
                }
                Ok(())
            })?;

        debug!(
            "Built {direction:?} map for {}x{}",
            resolution.width, resolution.height
        );
        Ok(Self {
            width: resolution.width,
            height: resolution.height,
            coords,
        })
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row-major source coordinates.
    pub fn coords(&self) -> &[Point2<f32>] {
        &self.coords
    }

    /// Source coordinate of output pixel `(u, v)`.
    #[inline]
    pub fn get(&self, u: u32, v: u32) -> Option<Point2<f32>> {
        if u >= self.width || v >= self.height {
            return None;
        }
        self.coords
            .get(v as usize * self.width as usize + u as usize)
            .copied()
    }
}

/// Inclusive in-bounds rule shared by every interpolation mode.
#[inline]
pub(crate) fn in_bounds(p: &Point2<f32>, width: u32, height: u32) -> bool {
    p.x >= 0.0 && p.y >= 0.0 && p.x <= (width - 1) as f32 && p.y <= (height - 1) as f32
}

/// Nearest-neighbour lookup flattened to linear pixel indices: pairs of
/// (output pixel, source pixel), in-bounds pixels only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMap {
    pub width: u32,
    pub height: u32,
    pub source: Resolution,
    pub pairs: Vec<(usize, usize)>,
}

impl IndexMap {
    pub fn from_map(map: &UndistortionMap, source: Resolution) -> Result<Self, UndistortError> {
        if source.width == 0 || source.height == 0 {
            return Err(UndistortError::InvalidParams(
                "source resolution is empty".to_string(),
            ));
        }
        let pairs = map
            .coords
            .par_iter()
            .enumerate()
            .filter(|(_, p)| in_bounds(p, source.width, source.height))
            .map(|(dst, p)| {
                let (x, y) = (p.x.round() as usize, p.y.round() as usize);
                (dst, y * source.width as usize + x)
            })
            .collect();
        Ok(Self {
            width: map.width,
            height: map.height,
            source,
            pairs,
        })
    }
}
