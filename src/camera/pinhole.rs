//! Pinhole projection helpers on [`Intrinsics`].

use crate::camera::{validation, CameraModelError, Intrinsics, Resolution};
use nalgebra::{Matrix3, Point2};

impl Default for Intrinsics {
    fn default() -> Self {
        Self::new(1.0, 1.0, 0.0, 0.0, 0.0)
    }
}

impl Intrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, skew: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            skew,
        }
    }

    /// Ideal pinhole centred on the image with the given field of view in radians.
    pub fn from_resolution_fov(resolution: Resolution, fov: (f64, f64)) -> Self {
        let (fov_x, fov_y) = fov;
        let fx = resolution.width as f64 / (2.0 * (fov_x / 2.0).tan());
        let fy = resolution.height as f64 / (2.0 * (fov_y / 2.0).tan());
        let cx = resolution.width as f64 / 2.0;
        let cy = resolution.height as f64 / 2.0;
        Self::new(fx, fy, cx, cy, 0.0)
    }

    /// Builds intrinsics from an upper-triangular camera matrix.
    pub fn from_matrix(k: &Matrix3<f64>) -> Result<Self, CameraModelError> {
        let scale = k[(2, 2)];
        if scale.abs() < f64::EPSILON {
            return Err(CameraModelError::InvalidParams(
                "Camera matrix has zero scale".to_string(),
            ));
        }
        let k = k / scale;
        let intrinsics = Self::new(k[(0, 0)], k[(1, 1)], k[(0, 2)], k[(1, 2)], k[(0, 1)]);
        validation::validate_intrinsics(&intrinsics)?;
        Ok(intrinsics)
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, self.skew, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    /// Closed-form inverse of [`Intrinsics::matrix`].
    pub fn inverse_matrix(&self) -> Matrix3<f64> {
        let inv_fx = 1.0 / self.fx;
        let inv_fy = 1.0 / self.fy;
        Matrix3::new(
            inv_fx,
            -self.skew * inv_fx * inv_fy,
            (self.skew * self.cy - self.cx * self.fy) * inv_fx * inv_fy,
            0.0,
            inv_fy,
            -self.cy * inv_fy,
            0.0,
            0.0,
            1.0,
        )
    }

    /// `u = fx x + skew y + cx`, `v = fy y + cy`
    #[inline]
    pub fn normalized_to_pixel(&self, point: &Point2<f64>) -> Point2<f64> {
        Point2::new(
            self.fx * point.x + self.skew * point.y + self.cx,
            self.fy * point.y + self.cy,
        )
    }

    #[inline]
    pub fn pixel_to_normalized(&self, pixel: &Point2<f64>) -> Point2<f64> {
        let y = (pixel.y - self.cy) / self.fy;
        let x = (pixel.x - self.cx - self.skew * y) / self.fx;
        Point2::new(x, y)
    }
}
