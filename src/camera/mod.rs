//! Camera model types: pinhole intrinsics, lens distortion and board poses.
//!
//! A [`CameraModel`] pairs [`Intrinsics`] (the upper-triangular projection
//! matrix) with one [`Distortion`] variant. Points travel through the model as
//!
//! ```text
//! camera frame --(x/z, y/z)--> normalized --distort--> distorted normalized --K--> pixel
//! ```
//!
//! The distortion families live in their own submodules ([`plumb_bob`] and
//! [`fisheye`]) and are unified behind the closed [`Distortion`] enum.

use nalgebra::{Point2, Point3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

pub mod artifact;
pub mod distortion;
pub mod fisheye;
pub mod pinhole;
pub mod plumb_bob;

pub use artifact::CalibrationArtifact;
pub use distortion::{Distortion, DistortionKind};
pub use fisheye::FishEye;
pub use plumb_bob::PlumbBob;

/// Pinhole projection parameters.
///
/// Represents the matrix
///
/// ```text
/// | fx  skew cx |
/// | 0   fy   cy |
/// | 0   0    1  |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    #[serde(default)]
    pub skew: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn num_pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CameraModelError {
    #[error("z is close to zero, point is at camera center")]
    PointAtCameraCenter,
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
    #[error("Failed to load YAML: {0}")]
    YamlError(String),
    #[error("Failed to load JSON: {0}")]
    JsonError(String),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for CameraModelError {
    fn from(err: std::io::Error) -> Self {
        CameraModelError::IOError(err.to_string())
    }
}

impl From<yaml_rust::ScanError> for CameraModelError {
    fn from(err: yaml_rust::ScanError) -> Self {
        CameraModelError::YamlError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CameraModelError {
    fn from(err: serde_yaml::Error) -> Self {
        CameraModelError::YamlError(err.to_string())
    }
}

impl From<serde_json::Error> for CameraModelError {
    fn from(err: serde_json::Error) -> Self {
        CameraModelError::JsonError(err.to_string())
    }
}

/// Rigid transform taking pattern coordinates into the camera frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl Pose {
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Builds a pose from a Rodrigues rotation vector and a translation.
    pub fn from_rotation_vector(rvec: Vector3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::from_scaled_axis(rvec),
            translation,
        }
    }

    /// Rodrigues vector (axis * angle) of the rotation.
    pub fn rotation_vector(&self) -> Vector3<f64> {
        self.rotation.scaled_axis()
    }

    pub fn transform_point(&self, point: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.rotation * point.coords + self.translation)
    }
}

/// Intrinsics plus one distortion family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    pub intrinsics: Intrinsics,
    pub distortion: Distortion,
}

impl CameraModel {
    pub fn new(intrinsics: Intrinsics, distortion: Distortion) -> Self {
        Self {
            intrinsics,
            distortion,
        }
    }

    /// Project a point given in the camera frame to pixel coordinates.
    pub fn project(&self, point_3d: &Point3<f64>) -> Result<Point2<f64>, CameraModelError> {
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }
        let normalized = Point2::new(point_3d.x / point_3d.z, point_3d.y / point_3d.z);
        Ok(self.project_normalized(&normalized))
    }

    /// Apply distortion and the projection matrix to an ideal normalized point.
    pub fn project_normalized(&self, normalized: &Point2<f64>) -> Point2<f64> {
        let distorted = self.distortion.distort(normalized);
        self.intrinsics.normalized_to_pixel(&distorted)
    }

    /// Unproject a pixel to a unit-depth ray (z = 1) with distortion removed.
    /// `x` and `y` are NaN for pixels outside the invertible range of the lens.
    pub fn unproject(&self, pixel: &Point2<f64>) -> Point3<f64> {
        let distorted = self.intrinsics.pixel_to_normalized(pixel);
        let ideal = self.distortion.undistort(&distorted);
        Point3::new(ideal.x, ideal.y, 1.0)
    }

    /// Project pattern points seen under `pose`.
    pub fn project_with_pose(
        &self,
        pose: &Pose,
        point: &Point3<f64>,
    ) -> Result<Point2<f64>, CameraModelError> {
        self.project(&pose.transform_point(point))
    }

    pub fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        validation::validate_coefficients(&self.distortion.coefficients())
    }
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_intrinsics(intrinsics: &Intrinsics) -> Result<(), CameraModelError> {
        if !(intrinsics.fx > 0.0 && intrinsics.fy > 0.0) {
            return Err(CameraModelError::FocalLengthMustBePositive);
        }
        if !intrinsics.cx.is_finite() || !intrinsics.cy.is_finite() {
            return Err(CameraModelError::PrincipalPointMustBeFinite);
        }
        if !intrinsics.skew.is_finite() {
            return Err(CameraModelError::InvalidParams(
                "Skew must be finite".to_string(),
            ));
        }
        Ok(())
    }

    pub fn validate_coefficients(coefficients: &[f64]) -> Result<(), CameraModelError> {
        if let Some(idx) = coefficients.iter().position(|c| !c.is_finite()) {
            return Err(CameraModelError::InvalidParams(format!(
                "Distortion coefficient {idx} is not finite"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_model() -> CameraModel {
        CameraModel::new(
            Intrinsics {
                fx: 461.629,
                fy: 460.152,
                cx: 362.680,
                cy: 246.049,
                skew: 0.0,
            },
            Distortion::PlumbBob(PlumbBob::new(-0.2834, 0.0739, 0.0001, 1.7618e-05, 0.0)),
        )
    }

    #[test]
    fn test_project_unproject_roundtrip() {
        let model = sample_model();
        let point_3d = Point3::new(0.3, -0.2, 1.5);
        let pixel = model.project(&point_3d).unwrap();
        let ray = model.unproject(&pixel);

        assert_relative_eq!(ray.x, point_3d.x / point_3d.z, epsilon = 1e-9);
        assert_relative_eq!(ray.y, point_3d.y / point_3d.z, epsilon = 1e-9);
        assert_relative_eq!(ray.z, 1.0);
    }

    #[test]
    fn test_project_rejects_points_behind_camera() {
        let model = sample_model();
        let result = model.project(&Point3::new(1.0, 1.0, 0.0));
        assert!(matches!(result, Err(CameraModelError::PointAtCameraCenter)));
    }

    #[test]
    fn test_pose_rotation_vector_roundtrip() {
        let rvec = Vector3::new(0.1, -0.2, 0.3);
        let pose = Pose::from_rotation_vector(rvec, Vector3::new(1.0, 2.0, 3.0));
        assert_relative_eq!(pose.rotation_vector(), rvec, epsilon = 1e-12);

        let moved = pose.transform_point(&Point3::origin());
        assert_relative_eq!(moved, Point3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_validate_intrinsics() {
        let mut model = sample_model();
        assert!(model.validate_params().is_ok());

        model.intrinsics.fx = -1.0;
        assert!(matches!(
            model.validate_params(),
            Err(CameraModelError::FocalLengthMustBePositive)
        ));

        model.intrinsics.fx = 400.0;
        model.intrinsics.cy = f64::NAN;
        assert!(matches!(
            model.validate_params(),
            Err(CameraModelError::PrincipalPointMustBeFinite)
        ));
    }
}
