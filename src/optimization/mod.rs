//! The `optimization` module recovers intrinsics, distortion and per-view poses
//! from planar pattern observations.
//!
//! Calibration runs in two stages:
//! 1. A linear initialization with zero distortion: one homography per view,
//!    Zhang's closed form for the intrinsics ([`zhang`]), and a pose per view
//!    decomposed from its homography and polished with `tiny_solver`
//!    ([`extrinsics`]).
//! 2. A joint Levenberg-Marquardt refinement of every parameter
//!    ([`calibrate`], driven by the pure state transition in [`lm`]).
//!
//! The entry point is [`calibrate::calibrate`], re-exported here.

use crate::camera::{
    CalibrationArtifact, CameraModel, CameraModelError, Distortion, DistortionKind, Intrinsics,
    Pose,
};
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod calibrate;
pub mod extrinsics;
pub mod lm;
pub mod zhang;

pub use calibrate::{calibrate, calibrate_with_cancel};

/// Iteration budget and convergence threshold of an iterative solver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TerminationCriteria {
    pub max_iterations: usize,
    pub epsilon: f64,
}

impl TerminationCriteria {
    pub fn new(max_iterations: usize, epsilon: f64) -> Self {
        Self {
            max_iterations,
            epsilon,
        }
    }
}

/// Correspondences of one image: pattern points and their detections, in the
/// same order.
#[derive(Debug, Clone, PartialEq)]
pub struct View {
    pub object_points: Vec<Point3<f64>>,
    pub image_points: Vec<Point2<f64>>,
}

impl View {
    pub fn new(object_points: Vec<Point3<f64>>, image_points: Vec<Point2<f64>>) -> Self {
        Self {
            object_points,
            image_points,
        }
    }

    pub fn len(&self) -> usize {
        self.image_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_points.is_empty()
    }

    pub(crate) fn validate(&self, index: usize) -> Result<(), CalibrationError> {
        if self.object_points.len() != self.image_points.len() {
            return Err(CalibrationError::InvalidParams(format!(
                "view {index} has {} object points but {} image points",
                self.object_points.len(),
                self.image_points.len()
            )));
        }
        if self.len() < 4 {
            return Err(CalibrationError::InvalidParams(format!(
                "view {index} has {} correspondences, at least 4 are required",
                self.len()
            )));
        }
        if self.object_points.iter().any(|p| p.z.abs() > 1e-9) {
            return Err(CalibrationError::InvalidParams(format!(
                "view {index} has non-planar object points (z != 0)"
            )));
        }
        let finite = self
            .image_points
            .iter()
            .all(|p| p.x.is_finite() && p.y.is_finite());
        if !finite {
            return Err(CalibrationError::InvalidParams(format!(
                "view {index} has non-finite image points"
            )));
        }
        Ok(())
    }
}

/// Solver options.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Distortion family to fit.
    pub distortion_kind: DistortionKind,
    pub criteria: TerminationCriteria,
    /// Views required; values below 3 are raised to 3.
    pub min_views: usize,
    /// Keep the skew at zero.
    pub fix_skew: bool,
    /// Keep the PlumbBob tangential terms `p1`, `p2` at zero.
    pub zero_tangent_dist: bool,
    /// Keep the PlumbBob `k3` term at zero.
    pub fix_k3: bool,
    /// Refine each initial pose with `tiny_solver` before the joint solve.
    pub polish_poses: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            distortion_kind: DistortionKind::PlumbBob,
            criteria: TerminationCriteria::new(100, 1e-10),
            min_views: 3,
            fix_skew: true,
            zero_tangent_dist: false,
            fix_k3: false,
            polish_poses: true,
        }
    }
}

impl SolverConfig {
    pub fn required_views(&self) -> usize {
        self.min_views.max(3)
    }
}

/// An image that did not contribute a view, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedView {
    pub label: String,
    pub reason: String,
}

impl fmt::Display for RejectedView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.label, self.reason)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("Insufficient views: {found} usable, at least {required} required")]
    InsufficientViews {
        required: usize,
        found: usize,
        rejected: Vec<RejectedView>,
    },
    #[error("Numerical divergence: {reason} (last RMS {last_rms:.4} px)")]
    NumericalDivergence {
        reason: String,
        /// Last intrinsics estimate. All fields are NaN when the failure
        /// happened before any estimate existed.
        last_intrinsics: Intrinsics,
        last_distortion: Distortion,
        last_rms: f64,
    },
    #[error("Invalid calibration input: {0}")]
    InvalidParams(String),
    #[error("Calibration cancelled")]
    Cancelled,
    #[error(transparent)]
    Camera(#[from] CameraModelError),
}

/// Convergence summary of the joint refinement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolveReport {
    pub iterations: usize,
    /// Sum of squared pixel residuals before and after the refinement.
    pub initial_cost: f64,
    pub final_cost: f64,
    pub converged: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationResult {
    pub intrinsics: Intrinsics,
    pub distortion: Distortion,
    /// Pattern-to-camera pose of each view, in input order.
    pub poses: Vec<Pose>,
    /// Root mean squared reprojection error over all points, in pixels.
    pub rms_error: f64,
    /// Mean Euclidean reprojection error of each view, in pixels.
    pub per_view_errors: Vec<f64>,
    pub report: SolveReport,
}

impl CalibrationResult {
    pub fn camera_model(&self) -> CameraModel {
        CameraModel::new(self.intrinsics, self.distortion)
    }

    pub fn to_artifact(&self) -> CalibrationArtifact {
        CalibrationArtifact::new(self.intrinsics, self.distortion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_validation() {
        let object = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(1.0, 1.0, 0.0),
        ];
        let image = vec![
            Point2::new(0.0, 0.0),
            Point2::new(10.0, 0.0),
            Point2::new(0.0, 10.0),
            Point2::new(10.0, 10.0),
        ];
        assert!(View::new(object.clone(), image.clone()).validate(0).is_ok());
        assert!(View::new(object[..3].to_vec(), image.clone()).validate(0).is_err());

        let mut lifted = object.clone();
        lifted[2].z = 0.5;
        assert!(matches!(
            View::new(lifted, image).validate(3),
            Err(CalibrationError::InvalidParams(msg)) if msg.contains("view 3")
        ));
    }

    #[test]
    fn test_solver_config_defaults() {
        let config = SolverConfig::default();
        assert!(config.fix_skew);
        assert_eq!(config.criteria, TerminationCriteria::new(100, 1e-10));
        assert_eq!(config.distortion_kind, DistortionKind::PlumbBob);

        let relaxed = SolverConfig {
            min_views: 1,
            ..SolverConfig::default()
        };
        assert_eq!(relaxed.required_views(), 3);

        let parsed: SolverConfig = serde_json::from_str(r#"{"distortion_kind": "FishEye"}"#).unwrap();
        assert_eq!(parsed.distortion_kind, DistortionKind::FishEye);
        assert_eq!(parsed.min_views, 3);
    }
}
