//! Implements the FishEye (Kannala-Brandt, equidistant) distortion model.
//!
//! The incoming ray angle `theta = atan(r)` of an ideal normalized point with
//! radius `r` is mapped to the distorted radius
//!
//! ```text
//! theta_d = theta (1 + k1 theta^2 + k2 theta^4 + k3 theta^6 + k4 theta^8)
//! ```
//!
//! and the point is rescaled along its radial direction by `theta_d / r`.
//! The model is radial only and matches the OpenCV `fisheye` module.

use nalgebra::{Matrix2, Point2, SMatrix};
use serde::{Deserialize, Serialize};
use std::f64::consts::FRAC_PI_2;

const MAX_UNDISTORT_ITERATIONS: usize = 20;
const UNDISTORT_TOLERANCE: f64 = 1e-12;
/// Largest `|theta_d(theta) - theta_d|` accepted as a solution.
const UNDISTORT_RESIDUAL: f64 = 1e-9;
/// Radius under which the model is treated as the identity.
const MIN_RADIUS: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FishEye {
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
    pub k4: f64,
}

impl FishEye {
    pub const NUM_COEFFICIENTS: usize = 4;

    pub fn new(k1: f64, k2: f64, k3: f64, k4: f64) -> Self {
        Self { k1, k2, k3, k4 }
    }

    pub fn coefficients(&self) -> [f64; 4] {
        [self.k1, self.k2, self.k3, self.k4]
    }

    pub fn from_coefficients(c: &[f64; 4]) -> Self {
        Self::new(c[0], c[1], c[2], c[3])
    }

    /// `theta_d(theta)`
    #[inline]
    fn distorted_angle(&self, theta: f64) -> f64 {
        let t2 = theta * theta;
        theta * (1.0 + t2 * (self.k1 + t2 * (self.k2 + t2 * (self.k3 + t2 * self.k4))))
    }

    /// `d theta_d / d theta`
    #[inline]
    fn distorted_angle_derivative(&self, theta: f64) -> f64 {
        let t2 = theta * theta;
        1.0 + t2 * (3.0 * self.k1 + t2 * (5.0 * self.k2 + t2 * (7.0 * self.k3 + t2 * 9.0 * self.k4)))
    }

    pub fn distort(&self, point: &Point2<f64>) -> Point2<f64> {
        let r = point.coords.norm();
        if r < MIN_RADIUS {
            return *point;
        }
        let theta_d = self.distorted_angle(r.atan());
        Point2::from(point.coords * (theta_d / r))
    }

    /// Jacobian of [`FishEye::distort`] with respect to the input point.
    pub fn point_jacobian(&self, point: &Point2<f64>) -> Matrix2<f64> {
        let r = point.coords.norm();
        if r < MIN_RADIUS {
            return Matrix2::identity();
        }
        let theta = r.atan();
        let theta_d = self.distorted_angle(theta);
        let scale = theta_d / r;
        let dtheta_dr = 1.0 / (1.0 + r * r);
        let dscale_dr = (self.distorted_angle_derivative(theta) * dtheta_dr * r - theta_d) / (r * r);

        let p = point.coords;
        Matrix2::identity() * scale + (p * p.transpose()) * (dscale_dr / r)
    }

    /// Jacobian of [`FishEye::distort`] with respect to `[k1, k2, k3, k4]`.
    pub fn coefficient_jacobian(&self, point: &Point2<f64>) -> SMatrix<f64, 2, 4> {
        let r = point.coords.norm();
        let mut jac = SMatrix::<f64, 2, 4>::zeros();
        if r < MIN_RADIUS {
            return jac;
        }
        let theta = r.atan();
        let t2 = theta * theta;
        let mut power = theta * t2;
        for col in 0..4 {
            jac[(0, col)] = point.x * power / r;
            jac[(1, col)] = point.y * power / r;
            power *= t2;
        }
        jac
    }

    /// Recovers the ideal normalized point by solving `theta_d(theta)` for the
    /// ray angle with Newton's method.
    ///
    /// Returns NaN coordinates when `theta_d` has no preimage on the
    /// increasing branch of the polynomial within `[0, pi/2)`.
    pub fn undistort(&self, distorted: &Point2<f64>) -> Point2<f64> {
        let theta_d_norm = distorted.coords.norm();
        if theta_d_norm < MIN_RADIUS {
            return *distorted;
        }
        let theta_d = theta_d_norm;

        let mut theta = theta_d.min(FRAC_PI_2 - 1e-6);
        for _ in 0..MAX_UNDISTORT_ITERATIONS {
            let derivative = self.distorted_angle_derivative(theta);
            if derivative.abs() < f64::EPSILON {
                break;
            }
            let step = (self.distorted_angle(theta) - theta_d) / derivative;
            theta -= step;
            if step.abs() < UNDISTORT_TOLERANCE {
                break;
            }
        }

        let solved = (0.0..FRAC_PI_2).contains(&theta)
            && (self.distorted_angle(theta) - theta_d).abs() < UNDISTORT_RESIDUAL
            && self.distorted_angle_derivative(theta) > 0.0;
        let r = theta.tan();
        if !solved || !r.is_finite() {
            return Point2::new(f64::NAN, f64::NAN);
        }
        Point2::from(distorted.coords * (r / theta_d_norm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample() -> FishEye {
        FishEye::new(-0.0114, 0.0479, -0.0401, 0.0103)
    }

    #[test]
    fn test_zero_coefficients_roundtrip() {
        let model = FishEye::default();
        for &(x, y) in &[(0.0, 0.0), (0.2, 0.1), (-0.7, 0.4), (1.2, -0.9)] {
            let p = Point2::new(x, y);
            let back = model.undistort(&model.distort(&p));
            assert_relative_eq!(back, p, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_distort_is_equidistant_for_zero_coefficients() {
        let model = FishEye::default();
        let p = Point2::new(1.0, 0.0);
        let d = model.distort(&p);
        assert_relative_eq!(d.x, std::f64::consts::FRAC_PI_4, epsilon = 1e-12);
        assert_relative_eq!(d.y, 0.0);
    }

    #[test]
    fn test_undistort_inverts_distort() {
        let model = sample();
        for &(x, y) in &[(0.05, 0.02), (0.3, -0.4), (-0.9, 0.6), (1.5, 1.0)] {
            let p = Point2::new(x, y);
            let back = model.undistort(&model.distort(&p));
            assert_relative_eq!(back, p, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_undistort_outside_invertible_range_is_nan() {
        // theta_d peaks at about 0.702 for theta = 1.054
        let model = FishEye::new(-0.3, 0.0, 0.0, 0.0);
        for theta_d in [1.0, 1.4] {
            let back = model.undistort(&Point2::new(theta_d, 0.0));
            assert!(back.x.is_nan() && back.y.is_nan(), "{back:?}");
        }

        let inside = model.undistort(&Point2::new(0.5, 0.0));
        assert_relative_eq!(model.distort(&inside).x, 0.5, epsilon = 1e-9);

        // beyond 90 degrees no ray exists even without distortion
        assert!(FishEye::default().undistort(&Point2::new(1.7, 0.0)).x.is_nan());
    }

    #[test]
    fn test_jacobians_match_finite_differences() {
        let model = sample();
        let p = Point2::new(0.42, -0.33);
        let h = 1e-7;

        let analytic = model.point_jacobian(&p);
        for col in 0..2 {
            let mut plus = p;
            let mut minus = p;
            plus[col] += h;
            minus[col] -= h;
            let numeric = (model.distort(&plus) - model.distort(&minus)) / (2.0 * h);
            assert_relative_eq!(analytic[(0, col)], numeric.x, epsilon = 1e-6);
            assert_relative_eq!(analytic[(1, col)], numeric.y, epsilon = 1e-6);
        }

        let analytic = model.coefficient_jacobian(&p);
        for col in 0..4 {
            let mut plus = model.coefficients();
            let mut minus = model.coefficients();
            plus[col] += h;
            minus[col] -= h;
            let numeric = (FishEye::from_coefficients(&plus).distort(&p)
                - FishEye::from_coefficients(&minus).distort(&p))
                / (2.0 * h);
            assert_relative_eq!(analytic[(0, col)], numeric.x, epsilon = 1e-6);
            assert_relative_eq!(analytic[(1, col)], numeric.y, epsilon = 1e-6);
        }
    }
}
