//! Implements the PlumbBob (radial-tangential, Brown-Conrady) distortion model.
//!
//! The model warps an ideal normalized point `(x, y)` as
//!
//! ```text
//! r2      = x^2 + y^2
//! radial  = 1 + k1 r2 + k2 r2^2 + k3 r2^3
//! x_d     = x radial + 2 p1 x y + p2 (r2 + 2 x^2)
//! y_d     = y radial + p1 (r2 + 2 y^2) + 2 p2 x y
//! ```
//!
//! This is the five-coefficient layout used by OpenCV (`k1, k2, p1, p2, k3`).
//! The inverse has no closed form and is computed with Newton's method.

use nalgebra::{Matrix2, Point2, SMatrix};
use serde::{Deserialize, Serialize};

/// Newton iterations used by [`PlumbBob::undistort`].
const MAX_UNDISTORT_ITERATIONS: usize = 20;
/// Squared step length below which the inverse is considered converged.
const UNDISTORT_TOLERANCE_SQ: f64 = 1e-24;
/// Largest `|distort(p) - target|` accepted as a solution.
const UNDISTORT_RESIDUAL: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PlumbBob {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl PlumbBob {
    pub const NUM_COEFFICIENTS: usize = 5;

    pub fn new(k1: f64, k2: f64, p1: f64, p2: f64, k3: f64) -> Self {
        Self { k1, k2, p1, p2, k3 }
    }

    /// Coefficients in OpenCV order `[k1, k2, p1, p2, k3]`.
    pub fn coefficients(&self) -> [f64; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    pub fn from_coefficients(c: &[f64; 5]) -> Self {
        Self::new(c[0], c[1], c[2], c[3], c[4])
    }

    #[inline]
    fn radial(&self, r2: f64) -> f64 {
        1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3))
    }

    pub fn distort(&self, point: &Point2<f64>) -> Point2<f64> {
        let (x, y) = (point.x, point.y);
        let r2 = x * x + y * y;
        let radial = self.radial(r2);
        let tangential_x = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let tangential_y = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        Point2::new(radial * x + tangential_x, radial * y + tangential_y)
    }

    /// Jacobian of [`PlumbBob::distort`] with respect to the input point.
    pub fn point_jacobian(&self, point: &Point2<f64>) -> Matrix2<f64> {
        let (x, y) = (point.x, point.y);
        let r2 = x * x + y * y;
        let radial = self.radial(r2);
        let d_radial = self.k1 + r2 * (2.0 * self.k2 + 3.0 * self.k3 * r2);

        let dxd_dx = radial + 2.0 * x * x * d_radial + 2.0 * self.p1 * y + 6.0 * self.p2 * x;
        let dxd_dy = 2.0 * x * y * d_radial + 2.0 * self.p1 * x + 2.0 * self.p2 * y;
        let dyd_dx = 2.0 * x * y * d_radial + 2.0 * self.p1 * x + 2.0 * self.p2 * y;
        let dyd_dy = radial + 2.0 * y * y * d_radial + 6.0 * self.p1 * y + 2.0 * self.p2 * x;

        Matrix2::new(dxd_dx, dxd_dy, dyd_dx, dyd_dy)
    }

    /// Jacobian of [`PlumbBob::distort`] with respect to `[k1, k2, p1, p2, k3]`.
    pub fn coefficient_jacobian(&self, point: &Point2<f64>) -> SMatrix<f64, 2, 5> {
        let (x, y) = (point.x, point.y);
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        SMatrix::<f64, 2, 5>::new(
            x * r2,
            x * r4,
            2.0 * x * y,
            r2 + 2.0 * x * x,
            x * r6,
            y * r2,
            y * r4,
            r2 + 2.0 * y * y,
            2.0 * x * y,
            y * r6,
        )
    }

    /// Removes distortion from a distorted normalized point.
    ///
    /// Starts from the distorted point and runs Newton steps on
    /// `distort(p) - target = 0`. Falls back to the fixed-point update used by
    /// OpenCV when the Jacobian is singular.
    ///
    /// Returns NaN coordinates when no solution with a positive radial factor
    /// and an orientation-preserving Jacobian is found.
    pub fn undistort(&self, distorted: &Point2<f64>) -> Point2<f64> {
        let target = distorted.coords;
        let mut p = target;

        for _ in 0..MAX_UNDISTORT_ITERATIONS {
            let current = Point2::from(p);
            let residual = self.distort(&current).coords - target;
            let step = match self.point_jacobian(&current).try_inverse() {
                Some(inv) => inv * residual,
                None => {
                    let r2 = p.norm_squared();
                    let radial = self.radial(r2);
                    if radial.abs() < f64::EPSILON {
                        break;
                    }
                    residual / radial
                }
            };
            p -= step;
            if !p.x.is_finite() || !p.y.is_finite() {
                return Point2::new(f64::NAN, f64::NAN);
            }
            if step.norm_squared() < UNDISTORT_TOLERANCE_SQ {
                break;
            }
        }

        let solution = Point2::from(p);
        let residual = (self.distort(&solution).coords - target).norm();
        let tolerance = UNDISTORT_RESIDUAL * target.norm().max(1.0);
        let solved = residual <= tolerance
            && self.radial(p.norm_squared()) > 0.0
            && self.point_jacobian(&solution).determinant() > 0.0;
        if solved {
            solution
        } else {
            Point2::new(f64::NAN, f64::NAN)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample() -> PlumbBob {
        PlumbBob::new(-0.2834, 0.0739, 0.0001, 1.7618e-05, 0.0)
    }

    #[test]
    fn test_zero_coefficients_are_identity() {
        let model = PlumbBob::default();
        let p = Point2::new(0.4, -0.3);
        assert_eq!(model.distort(&p), p);
        assert_eq!(model.undistort(&p), p);
    }

    #[test]
    fn test_distort_matches_closed_form() {
        let model = PlumbBob::new(0.1, 0.1, 0.2, 0.1, 0.0);
        let p = Point2::new(0.5, 0.25);
        let r2: f64 = 0.3125;
        let radial = 1.0 + 0.1 * r2 + 0.1 * r2 * r2;
        let expected_x = 0.5 * radial + 2.0 * 0.2 * 0.5 * 0.25 + 0.1 * (r2 + 2.0 * 0.25);
        let expected_y = 0.25 * radial + 0.2 * (r2 + 2.0 * 0.0625) + 2.0 * 0.1 * 0.5 * 0.25;
        let d = model.distort(&p);
        assert_relative_eq!(d.x, expected_x, epsilon = 1e-15);
        assert_relative_eq!(d.y, expected_y, epsilon = 1e-15);
    }

    #[test]
    fn test_undistort_inverts_distort() {
        let model = sample();
        for &(x, y) in &[(0.0, 0.0), (0.1, 0.2), (-0.4, 0.3), (0.5, -0.5), (-0.2, -0.6)] {
            let p = Point2::new(x, y);
            let back = model.undistort(&model.distort(&p));
            assert_relative_eq!(back, p, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_undistort_outside_invertible_range_is_nan() {
        // x (1 - 0.5 x^2) peaks at about 0.544 on the positive axis
        let model = PlumbBob::new(-0.5, 0.0, 0.0, 0.0, 0.0);
        let back = model.undistort(&Point2::new(0.8, 0.0));
        assert!(back.x.is_nan() && back.y.is_nan(), "{back:?}");

        let inside = model.undistort(&Point2::new(0.4, 0.1));
        assert_relative_eq!(model.distort(&inside), Point2::new(0.4, 0.1), epsilon = 1e-9);
    }

    #[test]
    fn test_point_jacobian_matches_finite_differences() {
        let model = PlumbBob::new(-0.25, 0.07, 0.003, -0.002, 0.01);
        let p = Point2::new(0.31, -0.17);
        let analytic = model.point_jacobian(&p);
        let h = 1e-7;
        for col in 0..2 {
            let mut plus = p;
            let mut minus = p;
            plus[col] += h;
            minus[col] -= h;
            let numeric = (model.distort(&plus) - model.distort(&minus)) / (2.0 * h);
            assert_relative_eq!(analytic[(0, col)], numeric.x, epsilon = 1e-6);
            assert_relative_eq!(analytic[(1, col)], numeric.y, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_coefficient_jacobian_matches_finite_differences() {
        let model = PlumbBob::new(-0.25, 0.07, 0.003, -0.002, 0.01);
        let p = Point2::new(0.31, -0.17);
        let analytic = model.coefficient_jacobian(&p);
        let h = 1e-7;
        for col in 0..5 {
            let mut plus = model.coefficients();
            let mut minus = model.coefficients();
            plus[col] += h;
            minus[col] -= h;
            let numeric = (PlumbBob::from_coefficients(&plus).distort(&p)
                - PlumbBob::from_coefficients(&minus).distort(&p))
                / (2.0 * h);
            assert_relative_eq!(analytic[(0, col)], numeric.x, epsilon = 1e-6);
            assert_relative_eq!(analytic[(1, col)], numeric.y, epsilon = 1e-6);
        }
    }
}
