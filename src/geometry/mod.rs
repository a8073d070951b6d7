//! Planar pattern geometry and small linear-algebra helpers.

use nalgebra::{Matrix3, Point3, Vector3};
use serde::{Deserialize, Serialize};

pub mod homography;

pub use homography::{find_homography, GeometryError};

/// Number of inner chessboard corners along each axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatternSize {
    pub corners_x: usize,
    pub corners_y: usize,
}

impl PatternSize {
    pub fn new(corners_x: usize, corners_y: usize) -> Self {
        Self {
            corners_x,
            corners_y,
        }
    }

    pub fn num_corners(&self) -> usize {
        self.corners_x * self.corners_y
    }
}

/// Pattern-frame corner coordinates (z = 0), row-major with x varying fastest.
pub fn pattern_object_points(size: PatternSize, square_size: f64) -> Vec<Point3<f64>> {
    (0..size.corners_y)
        .flat_map(|row| {
            (0..size.corners_x).map(move |col| {
                Point3::new(col as f64 * square_size, row as f64 * square_size, 0.0)
            })
        })
        .collect()
}

/// `[v]x` such that `[v]x w = v x w`.
pub fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y, //
        v.z, 0.0, -v.x, //
        -v.y, v.x, 0.0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_object_points_order() {
        let points = pattern_object_points(PatternSize::new(3, 2), 0.5);
        assert_eq!(points.len(), 6);
        assert_eq!(points[0], Point3::new(0.0, 0.0, 0.0));
        assert_eq!(points[1], Point3::new(0.5, 0.0, 0.0));
        assert_eq!(points[3], Point3::new(0.0, 0.5, 0.0));
        assert!(points.iter().all(|p| p.z == 0.0));
    }

    #[test]
    fn test_skew_symmetric_matches_cross() {
        let a = Vector3::new(0.3, -1.2, 2.0);
        let b = Vector3::new(-0.7, 0.4, 0.9);
        assert_eq!(skew_symmetric(&a) * b, a.cross(&b));
    }
}
