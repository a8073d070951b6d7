//! Plane-to-image homography by the normalized direct linear transform.

use nalgebra::{Matrix3, Point2, SMatrix, SVector, Vector2};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("Need at least 4 correspondences, found {0}")]
    NotEnoughPoints(usize),
    #[error("Point sets have different lengths ({0} vs {1})")]
    LengthMismatch(usize, usize),
    #[error("Degenerate point configuration: {0}")]
    Degenerate(String),
}

/// Similarity moving the centroid to the origin with mean distance sqrt(2).
fn normalization(points: &[Point2<f64>]) -> Result<Matrix3<f64>, GeometryError> {
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector2::<f64>::zeros(), |acc, p| acc + p.coords) / n;
    let mean_dist = points.iter().map(|p| (p.coords - centroid).norm()).sum::<f64>() / n;
    if mean_dist < f64::EPSILON {
        return Err(GeometryError::Degenerate(
            "all points coincide".to_string(),
        ));
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    Ok(Matrix3::new(
        s, 0.0, -s * centroid.x, //
        0.0, s, -s * centroid.y, //
        0.0, 0.0, 1.0,
    ))
}

fn apply(t: &Matrix3<f64>, p: &Point2<f64>) -> Point2<f64> {
    Point2::new(
        t[(0, 0)] * p.x + t[(0, 2)],
        t[(1, 1)] * p.y + t[(1, 2)],
    )
}

/// Estimates `H` with `dst ~ H src` from at least four correspondences.
///
/// Both point sets are Hartley-normalized, the 2n x 9 DLT system is reduced to
/// its 9 x 9 normal matrix and the null vector is the eigenvector of the
/// smallest eigenvalue. The result is scaled so that `H[(2, 2)] = 1`.
pub fn find_homography(
    src: &[Point2<f64>],
    dst: &[Point2<f64>],
) -> Result<Matrix3<f64>, GeometryError> {
    if src.len() != dst.len() {
        return Err(GeometryError::LengthMismatch(src.len(), dst.len()));
    }
    if src.len() < 4 {
        return Err(GeometryError::NotEnoughPoints(src.len()));
    }

    let t_src = normalization(src)?;
    let t_dst = normalization(dst)?;

    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    for (s, d) in src.iter().zip(dst) {
        let s = apply(&t_src, s);
        let d = apply(&t_dst, d);
        let (x, y, u, v) = (s.x, s.y, d.x, d.y);
        let r1 = SVector::<f64, 9>::from_column_slice(&[
            -x, -y, -1.0, 0.0, 0.0, 0.0, u * x, u * y, u,
        ]);
        let r2 = SVector::<f64, 9>::from_column_slice(&[
            0.0, 0.0, 0.0, -x, -y, -1.0, v * x, v * y, v,
        ]);
        ata += r1 * r1.transpose() + r2 * r2.transpose();
    }

    let eigen = ata.symmetric_eigen();
    let mut order: Vec<usize> = (0..9).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));
    let largest = eigen.eigenvalues[order[8]].abs().max(f64::MIN_POSITIVE);
    if eigen.eigenvalues[order[1]].abs() < 1e-12 * largest {
        return Err(GeometryError::Degenerate(
            "homography null space is not one-dimensional".to_string(),
        ));
    }

    let h = eigen.eigenvectors.column(order[0]);
    let hn = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let t_dst_inv = t_dst.try_inverse().ok_or_else(|| {
        GeometryError::Degenerate("normalization is not invertible".to_string())
    })?;
    let homography = t_dst_inv * hn * t_src;

    let scale = homography[(2, 2)];
    if scale.abs() > f64::EPSILON {
        Ok(homography / scale)
    } else {
        Ok(homography / homography.norm())
    }
}
