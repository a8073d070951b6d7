//! Closed-form intrinsics from plane homographies (Zhang's method).
//!
//! Each homography `H = [h1 h2 h3]` of a plane seen by a camera `K` yields two
//! linear constraints on the symmetric matrix `B = K^-T K^-1`:
//!
//! ```text
//! h1ᵀ B h2 = 0
//! h1ᵀ B h1 - h2ᵀ B h2 = 0
//! ```
//!
//! Stacking them for every view and taking the null vector of the system gives
//! `B` up to scale, from which `K` is read off in closed form. The image points
//! are normalized first so the system is well conditioned at any resolution.

use crate::camera::Intrinsics;
use crate::optimization::View;
use nalgebra::{Matrix3, SMatrix, SVector, Vector2};

/// Second-smallest eigenvalue below this fraction of the largest one means
/// the views do not constrain `B`.
const DEGENERACY_RATIO: f64 = 1e-10;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ZhangError {
    #[error("need at least 2 homographies, found {0}")]
    NotEnoughViews(usize),
    #[error("degenerate view configuration: {0}")]
    Degenerate(String),
}

/// Centroid and mean distance of all image points, used as a similarity that
/// brings pixel coordinates to unit scale.
fn pixel_normalization(views: &[View]) -> Result<(Vector2<f64>, f64), ZhangError> {
    let count = views.iter().map(View::len).sum::<usize>();
    if count == 0 {
        return Err(ZhangError::Degenerate("no image points".to_string()));
    }
    let centroid = views
        .iter()
        .flat_map(|v| v.image_points.iter())
        .fold(Vector2::zeros(), |acc, p| acc + p.coords)
        / count as f64;
    let scale = views
        .iter()
        .flat_map(|v| v.image_points.iter())
        .map(|p| (p.coords - centroid).norm())
        .sum::<f64>()
        / count as f64;
    if scale < f64::EPSILON {
        return Err(ZhangError::Degenerate("all image points coincide".to_string()));
    }
    Ok((centroid, scale))
}

/// Row `v_ij` with `h_iᵀ B h_j = v_ij · [B11, B12, B22, B13, B23, B33]`.
fn constraint_row(h: &Matrix3<f64>, i: usize, j: usize) -> SVector<f64, 6> {
    let hi = h.column(i);
    let hj = h.column(j);
    SVector::<f64, 6>::from([
        hi[0] * hj[0],
        hi[0] * hj[1] + hi[1] * hj[0],
        hi[1] * hj[1],
        hi[2] * hj[0] + hi[0] * hj[2],
        hi[2] * hj[1] + hi[1] * hj[2],
        hi[2] * hj[2],
    ])
}

/// Initial intrinsics from per-view homographies (`image ~ H object`).
///
/// `views` supplies the image points used for conditioning and must match
/// `homographies` one to one. With `fix_skew` the extra constraint `B12 = 0`
/// forces a zero-skew solution.
pub fn estimate_intrinsics(
    homographies: &[Matrix3<f64>],
    views: &[View],
    fix_skew: bool,
) -> Result<Intrinsics, ZhangError> {
    if homographies.len() < 2 {
        return Err(ZhangError::NotEnoughViews(homographies.len()));
    }
    let (centroid, scale) = pixel_normalization(views)?;
    let normalize = Matrix3::new(
        1.0 / scale, 0.0, -centroid.x / scale, //
        0.0, 1.0 / scale, -centroid.y / scale, //
        0.0, 0.0, 1.0,
    );

    let mut vtv = SMatrix::<f64, 6, 6>::zeros();
    for h in homographies {
        let h = normalize * h;
        let h = h / h.norm();
        let v12 = constraint_row(&h, 0, 1);
        let diff = constraint_row(&h, 0, 0) - constraint_row(&h, 1, 1);
        vtv += v12 * v12.transpose() + diff * diff.transpose();
    }
    if fix_skew {
        let mut skew_row = SVector::<f64, 6>::zeros();
        skew_row[1] = 1.0;
        vtv += skew_row * skew_row.transpose();
    }

    let eigen = vtv.symmetric_eigen();
    let mut order: Vec<usize> = (0..6).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));
    let largest = eigen.eigenvalues[order[5]];
    if eigen.eigenvalues[order[1]] <= DEGENERACY_RATIO * largest {
        return Err(ZhangError::Degenerate(
            "views do not constrain the camera matrix (parallel planes?)".to_string(),
        ));
    }
    let mut b = eigen.eigenvectors.column(order[0]).into_owned();
    if b[0] < 0.0 {
        b = -b;
    }
    let (b11, b12, b22, b13, b23, b33) = (b[0], b[1], b[2], b[3], b[4], b[5]);

    let denom = b11 * b22 - b12 * b12;
    if !(denom > 0.0) || !(b11 > 0.0) {
        return Err(ZhangError::Degenerate(
            "recovered conic is not positive definite".to_string(),
        ));
    }
    let v0 = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
    if !(lambda / b11 > 0.0) {
        return Err(ZhangError::Degenerate(
            "recovered focal length is imaginary".to_string(),
        ));
    }
    let alpha = (lambda / b11).sqrt();
    let beta = (lambda * b11 / denom).sqrt();
    let gamma = -b12 * alpha * alpha * beta / lambda;
    let u0 = gamma * v0 / beta - b13 * alpha * alpha / lambda;

    let intrinsics = Intrinsics::new(
        scale * alpha,
        scale * beta,
        scale * u0 + centroid.x,
        scale * v0 + centroid.y,
        if fix_skew { 0.0 } else { scale * gamma },
    );
    let finite = [
        intrinsics.fx,
        intrinsics.fy,
        intrinsics.cx,
        intrinsics.cy,
        intrinsics.skew,
    ]
    .iter()
    .all(|v| v.is_finite());
    if !finite {
        return Err(ZhangError::Degenerate(
            "closed-form intrinsics are not finite".to_string(),
        ));
    }
    Ok(intrinsics)
}
