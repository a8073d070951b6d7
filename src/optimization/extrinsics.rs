//! Per-view pose from a plane homography, optionally polished with
//! `tiny_solver`.
//!
//! With `H ~ K [r1 r2 t]`, the columns of `K^-1 H` give the first two rotation
//! columns and the translation up to a common scale. The scale is fixed by the
//! unit norm of the rotation columns and its sign by positive depth; the
//! resulting matrix is projected onto SO(3).

use crate::camera::{Intrinsics, Pose};
use crate::optimization::View;
use log::warn;
use nalgebra::{DVector, Matrix3, Point2, Rotation3, UnitQuaternion, Vector2, Vector3};
use rayon::prelude::*;
use std::collections::HashMap;
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

/// Decomposes `H` (image ~ H * pattern plane) into a pattern-to-camera pose.
pub fn pose_from_homography(intrinsics: &Intrinsics, homography: &Matrix3<f64>) -> Option<Pose> {
    let a = intrinsics.inverse_matrix() * homography;
    let (a1, a2, a3) = (
        a.column(0).into_owned(),
        a.column(1).into_owned(),
        a.column(2).into_owned(),
    );
    let norm = a1.norm() + a2.norm();
    if norm < f64::EPSILON {
        return None;
    }
    let mut lambda = 2.0 / norm;
    if a3.z * lambda < 0.0 {
        lambda = -lambda;
    }
    let r1 = a1 * lambda;
    let r2 = a2 * lambda;
    let r3 = r1.cross(&r2);
    let translation = a3 * lambda;

    let approx = Matrix3::from_columns(&[r1, r2, r3]);
    let svd = approx.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut rotation = u * v_t;
    if rotation.determinant() < 0.0 {
        let mut u = u;
        u.column_mut(2).neg_mut();
        rotation = u * v_t;
    }
    if !rotation.iter().all(|v| v.is_finite()) || !translation.iter().all(|v| v.is_finite()) {
        return None;
    }
    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rotation));
    Some(Pose::new(rotation, translation))
}

/// Mean Euclidean pinhole reprojection error of a view under `pose`.
pub fn pinhole_error(intrinsics: &Intrinsics, pose: &Pose, view: &View) -> f64 {
    let total: f64 = view
        .object_points
        .iter()
        .zip(&view.image_points)
        .map(|(object, observed)| {
            let p = pose.transform_point(object);
            if p.z <= f64::EPSILON {
                return f64::INFINITY;
            }
            let n = Point2::new(p.x / p.z, p.y / p.z);
            (intrinsics.normalized_to_pixel(&n) - observed).norm()
        })
        .sum();
    total / view.len().max(1) as f64
}

/// Pinhole reprojection residual of one view over a `[ω, t]` pose block.
#[derive(Debug, Clone)]
struct PoseCost {
    intrinsics: Intrinsics,
    object_points: Vec<Vector3<f64>>,
    image_points: Vec<Vector2<f64>>,
}

/// `R(ω) p` by the Rodrigues formula, first order near `ω = 0`.
fn rotate<T: nalgebra::RealField>(omega: &[T; 3], p: &[T; 3]) -> [T; 3] {
    let [wx, wy, wz] = omega.clone();
    let [px, py, pz] = p.clone();
    let cross = [
        wy.clone() * pz.clone() - wz.clone() * py.clone(),
        wz.clone() * px.clone() - wx.clone() * pz.clone(),
        wx.clone() * py.clone() - wy.clone() * px.clone(),
    ];
    let theta_sq = wx.clone() * wx.clone() + wy.clone() * wy.clone() + wz.clone() * wz.clone();
    if theta_sq <= nalgebra::convert::<f64, T>(1e-16) {
        return [
            px + cross[0].clone(),
            py + cross[1].clone(),
            pz + cross[2].clone(),
        ];
    }
    let theta = theta_sq.sqrt();
    let (sin, cos) = (theta.clone().sin(), theta.clone().cos());
    let dot = (wx.clone() * px.clone() + wy.clone() * py.clone() + wz.clone() * pz.clone())
        / theta.clone();
    let one: T = nalgebra::convert(1.0);
    let k = [wx / theta.clone(), wy / theta.clone(), wz / theta.clone()];
    let scale = sin / theta;
    let mut out = [px, py, pz];
    for (i, value) in out.iter_mut().enumerate() {
        *value = value.clone() * cos.clone()
            + cross[i].clone() * scale.clone()
            + k[i].clone() * dot.clone() * (one.clone() - cos.clone());
    }
    out
}

impl<T: nalgebra::RealField> Factor<T> for PoseCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let pose = &params[0];
        let omega = [pose[0].clone(), pose[1].clone(), pose[2].clone()];
        let t = [pose[3].clone(), pose[4].clone(), pose[5].clone()];
        let k = &self.intrinsics;
        let (fx, fy, cx, cy, skew): (T, T, T, T, T) = (
            nalgebra::convert(k.fx),
            nalgebra::convert(k.fy),
            nalgebra::convert(k.cx),
            nalgebra::convert(k.cy),
            nalgebra::convert(k.skew),
        );

        let mut residuals = DVector::zeros(self.image_points.len() * 2);
        for (i, (object, observed)) in self.object_points.iter().zip(&self.image_points).enumerate()
        {
            let p: [T; 3] = [
                nalgebra::convert(object.x),
                nalgebra::convert(object.y),
                nalgebra::convert(object.z),
            ];
            let [x, y, z] = rotate(&omega, &p);
            let x = x + t[0].clone();
            let y = y + t[1].clone();
            let z = z + t[2].clone();
            let (nx, ny) = (x / z.clone(), y / z);
            let u = fx.clone() * nx + skew.clone() * ny.clone() + cx.clone();
            let v = fy.clone() * ny + cy.clone();
            residuals[i * 2] = u - nalgebra::convert::<f64, T>(observed.x);
            residuals[i * 2 + 1] = v - nalgebra::convert::<f64, T>(observed.y);
        }
        residuals
    }
}

/// Refines `initial` against the view with intrinsics held fixed.
///
/// Returns the initial pose (and logs a warning) when the optimizer fails or
/// does not lower the reprojection error.
pub fn polish_pose(intrinsics: &Intrinsics, view: &View, initial: &Pose, index: usize) -> Pose {
    let cost = PoseCost {
        intrinsics: *intrinsics,
        object_points: view.object_points.iter().map(|p| p.coords).collect(),
        image_points: view.image_points.iter().map(|p| p.coords).collect(),
    };
    let mut problem = tiny_solver::Problem::new();
    problem.add_residual_block(view.len() * 2, &["pose"], Box::new(cost), None);

    let rvec = initial.rotation_vector();
    let t = initial.translation;
    let mut initial_values = HashMap::new();
    initial_values.insert(
        "pose".to_string(),
        DVector::from_vec(vec![rvec.x, rvec.y, rvec.z, t.x, t.y, t.z]),
    );

    let optimizer = LevenbergMarquardtOptimizer::default();
    let Some(result) = optimizer.optimize(&problem, &initial_values, None) else {
        warn!("Pose polish of view {index} failed, keeping the decomposed pose");
        return *initial;
    };
    let Some(values) = result.get("pose").filter(|v| v.len() == 6 && v.iter().all(|x| x.is_finite()))
    else {
        warn!("Pose polish of view {index} returned no usable pose");
        return *initial;
    };
    let polished = Pose::from_rotation_vector(
        Vector3::new(values[0], values[1], values[2]),
        Vector3::new(values[3], values[4], values[5]),
    );

    let before = pinhole_error(intrinsics, initial, view);
    let after = pinhole_error(intrinsics, &polished, view);
    if after.is_finite() && after <= before {
        polished
    } else {
        warn!("Pose polish of view {index} raised the error from {before:.4} to {after:.4} px");
        *initial
    }
}

/// Initial pose of every view: homography decomposition, then an optional
/// polish. Views are processed in parallel; the error carries the index of a
/// view whose homography could not be decomposed.
pub fn initial_poses(
    intrinsics: &Intrinsics,
    homographies: &[Matrix3<f64>],
    views: &[View],
    polish: bool,
) -> Result<Vec<Pose>, usize> {
    homographies
        .par_iter()
        .zip(views.par_iter())
        .enumerate()
        .map(|(index, (h, view))| {
            let pose = pose_from_homography(intrinsics, h).ok_or(index)?;
            Ok(if polish {
                polish_pose(intrinsics, view, &pose, index)
            } else {
                pose
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraModel, Distortion};
    use crate::geometry::{find_homography, pattern_object_points, PatternSize};
    use approx::assert_relative_eq;

    fn setup(pose: &Pose) -> (Intrinsics, Matrix3<f64>, View) {
        let intrinsics = Intrinsics::new(750.0, 740.0, 320.0, 240.0, 0.0);
        let model = CameraModel::new(intrinsics, Distortion::default());
        let object = pattern_object_points(PatternSize::new(7, 5), 1.0);
        let image: Vec<Point2<f64>> = object
            .iter()
            .map(|p| model.project_with_pose(pose, p).unwrap())
            .collect();
        let planar: Vec<Point2<f64>> = object.iter().map(|p| Point2::new(p.x, p.y)).collect();
        let h = find_homography(&planar, &image).unwrap();
        (intrinsics, h, View::new(object, image))
    }

    #[test]
    fn test_decomposes_exact_homography() {
        let truth = Pose::from_rotation_vector(
            Vector3::new(0.2, -0.3, 0.1),
            Vector3::new(-3.0, -2.0, 12.0),
        );
        let (intrinsics, h, _) = setup(&truth);
        let pose = pose_from_homography(&intrinsics, &h).unwrap();
        assert_relative_eq!(pose.rotation_vector(), truth.rotation_vector(), epsilon = 1e-6);
        assert_relative_eq!(pose.translation, truth.translation, epsilon = 1e-5);
    }

    #[test]
    fn test_depth_is_positive_for_negated_homography() {
        let truth = Pose::from_rotation_vector(
            Vector3::new(-0.1, 0.25, 0.0),
            Vector3::new(-3.0, -2.0, 10.0),
        );
        let (intrinsics, h, _) = setup(&truth);
        let pose = pose_from_homography(&intrinsics, &(-h)).unwrap();
        assert!(pose.translation.z > 0.0);
        assert_relative_eq!(pose.translation, truth.translation, epsilon = 1e-5);
    }

    #[test]
    fn test_polish_reduces_error_of_perturbed_pose() {
        let truth = Pose::from_rotation_vector(
            Vector3::new(0.15, 0.1, -0.05),
            Vector3::new(-3.0, -2.0, 11.0),
        );
        let (intrinsics, _, view) = setup(&truth);
        let perturbed = Pose::from_rotation_vector(
            truth.rotation_vector() + Vector3::new(0.01, -0.01, 0.005),
            truth.translation + Vector3::new(0.1, -0.05, 0.2),
        );
        let before = pinhole_error(&intrinsics, &perturbed, &view);
        let polished = polish_pose(&intrinsics, &view, &perturbed, 0);
        let after = pinhole_error(&intrinsics, &polished, &view);
        assert!(after <= before);
        assert!(after < 1e-2, "error after polish {after}");
    }

    #[test]
    fn test_rotate_matches_quaternion() {
        let omega = Vector3::new(0.3, -0.2, 0.5);
        let p = Vector3::new(1.0, 2.0, -0.5);
        let expected = UnitQuaternion::from_scaled_axis(omega) * p;
        let out = rotate(&[omega.x, omega.y, omega.z], &[p.x, p.y, p.z]);
        assert_relative_eq!(Vector3::from(out), expected, epsilon = 1e-12);
    }
}
