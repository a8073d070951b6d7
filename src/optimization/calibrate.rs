//! Joint refinement of intrinsics, distortion and poses, and the public
//! calibration entry points.
//!
//! The parameter vector is laid out as
//!
//! ```text
//! [fx, fy, cx, cy, (skew), free distortion coefficients..., (ω, t) per view]
//! ```
//!
//! Skew and the coefficients held fixed by [`SolverConfig`] are left out, so
//! every remaining column of the Jacobian is observable on well-posed input.
//! Rotations are updated on the manifold as `R <- exp(δω) R`.

use crate::camera::{validation, CameraModel, Distortion, DistortionKind, Intrinsics, Pose};
use crate::cancel::CancelFlag;
use crate::geometry::{find_homography, skew_symmetric};
use crate::optimization::extrinsics::initial_poses;
use crate::optimization::lm::{self, LeastSquaresProblem, LmError, LmFailure, NormalEquations};
use crate::optimization::zhang::estimate_intrinsics;
use crate::optimization::{CalibrationError, CalibrationResult, SolveReport, SolverConfig, View};
use log::{debug, info};
use nalgebra::{
    DMatrix, DVector, Matrix2, Matrix2x3, Matrix2xX, Matrix3, Matrix3x6, Point2, UnitQuaternion,
    Vector3,
};
use rayon::prelude::*;

/// Current estimate of every calibrated quantity.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationParams {
    pub intrinsics: Intrinsics,
    pub distortion: Distortion,
    pub poses: Vec<Pose>,
}

/// Which parameters are free in the joint refinement.
#[derive(Debug, Clone)]
struct ParamLayout {
    estimate_skew: bool,
    /// Indices into [`Distortion::coefficients`] that are optimized.
    free_coefficients: Vec<usize>,
}

impl ParamLayout {
    fn new(config: &SolverConfig) -> Self {
        let free_coefficients = match config.distortion_kind {
            DistortionKind::PlumbBob => (0..5)
                .filter(|&i| !(config.zero_tangent_dist && (i == 2 || i == 3)))
                .filter(|&i| !(config.fix_k3 && i == 4))
                .collect(),
            DistortionKind::FishEye => (0..4).collect(),
        };
        Self {
            estimate_skew: !config.fix_skew,
            free_coefficients,
        }
    }

    fn num_intrinsics(&self) -> usize {
        if self.estimate_skew {
            5
        } else {
            4
        }
    }

    /// Parameters shared by all views.
    fn num_shared(&self) -> usize {
        self.num_intrinsics() + self.free_coefficients.len()
    }
}

/// Squared residuals and normal-equation block of one view over the shared
/// parameters followed by the view's own six pose parameters.
struct ViewBlock {
    jtj: DMatrix<f64>,
    jtr: DVector<f64>,
    cost: f64,
}

struct CalibrationProblem<'a> {
    views: &'a [View],
    layout: ParamLayout,
}

impl<'a> CalibrationProblem<'a> {
    fn new(views: &'a [View], config: &SolverConfig) -> Self {
        Self {
            views,
            layout: ParamLayout::new(config),
        }
    }

    fn num_points(&self) -> usize {
        self.views.iter().map(View::len).sum()
    }

    fn view_block(&self, params: &CalibrationParams, view: &View, pose: &Pose) -> Option<ViewBlock> {
        let k = &params.intrinsics;
        let shared = self.layout.num_shared();
        let m = shared + 6;
        let mut block = ViewBlock {
            jtj: DMatrix::zeros(m, m),
            jtr: DVector::zeros(m),
            cost: 0.0,
        };
        let pixel_jacobian = Matrix2::new(k.fx, k.skew, 0.0, k.fy);
        let mut row = Matrix2xX::<f64>::zeros(m);

        for (object, observed) in view.object_points.iter().zip(&view.image_points) {
            let rotated = pose.rotation * object.coords;
            let camera = rotated + pose.translation;
            if camera.z <= f64::EPSILON {
                return None;
            }
            let inv_z = 1.0 / camera.z;
            let normalized = Point2::new(camera.x * inv_z, camera.y * inv_z);
            let distorted = params.distortion.distort(&normalized);
            let residual = k.normalized_to_pixel(&distorted) - observed;

            row.fill(0.0);
            let d = &distorted;
            row[(0, 0)] = d.x;
            row[(1, 1)] = d.y;
            row[(0, 2)] = 1.0;
            row[(1, 3)] = 1.0;
            if self.layout.estimate_skew {
                row[(0, 4)] = d.y;
            }

            let coefficient_jacobian =
                pixel_jacobian * params.distortion.coefficient_jacobian(&normalized);
            let offset = self.layout.num_intrinsics();
            for (col, &idx) in self.layout.free_coefficients.iter().enumerate() {
                row.set_column(offset + col, &coefficient_jacobian.column(idx));
            }

            let projection = Matrix2x3::new(
                inv_z, 0.0, -camera.x * inv_z * inv_z, //
                0.0, inv_z, -camera.y * inv_z * inv_z,
            );
            let mut transform = Matrix3x6::<f64>::zeros();
            transform
                .fixed_view_mut::<3, 3>(0, 0)
                .copy_from(&(-skew_symmetric(&rotated)));
            transform
                .fixed_view_mut::<3, 3>(0, 3)
                .copy_from(&Matrix3::identity());
            let pose_jacobian = pixel_jacobian
                * params.distortion.point_jacobian(&normalized)
                * projection
                * transform;
            row.fixed_view_mut::<2, 6>(0, shared).copy_from(&pose_jacobian);

            block.jtj += row.transpose() * &row;
            block.jtr += row.transpose() * residual;
            block.cost += residual.norm_squared();
        }
        Some(block)
    }

    /// Per-point reprojection error norms of one view, `None` when a point
    /// falls behind the camera.
    fn view_errors(params: &CalibrationParams, view: &View, pose: &Pose) -> Option<Vec<f64>> {
        let model = CameraModel::new(params.intrinsics, params.distortion);
        view.object_points
            .iter()
            .zip(&view.image_points)
            .map(|(object, observed)| {
                model
                    .project_with_pose(pose, object)
                    .ok()
                    .map(|p| (p - observed).norm())
            })
            .collect()
    }
}

impl LeastSquaresProblem for CalibrationProblem<'_> {
    type Params = CalibrationParams;

    fn num_params(&self) -> usize {
        self.layout.num_shared() + 6 * self.views.len()
    }

    fn cost(&self, params: &CalibrationParams) -> Result<f64, LmError> {
        let cost = self
            .views
            .par_iter()
            .zip(params.poses.par_iter())
            .map(|(view, pose)| {
                Self::view_errors(params, view, pose)
                    .map(|errors| errors.iter().map(|e| e * e).sum::<f64>())
                    .unwrap_or(f64::INFINITY)
            })
            .sum::<f64>();
        Ok(if cost.is_nan() { f64::INFINITY } else { cost })
    }

    fn normal_equations(&self, params: &CalibrationParams) -> Result<NormalEquations, LmError> {
        let blocks: Vec<ViewBlock> = self
            .views
            .par_iter()
            .zip(params.poses.par_iter())
            .enumerate()
            .map(|(index, (view, pose))| {
                self.view_block(params, view, pose).ok_or_else(|| {
                    LmError::NonFinite(format!("view {index} has points behind the camera"))
                })
            })
            .collect::<Result<_, _>>()?;

        let shared = self.layout.num_shared();
        let mut normal = NormalEquations::zeros(self.num_params());
        for (index, block) in blocks.iter().enumerate() {
            let base = shared + 6 * index;
            let global = |local: usize| if local < shared { local } else { base + local - shared };
            let m = block.jtr.len();
            for i in 0..m {
                normal.jtr[global(i)] += block.jtr[i];
                for j in 0..m {
                    normal.jtj[(global(i), global(j))] += block.jtj[(i, j)];
                }
            }
            normal.cost += block.cost;
        }
        Ok(normal)
    }

    fn retract(&self, params: &CalibrationParams, delta: &DVector<f64>) -> CalibrationParams {
        let mut intrinsics = params.intrinsics;
        intrinsics.fx += delta[0];
        intrinsics.fy += delta[1];
        intrinsics.cx += delta[2];
        intrinsics.cy += delta[3];
        if self.layout.estimate_skew {
            intrinsics.skew += delta[4];
        }

        let offset = self.layout.num_intrinsics();
        let mut coefficients = params.distortion.coefficients();
        for (col, &idx) in self.layout.free_coefficients.iter().enumerate() {
            coefficients[idx] += delta[offset + col];
        }
        let distortion = Distortion::from_coefficients(params.distortion.kind(), &coefficients)
            .unwrap_or(params.distortion);

        let shared = self.layout.num_shared();
        let poses = params
            .poses
            .iter()
            .enumerate()
            .map(|(index, pose)| {
                let base = shared + 6 * index;
                let omega = Vector3::new(delta[base], delta[base + 1], delta[base + 2]);
                let dt = Vector3::new(delta[base + 3], delta[base + 4], delta[base + 5]);
                Pose::new(
                    UnitQuaternion::from_scaled_axis(omega) * pose.rotation,
                    pose.translation + dt,
                )
            })
            .collect();

        CalibrationParams {
            intrinsics,
            distortion,
            poses,
        }
    }

    fn param_norm(&self, params: &CalibrationParams) -> f64 {
        let k = &params.intrinsics;
        let intrinsics = k.fx * k.fx + k.fy * k.fy + k.cx * k.cx + k.cy * k.cy + k.skew * k.skew;
        let distortion: f64 = params.distortion.coefficients().iter().map(|c| c * c).sum();
        let poses: f64 = params
            .poses
            .iter()
            .map(|p| p.rotation_vector().norm_squared() + p.translation.norm_squared())
            .sum();
        (intrinsics + distortion + poses).sqrt()
    }
}

fn rms(cost: f64, num_points: usize) -> f64 {
    (cost / num_points.max(1) as f64).sqrt()
}

/// Placeholder intrinsics reported when no estimate was ever formed.
fn no_estimate() -> Intrinsics {
    Intrinsics::new(f64::NAN, f64::NAN, f64::NAN, f64::NAN, f64::NAN)
}

/// Calibrates a camera from planar views. See [`calibrate_with_cancel`].
///
/// # Arguments
///
/// * `views` - Detected pattern views, one per image
/// * `config` - Solver flags, tolerances and iteration budget
///
/// # Returns
///
/// * `Result<CalibrationResult, CalibrationError>` - Refined camera model,
///   per-view poses and reprojection statistics
pub fn calibrate(views: &[View], config: &SolverConfig) -> Result<CalibrationResult, CalibrationError> {
    calibrate_with_cancel(views, config, &CancelFlag::new())
}

/// Linear initialization followed by the joint Levenberg-Marquardt refinement.
///
/// `cancel` is polled between solver iterations.
pub fn calibrate_with_cancel(
    views: &[View],
    config: &SolverConfig,
    cancel: &CancelFlag,
) -> Result<CalibrationResult, CalibrationError> {
    let required = config.required_views();
    if views.len() < required {
        return Err(CalibrationError::InsufficientViews {
            required,
            found: views.len(),
            rejected: Vec::new(),
        });
    }
    for (index, view) in views.iter().enumerate() {
        view.validate(index)?;
    }

    let homographies = views
        .iter()
        .enumerate()
        .map(|(index, view)| {
            let plane: Vec<Point2<f64>> = view
                .object_points
                .iter()
                .map(|p| Point2::new(p.x, p.y))
                .collect();
            find_homography(&plane, &view.image_points)
                .map_err(|e| CalibrationError::InvalidParams(format!("view {index}: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let zero_distortion = Distortion::zero(config.distortion_kind);
    let diverged = |reason: String, intrinsics: Intrinsics, rms: f64| {
        CalibrationError::NumericalDivergence {
            reason,
            last_intrinsics: intrinsics,
            last_distortion: zero_distortion,
            last_rms: rms,
        }
    };

    let intrinsics = estimate_intrinsics(&homographies, views, config.fix_skew)
        .map_err(|e| diverged(e.to_string(), no_estimate(), f64::INFINITY))?;
    info!(
        "Initial intrinsics: fx {:.3}, fy {:.3}, cx {:.3}, cy {:.3}",
        intrinsics.fx, intrinsics.fy, intrinsics.cx, intrinsics.cy
    );
    if cancel.is_cancelled() {
        return Err(CalibrationError::Cancelled);
    }

    let poses = initial_poses(&intrinsics, &homographies, views, config.polish_poses).map_err(
        |index| {
            diverged(
                format!("pose of view {index} cannot be recovered from its homography"),
                intrinsics,
                f64::INFINITY,
            )
        },
    )?;

    let problem = CalibrationProblem::new(views, config);
    let num_points = problem.num_points();
    let initial = CalibrationParams {
        intrinsics,
        distortion: zero_distortion,
        poses,
    };
    debug!(
        "Joint refinement over {} parameters and {} points",
        problem.num_params(),
        num_points
    );

    let outcome = lm::minimize(&problem, initial, &config.criteria, Some(cancel)).map_err(
        |failure: Box<LmFailure<CalibrationParams>>| {
            let LmFailure { error, state } = *failure;
            match error {
                LmError::Cancelled => CalibrationError::Cancelled,
                error => CalibrationError::NumericalDivergence {
                    reason: error.to_string(),
                    last_intrinsics: state.params.intrinsics,
                    last_distortion: state.params.distortion,
                    last_rms: rms(state.cost, num_points),
                },
            }
        },
    )?;

    let params = outcome.state.params;
    let final_rms = rms(outcome.state.cost, num_points);
    if validation::validate_intrinsics(&params.intrinsics).is_err() {
        return Err(CalibrationError::NumericalDivergence {
            reason: "refined intrinsics are not physical".to_string(),
            last_intrinsics: params.intrinsics,
            last_distortion: params.distortion,
            last_rms: final_rms,
        });
    }

    let per_view_errors = views
        .iter()
        .zip(&params.poses)
        .map(|(view, pose)| {
            CalibrationProblem::view_errors(&params, view, pose)
                .map(|errors| errors.iter().sum::<f64>() / errors.len().max(1) as f64)
                .unwrap_or(f64::INFINITY)
        })
        .collect();

    info!(
        "Calibration finished after {} iterations: RMS {:.4} px ({})",
        outcome.state.iteration,
        final_rms,
        if outcome.converged { "converged" } else { "iteration limit" }
    );

    Ok(CalibrationResult {
        intrinsics: params.intrinsics,
        distortion: params.distortion,
        poses: params.poses,
        rms_error: final_rms,
        per_view_errors,
        report: SolveReport {
            iterations: outcome.state.iteration,
            initial_cost: outcome.initial_cost,
            final_cost: outcome.state.cost,
            converged: outcome.converged,
        },
    })
}
