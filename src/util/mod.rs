//! Reprojection statistics, image comparison and report export.

use crate::camera::{CameraModel, CameraModelError, Pose};
use crate::optimization::{CalibrationResult, View};
use crate::undistort::Sample;
use image::{ImageBuffer, Pixel, Primitive};
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

pub mod synthetic;

#[derive(thiserror::Error, Debug)]
pub enum UtilError {
    #[error("Numerical error in computation: {0}")]
    NumericalError(String),
    #[error("Zero projection points")]
    ZeroProjectionPoints,
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
    #[error("CSV error: {0}")]
    Csv(String),
}

#[derive(Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

impl ProjectionError {
    /// Summary statistics of per-point error norms.
    pub fn from_errors(errors: &[f64]) -> Result<Self, UtilError> {
        if errors.is_empty() {
            return Err(UtilError::ZeroProjectionPoints);
        }
        if errors.iter().any(|e| !e.is_finite()) {
            return Err(UtilError::NumericalError(
                "non-finite reprojection error".to_string(),
            ));
        }
        let n = errors.len() as f64;
        let mean = errors.iter().sum::<f64>() / n;
        let variance = errors.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let rmse = (errors.iter().map(|x| x * x).sum::<f64>() / n).sqrt();
        let min = errors.iter().copied().fold(f64::INFINITY, f64::min);
        let max = errors.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let mut sorted = errors.to_vec();
        sorted.sort_by(f64::total_cmp);
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        Ok(Self {
            rmse,
            min,
            max,
            mean,
            stddev: variance.sqrt(),
            median,
        })
    }
}

/// Reprojection error statistics of one view under `pose`. Points that
/// cannot be projected are skipped.
pub fn compute_reprojection_error(
    model: &CameraModel,
    pose: &Pose,
    view: &View,
) -> Result<ProjectionError, UtilError> {
    let errors: Vec<f64> = view
        .object_points
        .iter()
        .zip(&view.image_points)
        .filter_map(|(object, observed)| {
            model
                .project_with_pose(pose, object)
                .ok()
                .map(|p| (p - observed).norm())
        })
        .collect();
    ProjectionError::from_errors(&errors)
}

/// Peak signal-to-noise ratio in dB. Pixels that are all-zero in both images
/// (remap borders) are skipped; identical images give infinity.
///
/// # Arguments
///
/// * `img1` - First image
/// * `img2` - Second image, same dimensions as `img1`
///
/// # Returns
///
/// * `Result<f64, UtilError>` - PSNR value in dB
pub fn calculate_psnr<P>(
    img1: &ImageBuffer<P, Vec<P::Subpixel>>,
    img2: &ImageBuffer<P, Vec<P::Subpixel>>,
) -> Result<f64, UtilError>
where
    P: Pixel,
    P::Subpixel: Sample,
{
    if img1.dimensions() != img2.dimensions() {
        return Err(UtilError::InvalidParams(
            "Images must have the same dimensions".to_string(),
        ));
    }
    let max_value = Sample::to_f32(<P::Subpixel as Primitive>::DEFAULT_MAX_VALUE) as f64;

    let mut squared_error = 0.0;
    let mut samples = 0usize;
    for (a, b) in img1.pixels().zip(img2.pixels()) {
        let (a, b) = (a.channels(), b.channels());
        let blank = |c: &[P::Subpixel]| c.iter().all(|v| Sample::to_f32(*v) == 0.0);
        if blank(a) && blank(b) {
            continue;
        }
        for (x, y) in a.iter().zip(b) {
            let diff = (Sample::to_f32(*x) - Sample::to_f32(*y)) as f64;
            squared_error += diff * diff;
        }
        samples += a.len();
    }

    if samples == 0 {
        return Ok(f64::INFINITY);
    }
    let mse = squared_error / samples as f64;
    if mse <= 1e-10 {
        Ok(f64::INFINITY)
    } else {
        Ok(10.0 * (max_value * max_value / mse).log10())
    }
}

/// One CSV line of the per-view calibration report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewReportRow {
    pub label: String,
    pub points: usize,
    pub mean_error: f64,
    pub rms_error: f64,
    pub max_error: f64,
    pub rotation_x: f64,
    pub rotation_y: f64,
    pub rotation_z: f64,
    pub translation_x: f64,
    pub translation_y: f64,
    pub translation_z: f64,
}

/// Report rows of a calibration, one per view; `labels` defaults to the view
/// index when shorter than `views`.
pub fn view_report(
    result: &CalibrationResult,
    views: &[View],
    labels: &[String],
) -> Result<Vec<ViewReportRow>, UtilError> {
    if views.len() != result.poses.len() {
        return Err(UtilError::InvalidParams(format!(
            "{} views but {} calibrated poses",
            views.len(),
            result.poses.len()
        )));
    }
    let model = result.camera_model();
    views
        .iter()
        .zip(&result.poses)
        .enumerate()
        .map(|(index, (view, pose))| {
            let stats = compute_reprojection_error(&model, pose, view)?;
            let rvec = pose.rotation_vector();
            Ok(ViewReportRow {
                label: labels.get(index).cloned().unwrap_or_else(|| index.to_string()),
                points: view.len(),
                mean_error: stats.mean,
                rms_error: stats.rmse,
                max_error: stats.max,
                rotation_x: rvec.x,
                rotation_y: rvec.y,
                rotation_z: rvec.z,
                translation_x: pose.translation.x,
                translation_y: pose.translation.y,
                translation_z: pose.translation.z,
            })
        })
        .collect()
}

/// Writes report rows with a header line, creating the parent directory.
pub fn write_view_report_csv<P: AsRef<Path>>(
    path: P,
    rows: &[ViewReportRow],
) -> Result<(), UtilError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    info!("Wrote {} view report rows to {}", rows.len(), path.display());
    Ok(())
}

impl From<std::io::Error> for UtilError {
    fn from(err: std::io::Error) -> Self {
        UtilError::NumericalError(err.to_string())
    }
}

impl From<CameraModelError> for UtilError {
    fn from(err: CameraModelError) -> Self {
        UtilError::NumericalError(err.to_string())
    }
}

impl From<csv::Error> for UtilError {
    fn from(err: csv::Error) -> Self {
        UtilError::Csv(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Distortion, Intrinsics};
    use crate::optimization::SolveReport;
    use approx::assert_relative_eq;
    use image::{GrayImage, Luma};
    use nalgebra::{Point2, Point3, Vector3};

    #[test]
    fn test_projection_error_statistics() {
        let stats = ProjectionError::from_errors(&[1.0, 3.0, 2.0, 4.0]).unwrap();
        assert_relative_eq!(stats.mean, 2.5);
        assert_relative_eq!(stats.median, 2.5);
        assert_relative_eq!(stats.min, 1.0);
        assert_relative_eq!(stats.max, 4.0);
        assert_relative_eq!(stats.rmse, (30.0f64 / 4.0).sqrt());
        assert_relative_eq!(stats.stddev, 1.25f64.sqrt());
        assert!(matches!(
            ProjectionError::from_errors(&[]),
            Err(UtilError::ZeroProjectionPoints)
        ));
    }

    #[test]
    fn test_psnr() {
        let a = GrayImage::from_fn(8, 8, |x, _| Luma([100 + x as u8]));
        assert_eq!(calculate_psnr(&a, &a).unwrap(), f64::INFINITY);

        let mut b = a.clone();
        b.pixels_mut().for_each(|p| p[0] += 1);
        assert_relative_eq!(
            calculate_psnr(&a, &b).unwrap(),
            20.0 * 255f64.log10(),
            epsilon = 1e-9
        );
        assert!(calculate_psnr(&a, &GrayImage::new(4, 4)).is_err());
    }

    fn one_view_result() -> (CalibrationResult, View) {
        let intrinsics = Intrinsics::new(500.0, 500.0, 320.0, 240.0, 0.0);
        let pose = Pose::from_rotation_vector(Vector3::new(0.1, 0.0, 0.0), Vector3::new(0.0, 0.0, 5.0));
        let model = CameraModel::new(intrinsics, Distortion::default());
        let object = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(1.0, 1.0, 0.0),
        ];
        let image: Vec<Point2<f64>> = object
            .iter()
            .map(|p| model.project_with_pose(&pose, p).unwrap() + nalgebra::Vector2::new(0.3, 0.4))
            .collect();
        let result = CalibrationResult {
            intrinsics,
            distortion: Distortion::default(),
            poses: vec![pose],
            rms_error: 0.5,
            per_view_errors: vec![0.5],
            report: SolveReport {
                iterations: 1,
                initial_cost: 1.0,
                final_cost: 1.0,
                converged: true,
            },
        };
        (result, View::new(object, image))
    }

    #[test]
    fn test_view_report_and_csv() {
        let (result, view) = one_view_result();
        let rows = view_report(&result, &[view], &["left.png".to_string()]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].label, "left.png");
        assert_relative_eq!(rows[0].mean_error, 0.5, epsilon = 1e-9);
        assert_relative_eq!(rows[0].translation_z, 5.0);

        let dir = std::env::temp_dir().join("lenscal_util_report_test");
        let path = dir.join("views.csv");
        write_view_report_csv(&path, &rows).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert!(lines.next().unwrap().starts_with("label,points,mean_error"));
        assert!(lines.next().unwrap().starts_with("left.png,4,"));
        fs::remove_dir_all(dir).unwrap();
    }
}
