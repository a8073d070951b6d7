//! Calibrating a whole image set: parallel corner detection followed by the
//! solver on the views that survived.

use crate::cancel::CancelFlag;
use crate::detection::{find_pattern_corners, DetectorConfig};
use crate::geometry::{pattern_object_points, PatternSize};
use crate::optimization::{
    calibrate_with_cancel, CalibrationError, CalibrationResult, RejectedView, SolverConfig, View,
};
use image::GrayImage;
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Everything needed to calibrate from raw images.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub pattern: PatternSize,
    /// Side of one chessboard square, in the unit of the reported translations.
    pub square_size: f64,
    pub detector: DetectorConfig,
    pub solver: SolverConfig,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            pattern: PatternSize::new(9, 6),
            square_size: 1.0,
            detector: DetectorConfig::default(),
            solver: SolverConfig::default(),
        }
    }
}

/// A grayscale image with the label used in reports (usually its file name).
#[derive(Debug, Clone)]
pub struct LabeledImage {
    pub label: String,
    pub image: GrayImage,
}

impl LabeledImage {
    pub fn new(label: impl Into<String>, image: GrayImage) -> Self {
        Self {
            label: label.into(),
            image,
        }
    }
}

/// Outcome of detecting the pattern on every image.
#[derive(Debug, Clone)]
pub struct DetectionReport {
    /// Views in input order of the images they came from.
    pub views: Vec<View>,
    /// Labels of the images behind `views`.
    pub labels: Vec<String>,
    pub rejected: Vec<RejectedView>,
    pub total: usize,
}

impl DetectionReport {
    pub fn summary(&self) -> String {
        format!("{} of {} views detected", self.views.len(), self.total)
    }
}

/// Detects the pattern on all images in parallel.
pub fn detect_views(images: &[LabeledImage], config: &CalibrationConfig) -> DetectionReport {
    let object_points = pattern_object_points(config.pattern, config.square_size);
    let outcomes: Vec<_> = images
        .par_iter()
        .map(|labeled| {
            find_pattern_corners(&labeled.image, config.pattern, &config.detector)
                .map(|corners| View::new(object_points.clone(), corners))
                .map_err(|e| RejectedView {
                    label: labeled.label.clone(),
                    reason: e.to_string(),
                })
        })
        .collect();

    let mut report = DetectionReport {
        views: Vec::new(),
        labels: Vec::new(),
        rejected: Vec::new(),
        total: images.len(),
    };
    for (labeled, outcome) in images.iter().zip(outcomes) {
        match outcome {
            Ok(view) => {
                report.views.push(view);
                report.labels.push(labeled.label.clone());
            }
            Err(rejected) => {
                warn!("Rejected {rejected}");
                report.rejected.push(rejected);
            }
        }
    }
    info!("{}", report.summary());
    report
}

/// Detects, then calibrates. When too few views survive, the error lists
/// every rejected image with its reason.
pub fn calibrate_images(
    images: &[LabeledImage],
    config: &CalibrationConfig,
    cancel: &CancelFlag,
) -> Result<(CalibrationResult, DetectionReport), CalibrationError> {
    if !(config.square_size > 0.0) {
        return Err(CalibrationError::InvalidParams(format!(
            "square_size must be positive, got {}",
            config.square_size
        )));
    }
    let report = detect_views(images, config);
    if cancel.is_cancelled() {
        return Err(CalibrationError::Cancelled);
    }
    let required = config.solver.required_views();
    if report.views.len() < required {
        return Err(CalibrationError::InsufficientViews {
            required,
            found: report.views.len(),
            rejected: report.rejected,
        });
    }
    let result = calibrate_with_cancel(&report.views, &config.solver, cancel)?;
    Ok((result, report))
}
