//! Lens Calibration Library
//!
//! Planar-target camera calibration and fast lens undistortion in Rust.
//! The library covers the full path from raw chessboard images to
//! undistorted output:
//! - Chessboard inner-corner detection with subpixel refinement ([`detection`])
//! - PlumbBob (radial-tangential) and FishEye (equidistant) distortion models
//!   behind one closed enum ([`camera`])
//! - Zhang initialization and a joint Levenberg-Marquardt refinement of
//!   intrinsics, distortion and poses ([`optimization`])
//! - Undistortion maps and nearest/bilinear remapping for 8-bit, 16-bit and
//!   float images ([`undistort`])
//!
//! Per-view pose initialization is polished with the tiny-solver optimization
//! framework; heavy per-image and per-row work runs on rayon.

pub mod camera;
pub mod cancel;
pub mod detection;
pub mod geometry;
pub mod optimization;
pub mod pipeline;
pub mod undistort;
pub mod util;

// Re-export commonly used types
pub use camera::{
    CalibrationArtifact, CameraModel, CameraModelError, Distortion, DistortionKind, FishEye,
    Intrinsics, PlumbBob, Pose, Resolution,
};
pub use cancel::CancelFlag;
pub use detection::{find_pattern_corners, DetectionError, DetectorConfig};
pub use geometry::{pattern_object_points, PatternSize};
pub use optimization::{
    calibrate, calibrate_with_cancel, CalibrationError, CalibrationResult, SolverConfig,
    TerminationCriteria, View,
};
pub use pipeline::{calibrate_images, CalibrationConfig, LabeledImage};
pub use undistort::{remap, remap_default, IndexMap, Interpolation, UndistortError, UndistortionMap};
