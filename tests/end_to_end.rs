use approx::assert_relative_eq;
use lenscal::camera::{CameraModel, Distortion, Intrinsics, PlumbBob, Pose, Resolution};
use lenscal::pipeline::{calibrate_images, CalibrationConfig, LabeledImage};
use lenscal::undistort::{remap_default, Interpolation, UndistortionMap};
use lenscal::util::calculate_psnr;
use lenscal::util::synthetic::render_chessboard;
use lenscal::{CancelFlag, PatternSize};
use nalgebra::Vector3;

const RESOLUTION: Resolution = Resolution {
    width: 640,
    height: 480,
};

fn intrinsics() -> Intrinsics {
    Intrinsics::new(600.0, 600.0, 320.0, 240.0, 0.0)
}

fn lens() -> CameraModel {
    CameraModel::new(
        intrinsics(),
        Distortion::PlumbBob(PlumbBob::new(-0.05, 0.01, 0.0, 0.0, 0.0)),
    )
}

fn poses() -> Vec<Pose> {
    [
        (Vector3::new(0.25, 0.00, 0.02), Vector3::new(-3.0, -2.0, 14.0)),
        (Vector3::new(0.00, 0.30, -0.05), Vector3::new(-3.5, -2.5, 13.0)),
        (Vector3::new(-0.20, -0.15, 0.05), Vector3::new(-2.5, -1.5, 15.0)),
        (Vector3::new(0.10, -0.25, 0.10), Vector3::new(-3.0, -2.0, 13.5)),
        (Vector3::new(-0.15, 0.20, -0.10), Vector3::new(-3.5, -2.0, 14.5)),
    ]
    .into_iter()
    .map(|(r, t)| Pose::from_rotation_vector(r, t))
    .collect()
}

#[test]
fn calibrates_rendered_boards_and_undistorts() {
    let _ = env_logger::builder().is_test(true).try_init();
    let pattern = PatternSize::new(7, 5);
    let model = lens();

    let images: Vec<LabeledImage> = poses()
        .iter()
        .enumerate()
        .map(|(i, pose)| {
            let image = render_chessboard(&model, pose, pattern, 1.0, RESOLUTION, 4);
            LabeledImage::new(format!("board_{i}.png"), image)
        })
        .collect();

    let config = CalibrationConfig {
        pattern,
        ..CalibrationConfig::default()
    };
    let (result, detections) = calibrate_images(&images, &config, &CancelFlag::new()).unwrap();
    assert_eq!(detections.summary(), "5 of 5 views detected");
    assert_relative_eq!(result.intrinsics.fx, 600.0, max_relative = 0.01);
    assert_relative_eq!(result.intrinsics.fy, 600.0, max_relative = 0.01);
    assert!((result.intrinsics.cx - 320.0).abs() < 5.0);
    assert!((result.intrinsics.cy - 240.0).abs() < 5.0);
    assert!(result.rms_error < 0.5, "rms {}", result.rms_error);
    assert_eq!(result.per_view_errors.len(), 5);

    // undistorting the captured board should approach the ideal pinhole render
    let pinhole = CameraModel::new(intrinsics(), Distortion::default());
    let pose = &poses()[0];
    let ideal = render_chessboard(&pinhole, pose, pattern, 1.0, RESOLUTION, 4);
    let map = UndistortionMap::build(&result.intrinsics, &result.distortion, Some(&intrinsics()), RESOLUTION)
        .unwrap();
    let undistorted = remap_default(&images[0].image, &map, Interpolation::Bilinear);

    let before = calculate_psnr(&images[0].image, &ideal).unwrap();
    let after = calculate_psnr(&undistorted, &ideal).unwrap();
    assert!(after > before, "psnr {after} <= {before}");
    assert!(after > 18.0, "psnr {after}");
}
