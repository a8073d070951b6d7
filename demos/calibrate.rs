//! Chessboard Calibration Example
//!
//! Detects the chessboard on every image of a directory, calibrates the
//! camera and writes the calibration artifact plus a per-view CSV report.
//!
//! Usage:
//! ```bash
//! cargo run --release --example calibrate -- \
//!   --images data/boards \
//!   --corners-x 9 --corners-y 6 \
//!   --square-size 0.025 \
//!   --model plumb_bob \
//!   --output output/camera.yaml
//! ```

use clap::Parser;
use flexi_logger::{colored_detailed_format, detailed_format, Duplicate, FileSpec, Logger};
use lenscal::pipeline::{calibrate_images, CalibrationConfig, LabeledImage};
use lenscal::util::{view_report, write_view_report_csv};
use lenscal::{CancelFlag, CalibrationError, DistortionKind, PatternSize};
use log::{error, info, warn};
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "tif"];

/// Camera calibration from chessboard images
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding the board images
    #[arg(short = 'i', long)]
    images: PathBuf,

    /// Inner corners along a board row
    #[arg(long, default_value_t = 9)]
    corners_x: usize,

    /// Inner corners along a board column
    #[arg(long, default_value_t = 6)]
    corners_y: usize,

    /// Side of one square, in the unit of the reported translations
    #[arg(short = 's', long, default_value_t = 1.0)]
    square_size: f64,

    /// Distortion model to fit: plumb_bob or fisheye
    #[arg(short = 'm', long, default_value = "plumb_bob")]
    model: String,

    /// Optional YAML file with a full calibration config; overrides the flags above
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Output artifact path (.yaml or .json)
    #[arg(short = 'o', long, default_value = "output/camera.yaml")]
    output: PathBuf,

    /// Per-view report path
    #[arg(short = 'r', long, default_value = "output/views.csv")]
    report: PathBuf,
}

fn build_config(cli: &Cli) -> Result<CalibrationConfig, Box<dyn std::error::Error>> {
    if let Some(path) = &cli.config {
        info!("Loading calibration config from {path:?}");
        let contents = std::fs::read_to_string(path)?;
        return Ok(serde_yaml::from_str(&contents)?);
    }
    let mut config = CalibrationConfig {
        pattern: PatternSize::new(cli.corners_x, cli.corners_y),
        square_size: cli.square_size,
        ..CalibrationConfig::default()
    };
    config.solver.distortion_kind = match cli.model.as_str() {
        "plumb_bob" => DistortionKind::PlumbBob,
        "fisheye" => DistortionKind::FishEye,
        other => {
            error!("Unsupported distortion model: {other}");
            return Err("Unsupported distortion model".into());
        }
    };
    Ok(config)
}

fn load_images(dir: &Path) -> Result<Vec<LabeledImage>, Box<dyn std::error::Error>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        })
        .collect();
    paths.sort();

    let mut images = Vec::with_capacity(paths.len());
    for path in paths {
        let label = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        match image::open(&path) {
            Ok(img) => images.push(LabeledImage::new(label, img.to_luma8())),
            Err(e) => warn!("Skipping {label}: {e}"),
        }
    }
    Ok(images)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    Logger::try_with_str("info")?
        .log_to_file(
            FileSpec::default()
                .directory("logs")
                .suppress_timestamp()
                .suffix("log"),
        )
        .duplicate_to_stdout(Duplicate::All)
        .format_for_files(detailed_format)
        .format_for_stdout(colored_detailed_format)
        .set_palette("196;208;76;39;178".to_string())
        .start()?;

    let cli = Cli::parse();
    info!("Image directory: {:?}", cli.images);

    let config = build_config(&cli)?;
    let images = load_images(&cli.images)?;
    info!("Loaded {} images", images.len());

    let cancel = CancelFlag::new();
    let (result, detections) = match calibrate_images(&images, &config, &cancel) {
        Ok(outcome) => outcome,
        Err(CalibrationError::InsufficientViews {
            required,
            found,
            rejected,
        }) => {
            error!("Only {found} usable views, {required} required");
            for view in &rejected {
                error!("  {view}");
            }
            return Err("Insufficient views".into());
        }
        Err(e) => {
            error!("Calibration failed: {e}");
            return Err(e.into());
        }
    };

    let k = &result.intrinsics;
    info!("{}", detections.summary());
    info!(
        "fx={:.3} fy={:.3} cx={:.3} cy={:.3} skew={:.4}",
        k.fx, k.fy, k.cx, k.cy, k.skew
    );
    info!("Distortion: {:?}", result.distortion.coefficients());
    info!(
        "RMS reprojection error: {:.4} px after {} iterations",
        result.rms_error, result.report.iterations
    );

    result.to_artifact().save(&cli.output)?;

    let rows = view_report(&result, &detections.views, &detections.labels)?;
    write_view_report_csv(&cli.report, &rows)?;
    Ok(())
}
