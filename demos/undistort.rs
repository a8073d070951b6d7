//! Undistortion Example
//!
//! Loads a calibration artifact, builds the undistortion map once and
//! remaps an image with nearest, bilinear and index-table lookups, timing
//! each one.
//!
//! Usage:
//! ```bash
//! cargo run --release --example undistort -- \
//!   --calibration output/camera.yaml \
//!   --image data/frame.png \
//!   --output-dir output
//! ```

use clap::Parser;
use flexi_logger::{colored_detailed_format, detailed_format, Duplicate, FileSpec, Logger};
use lenscal::camera::{CalibrationArtifact, Resolution};
use lenscal::undistort::{remap_default, remap_indexed, IndexMap, Interpolation, UndistortionMap};
use log::info;
use std::path::PathBuf;
use std::time::Instant;

/// Lens undistortion with a precomputed map
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Calibration artifact (.yaml or .json)
    #[arg(short = 'c', long)]
    calibration: PathBuf,

    /// Image to undistort
    #[arg(short = 'i', long)]
    image: PathBuf,

    /// Directory receiving the undistorted images
    #[arg(short = 'o', long, default_value = "output")]
    output_dir: PathBuf,

    /// Remap iterations used for timing
    #[arg(short = 'n', long, default_value_t = 10)]
    iterations: u32,
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
    let artifact = CalibrationArtifact::load(&cli.calibration)?;
    let image = image::open(&cli.image)?.to_rgb8();
    let resolution = Resolution::new(image.width(), image.height());
    info!(
        "Undistorting {:?} ({}x{})",
        cli.image, resolution.width, resolution.height
    );

    let start = Instant::now();
    let map = UndistortionMap::build(
        &artifact.intrinsics(),
        &artifact.distortion,
        None,
        resolution,
    )?;
    info!("Map built in {:?}", start.elapsed());

    let start = Instant::now();
    let index = IndexMap::from_map(&map, resolution)?;
    info!(
        "Index map with {} pixels built in {:?}",
        index.pairs.len(),
        start.elapsed()
    );

    let iterations = cli.iterations.max(1);
    std::fs::create_dir_all(&cli.output_dir)?;

    for (name, interpolation) in [
        ("nearest", Interpolation::Nearest),
        ("bilinear", Interpolation::Bilinear),
    ] {
        let start = Instant::now();
        let mut output = remap_default(&image, &map, interpolation);
        for _ in 1..iterations {
            output = remap_default(&image, &map, interpolation);
        }
        info!(
            "{name}: {:?} per image",
            start.elapsed() / iterations
        );
        output.save(cli.output_dir.join(format!("undistorted_{name}.png")))?;
    }

    let start = Instant::now();
    let mut output = remap_indexed(&image, &index, image::Rgb([0, 0, 0]))?;
    for _ in 1..iterations {
        output = remap_indexed(&image, &index, image::Rgb([0, 0, 0]))?;
    }
    info!("indexed: {:?} per image", start.elapsed() / iterations);
    output.save(cli.output_dir.join("undistorted_indexed.png"))?;
    Ok(())
}
