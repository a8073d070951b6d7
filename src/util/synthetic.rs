//! Rendering of synthetic chessboard images with a known camera and pose.
//!
//! Each pixel is supersampled: the sample ray is unprojected through the
//! camera model and intersected with the board plane, so lens distortion and
//! perspective are rendered exactly. Used to test detection and calibration
//! end to end.

use crate::camera::{CameraModel, Pose, Resolution};
use crate::geometry::PatternSize;
use image::GrayImage;
use nalgebra::{Point2, Vector3};
use rayon::prelude::*;

pub const BLACK: f64 = 25.0;
pub const WHITE: f64 = 230.0;

/// Intensity of the board (or the white background) seen along `ray`.
fn shade(pose: &Pose, ray: &Vector3<f64>, size: PatternSize, square_size: f64) -> f64 {
    // pixels with no ray through the lens see background
    if !ray.iter().all(|v| v.is_finite()) {
        return WHITE;
    }
    let normal = pose.rotation * Vector3::z();
    let denom = normal.dot(ray);
    if denom.abs() < 1e-12 {
        return WHITE;
    }
    let s = normal.dot(&pose.translation) / denom;
    if s <= 0.0 {
        return WHITE;
    }
    let on_board = pose.rotation.inverse() * (ray * s - pose.translation);
    let ix = (on_board.x / square_size).floor() as i64;
    let iy = (on_board.y / square_size).floor() as i64;
    let inside = (-1..size.corners_x as i64).contains(&ix) && (-1..size.corners_y as i64).contains(&iy);
    if inside && (ix + iy).rem_euclid(2) == 0 {
        BLACK
    } else {
        WHITE
    }
}

/// Renders the chessboard with `size` inner corners and squares of
/// `square_size`, placed by `pose` in front of `model`. Inner corner `(i, j)`
/// sits at pattern coordinates `(i, j) * square_size`, matching
/// [`crate::geometry::pattern_object_points`].
pub fn render_chessboard(
    model: &CameraModel,
    pose: &Pose,
    size: PatternSize,
    square_size: f64,
    resolution: Resolution,
    supersample: u32,
) -> GrayImage {
    let mut image = GrayImage::new(resolution.width, resolution.height);
    let width = resolution.width as usize;
    if width == 0 || resolution.height == 0 {
        return image;
    }
    let samples = supersample.max(1);
    let inv = 1.0 / samples as f64;
    image.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
        for (x, pixel) in row.iter_mut().enumerate() {
            let mut total = 0.0;
            for sy in 0..samples {
                for sx in 0..samples {
                    let px = x as f64 + (sx as f64 + 0.5) * inv - 0.5;
                    let py = y as f64 + (sy as f64 + 0.5) * inv - 0.5;
                    let ray = model.unproject(&Point2::new(px, py)).coords;
                    total += shade(pose, &ray, size, square_size);
                }
            }
            *pixel = (total * inv * inv).round().clamp(0.0, 255.0) as u8;
        }
    });
    image
}
