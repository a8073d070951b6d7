//! Saddle-point (X-junction) candidates from the Hessian of a smoothed image.
//!
//! At a chessboard inner corner the intensity surface is a saddle, so the
//! Hessian determinant is strongly negative there. The response
//! `Ixy^2 - Ixx Iyy` peaks at the junction and vanishes along straight edges.

use image::{GrayImage, ImageBuffer, Luma};
use nalgebra::Point2;
use rayon::prelude::*;
use std::f64::consts::TAU;

pub type FloatImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Samples taken on the verification ring.
const RING_SAMPLES: usize = 32;
/// Responses below this are numerical noise on intensities in `[0, 1]`.
const MIN_RESPONSE: f32 = 1e-7;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Saddle {
    pub position: Point2<f64>,
    pub response: f32,
}

/// Converts to floating point in `[0, 1]`.
pub fn to_float(image: &GrayImage) -> FloatImage {
    FloatImage::from_fn(image.width(), image.height(), |x, y| {
        Luma([image.get_pixel(x, y)[0] as f32 / 255.0])
    })
}

/// Saddle response of `image` after Gaussian smoothing with `sigma`.
pub fn saddle_response(image: &GrayImage, sigma: f32) -> FloatImage {
    let float = to_float(image);
    let smooth = if sigma > 0.0 {
        imageproc::filter::gaussian_blur_f32(&float, sigma)
    } else {
        float
    };

    let (width, height) = smooth.dimensions();
    let mut response = FloatImage::new(width, height);
    if width < 3 || height < 3 {
        return response;
    }
    let (w, h) = (width as usize, height as usize);
    let data = smooth.as_raw();

    response.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
        if y == 0 || y + 1 >= h {
            return;
        }
        let above = &data[(y - 1) * w..y * w];
        let center = &data[y * w..(y + 1) * w];
        let below = &data[(y + 1) * w..(y + 2) * w];
        for x in 1..w - 1 {
            let c = center[x];
            let ixx = center[x + 1] - 2.0 * c + center[x - 1];
            let iyy = below[x] - 2.0 * c + above[x];
            let ixy = (below[x + 1] - above[x + 1] - below[x - 1] + above[x - 1]) * 0.25;
            row[x] = (ixy * ixy - ixx * iyy).max(0.0);
        }
    });
    response
}

/// Local maxima of `response` above `relative_threshold` times the global
/// maximum, with a parabolic subpixel offset.
pub fn find_saddles(
    response: &FloatImage,
    nms_radius: u32,
    relative_threshold: f32,
) -> Vec<Saddle> {
    let max = response.as_raw().iter().copied().fold(0.0f32, f32::max);
    if max <= MIN_RESPONSE {
        return Vec::new();
    }
    let threshold = (relative_threshold * max).max(MIN_RESPONSE);
    let (w, h) = (response.width() as usize, response.height() as usize);
    let r = nms_radius.max(1) as usize;
    if w <= 2 * r || h <= 2 * r {
        return Vec::new();
    }
    let data = response.as_raw();
    let at = |x: usize, y: usize| data[y * w + x];

    (r..h - r)
        .into_par_iter()
        .flat_map_iter(|y| {
            let mut found = Vec::new();
            for x in r..w - r {
                let value = at(x, y);
                if value < threshold || !is_local_max(&at, x, y, r, value) {
                    continue;
                }
                let dx = parabolic_offset(at(x - 1, y), value, at(x + 1, y));
                let dy = parabolic_offset(at(x, y - 1), value, at(x, y + 1));
                found.push(Saddle {
                    position: Point2::new(x as f64 + dx, y as f64 + dy),
                    response: value,
                });
            }
            found
        })
        .collect()
}

/// Ties are broken in favour of the first pixel in scan order.
fn is_local_max(
    at: &impl Fn(usize, usize) -> f32,
    x: usize,
    y: usize,
    r: usize,
    value: f32,
) -> bool {
    for ny in y - r..=y + r {
        for nx in x - r..=x + r {
            if (nx, ny) == (x, y) {
                continue;
            }
            let other = at(nx, ny);
            let earlier = (ny, nx) < (y, x);
            if other > value || (earlier && other == value) {
                return false;
            }
        }
    }
    true
}

fn parabolic_offset(left: f32, center: f32, right: f32) -> f64 {
    let denom = left - 2.0 * center + right;
    if denom.abs() < f32::EPSILON {
        return 0.0;
    }
    (0.5 * (left - right) / denom).clamp(-0.5, 0.5) as f64
}

/// Checks that a circle of `radius` around `center` crosses exactly four
/// black/white boundaries in the binarized image.
pub fn is_x_junction(binary: &GrayImage, center: &Point2<f64>, radius: f32) -> bool {
    let (w, h) = binary.dimensions();
    let radius = radius as f64;
    let mut samples = [false; RING_SAMPLES];
    for (k, sample) in samples.iter_mut().enumerate() {
        let angle = TAU * k as f64 / RING_SAMPLES as f64;
        let x = (center.x + radius * angle.cos()).round();
        let y = (center.y + radius * angle.sin()).round();
        if x < 0.0 || y < 0.0 || x >= w as f64 || y >= h as f64 {
            return false;
        }
        *sample = binary.get_pixel(x as u32, y as u32)[0] > 127;
    }
    let transitions = (0..RING_SAMPLES)
        .filter(|&k| samples[k] != samples[(k + 1) % RING_SAMPLES])
        .count();
    transitions == 4
}
