//! Subpixel corner refinement by gradient orthogonality.
//!
//! For the true corner `q`, the image gradient at any nearby point `p` is
//! orthogonal to `p - q` (it is either zero in a flat region or normal to an
//! edge through `q`). Each iteration solves the weighted least-squares system
//!
//! ```text
//! sum(w g g^T) q = sum(w g g^T p)
//! ```
//!
//! over a window around the current estimate, sampling the image bilinearly.

use crate::optimization::TerminationCriteria;
use image::GrayImage;
use nalgebra::{Matrix2, Point2, Vector2};
use rayon::prelude::*;

/// Refines each corner in parallel. A corner that leaves its search window
/// keeps its input position.
pub fn refine_corners(
    image: &GrayImage,
    corners: &[Point2<f64>],
    window_half_size: u32,
    criteria: &TerminationCriteria,
) -> Vec<Point2<f64>> {
    corners
        .par_iter()
        .map(|corner| refine_corner(image, corner, window_half_size, criteria))
        .collect()
}

fn refine_corner(
    image: &GrayImage,
    corner: &Point2<f64>,
    window_half_size: u32,
    criteria: &TerminationCriteria,
) -> Point2<f64> {
    let half = window_half_size as i32;
    if half == 0 || image.width() < 2 || image.height() < 2 {
        return *corner;
    }
    let half_f = half as f64;
    let epsilon_sq = criteria.epsilon * criteria.epsilon;

    let mut current = *corner;
    for _ in 0..criteria.max_iterations.max(1) {
        let mut a = Matrix2::<f64>::zeros();
        let mut b = Vector2::<f64>::zeros();
        for dy in -half..=half {
            for dx in -half..=half {
                let (nx, ny) = (dx as f64 / half_f, dy as f64 / half_f);
                let weight = (-(nx * nx + ny * ny)).exp();
                let p = Vector2::new(current.x + dx as f64, current.y + dy as f64);
                let gx = 0.5 * (sample(image, p.x + 1.0, p.y) - sample(image, p.x - 1.0, p.y));
                let gy = 0.5 * (sample(image, p.x, p.y + 1.0) - sample(image, p.x, p.y - 1.0));
                let g = Vector2::new(gx, gy);
                let ggt = g * g.transpose() * weight;
                a += ggt;
                b += ggt * p;
            }
        }

        if a.determinant().abs() <= f64::EPSILON * a.norm_squared().max(f64::MIN_POSITIVE) {
            break;
        }
        let Some(inverse) = a.try_inverse() else {
            break;
        };
        let next = Point2::from(inverse * b);
        let step_sq = (next - current).norm_squared();
        current = next;

        let offset = current - corner;
        if offset.x.abs() > half_f || offset.y.abs() > half_f {
            return *corner;
        }
        if step_sq <= epsilon_sq {
            break;
        }
    }
    current
}

/// Bilinear sample with coordinates clamped to the image.
fn sample(image: &GrayImage, x: f64, y: f64) -> f64 {
    let max_x = (image.width() - 1) as f64;
    let max_y = (image.height() - 1) as f64;
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let (x0, y0) = (x0 as u32, y0 as u32);
    let x1 = (x0 + 1).min(image.width() - 1);
    let y1 = (y0 + 1).min(image.height() - 1);
    let value = |x: u32, y: u32| image.get_pixel(x, y)[0] as f64;
    let top = value(x0, y0) * (1.0 - fx) + value(x1, y0) * fx;
    let bottom = value(x0, y1) * (1.0 - fx) + value(x1, y1) * fx;
    top * (1.0 - fy) + bottom * fy
}
