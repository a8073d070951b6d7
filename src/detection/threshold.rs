//! Adaptive local thresholding via an integral image.

use image::GrayImage;
use rayon::prelude::*;

/// Summed-area table with one row and column of zero padding.
pub struct IntegralImage {
    width: usize,
    height: usize,
    sums: Vec<u64>,
}

impl IntegralImage {
    pub fn new(image: &GrayImage) -> Self {
        let width = image.width() as usize;
        let height = image.height() as usize;
        let stride = width + 1;
        let mut sums = vec![0u64; stride * (height + 1)];
        for (y, row) in image.as_raw().chunks_exact(width.max(1)).take(height).enumerate() {
            let mut running = 0u64;
            for (x, &value) in row.iter().enumerate() {
                running += value as u64;
                sums[(y + 1) * stride + x + 1] = sums[y * stride + x + 1] + running;
            }
        }
        Self {
            width,
            height,
            sums,
        }
    }

    /// Sum and pixel count of the window `[x0, x1) x [y0, y1)`, clipped to the image.
    pub fn window_sum(&self, x0: i64, y0: i64, x1: i64, y1: i64) -> (u64, u64) {
        let clip = |v: i64, max: usize| v.clamp(0, max as i64) as usize;
        let (x0, x1) = (clip(x0, self.width), clip(x1, self.width));
        let (y0, y1) = (clip(y0, self.height), clip(y1, self.height));
        if x1 <= x0 || y1 <= y0 {
            return (0, 0);
        }
        let stride = self.width + 1;
        let sum = self.sums[y1 * stride + x1] + self.sums[y0 * stride + x0]
            - self.sums[y0 * stride + x1]
            - self.sums[y1 * stride + x0];
        (sum, ((x1 - x0) * (y1 - y0)) as u64)
    }
}

/// Binarizes `image` against the mean of a `block_size` neighbourhood.
///
/// A pixel becomes white (255) when `value > mean - offset`, black (0)
/// otherwise. Rows are processed in parallel.
pub fn adaptive_threshold(image: &GrayImage, block_size: u32, offset: f32) -> GrayImage {
    let (width, height) = image.dimensions();
    let mut binary = GrayImage::new(width, height);
    if width == 0 || height == 0 {
        return binary;
    }

    let integral = IntegralImage::new(image);
    let half = (block_size / 2) as i64;
    let source = image.as_raw();
    let w = width as usize;

    binary.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
        let yi = y as i64;
        for (x, out) in row.iter_mut().enumerate() {
            let xi = x as i64;
            let (sum, count) =
                integral.window_sum(xi - half, yi - half, xi + half + 1, yi + half + 1);
            let mean = sum as f32 / count.max(1) as f32;
            let value = source[y * w + x] as f32;
            *out = if value > mean - offset { 255 } else { 0 };
        }
    });
    binary
}
