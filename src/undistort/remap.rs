//! Image resampling through an [`UndistortionMap`].

use crate::cancel::CancelFlag;
use crate::undistort::map::{in_bounds, IndexMap, UndistortionMap};
use crate::undistort::UndistortError;
use image::{ImageBuffer, Pixel};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Interpolation {
    Nearest,
    #[default]
    Bilinear,
}

/// Channel types the remapper can interpolate.
pub trait Sample: Copy + Send + Sync + 'static {
    fn to_f32(self) -> f32;
    /// Rounds and saturates for integer types.
    fn from_f32(value: f32) -> Self;
}

impl Sample for u8 {
    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        value.round().clamp(0.0, u8::MAX as f32) as u8
    }
}

impl Sample for u16 {
    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        value.round().clamp(0.0, u16::MAX as f32) as u16
    }
}

impl Sample for f32 {
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        value
    }
}

type Image<P> = ImageBuffer<P, Vec<<P as Pixel>::Subpixel>>;

/// Writes one output row. `row` holds `map.width() * channels` samples.
fn remap_row<P>(
    image: &Image<P>,
    map: &UndistortionMap,
    interpolation: Interpolation,
    border: &[P::Subpixel],
    v: usize,
    row: &mut [P::Subpixel],
) where
    P: Pixel,
    P::Subpixel: Sample,
{
    let channels = P::CHANNEL_COUNT as usize;
    let (width, height) = image.dimensions();
    let src = image.as_raw();
    let stride = width as usize * channels;
    let map_width = map.width() as usize;
    let map_row = &map.coords()[v * map_width..(v + 1) * map_width];

    for (out, p) in row.chunks_exact_mut(channels).zip(map_row) {
        if !in_bounds(p, width, height) {
            out.copy_from_slice(border);
            continue;
        }
        match interpolation {
            Interpolation::Nearest => {
                let offset = p.y.round() as usize * stride + p.x.round() as usize * channels;
                out.copy_from_slice(&src[offset..offset + channels]);
            }
            Interpolation::Bilinear => {
                let (x0, y0) = (p.x.floor(), p.y.floor());
                let (fx, fy) = (p.x - x0, p.y - y0);
                let (x0, y0) = (x0 as usize, y0 as usize);
                // at the last column or row the far neighbour has zero weight
                let x1 = (x0 + 1).min(width as usize - 1);
                let y1 = (y0 + 1).min(height as usize - 1);
                let at = |x: usize, y: usize, c: usize| Sample::to_f32(src[y * stride + x * channels + c]);
                // lerp form: exact when both neighbours are equal
                let lerp = |a: f32, b: f32, t: f32| a + (b - a) * t;
                for (c, value) in out.iter_mut().enumerate() {
                    let top = lerp(at(x0, y0, c), at(x1, y0, c), fx);
                    let bottom = lerp(at(x0, y1, c), at(x1, y1, c), fx);
                    *value = Sample::from_f32(lerp(top, bottom, fy));
                }
            }
        }
    }
}

/// Resamples `image` through `map`; the output has the map's size. Pixels
/// whose source coordinate lies outside `image` receive `border`.
///
/// # Arguments
///
/// * `image` - Source image of any resolution
/// * `map` - Lookup table from output pixel to source coordinate
/// * `interpolation` - Nearest or bilinear sampling
/// * `border` - Value written where the source coordinate is out of bounds
///
/// # Returns
///
/// * `ImageBuffer` - Output of `map.width() x map.height()` pixels
pub fn remap<P>(
    image: &Image<P>,
    map: &UndistortionMap,
    interpolation: Interpolation,
    border: P,
) -> Image<P>
where
    P: Pixel + Send + Sync,
    P::Subpixel: Sample,
{
    let mut output = ImageBuffer::from_pixel(map.width(), map.height(), border);
    if image.width() == 0 || image.height() == 0 || map.width() == 0 {
        return output;
    }
    let row_len = map.width() as usize * P::CHANNEL_COUNT as usize;
    let border = border.channels();
    output
        .par_chunks_mut(row_len)
        .enumerate()
        .for_each(|(v, row)| remap_row(image, map, interpolation, border, v, row));
    output
}

/// [`remap`] with a black (all-zero) border.
pub fn remap_default<P>(image: &Image<P>, map: &UndistortionMap, interpolation: Interpolation) -> Image<P>
where
    P: Pixel + Send + Sync,
    P::Subpixel: Sample,
{
    let border = *P::from_slice(&vec![Sample::from_f32(0.0); P::CHANNEL_COUNT as usize]);
    remap(image, map, interpolation, border)
}

/// [`remap`] that stops between rows once `cancel` is set.
pub fn remap_with_cancel<P>(
    image: &Image<P>,
    map: &UndistortionMap,
    interpolation: Interpolation,
    border: P,
    cancel: &CancelFlag,
) -> Result<Image<P>, UndistortError>
where
    P: Pixel + Send + Sync,
    P::Subpixel: Sample,
{
    let mut output = ImageBuffer::from_pixel(map.width(), map.height(), border);
    if image.width() == 0 || image.height() == 0 || map.width() == 0 {
        return Ok(output);
    }
    let row_len = map.width() as usize * P::CHANNEL_COUNT as usize;
    let border = border.channels();
    output
        .par_chunks_mut(row_len)
        .enumerate()
        .try_for_each(|(v, row)| {
            if cancel.is_cancelled() {
                return Err(UndistortError::Cancelled);
            }
            remap_row(image, map, interpolation, border, v, row);
            Ok(())
        })?;
    Ok(output)
}

/// Nearest-neighbour remap through a precomputed [`IndexMap`]. `image` must
/// have the resolution the index map was built for.
pub fn remap_indexed<P>(image: &Image<P>, index: &IndexMap, border: P) -> Result<Image<P>, UndistortError>
where
    P: Pixel,
    P::Subpixel: Sample,
{
    if image.dimensions() != (index.source.width, index.source.height) {
        return Err(UndistortError::InvalidParams(format!(
            "image is {}x{}, index map expects {}x{}",
            image.width(),
            image.height(),
            index.source.width,
            index.source.height
        )));
    }
    let channels = P::CHANNEL_COUNT as usize;
    let mut output = ImageBuffer::from_pixel(index.width, index.height, border);
    let src = image.as_raw();
    let dst: &mut [P::Subpixel] = &mut output;
    for &(to, from) in &index.pairs {
        dst[to * channels..(to + 1) * channels]
            .copy_from_slice(&src[from * channels..(from + 1) * channels]);
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Distortion, Intrinsics, PlumbBob, Resolution};
    use image::{GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
    use nalgebra::Point2;

    fn map_of(width: u32, height: u32, coords: Vec<Point2<f32>>) -> UndistortionMap {
        UndistortionMap::from_parts(width, height, coords).unwrap()
    }

    #[test]
    fn test_uniform_image_nearest_equals_bilinear() {
        let intrinsics = Intrinsics::new(1244.62, 930.99, 2016.0, 1508.0, 0.0);
        let distortion = Distortion::PlumbBob(PlumbBob::new(0.1, 0.1, 0.2, 0.1, 0.0));
        let resolution = Resolution::new(4032, 3024);
        let map = UndistortionMap::build(&intrinsics, &distortion, None, resolution).unwrap();
        let image = GrayImage::from_pixel(4032, 3024, Luma([173]));
        let nearest = remap_default(&image, &map, Interpolation::Nearest);
        let bilinear = remap_default(&image, &map, Interpolation::Bilinear);
        assert_eq!(nearest, bilinear);
        assert_eq!(nearest.get_pixel(2016, 1508)[0], 173);
    }

    #[test]
    fn test_uniform_float_image_nearest_equals_bilinear() {
        let intrinsics = Intrinsics::new(1244.62, 930.99, 2016.0, 1508.0, 0.0);
        let distortion = Distortion::PlumbBob(PlumbBob::new(0.1, 0.1, 0.2, 0.1, 0.0));
        let resolution = Resolution::new(4032, 3024);
        let map = UndistortionMap::build(&intrinsics, &distortion, None, resolution).unwrap();
        let image: ImageBuffer<Luma<f32>, Vec<f32>> = ImageBuffer::from_pixel(4032, 3024, Luma([0.7]));
        let nearest = remap_default(&image, &map, Interpolation::Nearest);
        let bilinear = remap_default(&image, &map, Interpolation::Bilinear);
        let differing = nearest
            .as_raw()
            .iter()
            .zip(bilinear.as_raw())
            .filter(|(a, b)| a.to_bits() != b.to_bits())
            .count();
        assert_eq!(differing, 0);
        assert_eq!(bilinear.get_pixel(2016, 1508)[0], 0.7);
    }

    #[test]
    fn test_bilinear_weights_and_border() {
        let image = GrayImage::from_fn(3, 2, |x, y| Luma([(x * 40 + y * 100) as u8]));
        let map = map_of(
            4,
            1,
            vec![
                Point2::new(0.5, 0.5),
                Point2::new(2.0, 1.0),
                Point2::new(2.01, 0.0),
                Point2::new(-0.01, 0.0),
            ],
        );
        let out = remap(&image, &map, Interpolation::Bilinear, Luma([7]));
        assert_eq!(out.get_pixel(0, 0)[0], 70);
        assert_eq!(out.get_pixel(1, 0)[0], 180);
        assert_eq!(out.get_pixel(2, 0)[0], 7);
        assert_eq!(out.get_pixel(3, 0)[0], 7);

        let nearest = remap(&image, &map, Interpolation::Nearest, Luma([7]));
        assert_eq!(nearest.get_pixel(1, 0)[0], 180);
        assert_eq!(nearest.get_pixel(2, 0)[0], 7);
    }

    #[test]
    fn test_multichannel_and_float_pixels() {
        let rgb = RgbImage::from_fn(2, 2, |x, y| Rgb([x as u8 * 100, y as u8 * 50, 9]));
        let map = map_of(1, 1, vec![Point2::new(0.5, 1.0)]);
        let out = remap(&rgb, &map, Interpolation::Bilinear, Rgb([0, 0, 0]));
        assert_eq!(out.get_pixel(0, 0), &Rgb([50, 50, 9]));

        let float: ImageBuffer<Luma<f32>, Vec<f32>> =
            ImageBuffer::from_fn(2, 1, |x, _| Luma([x as f32]));
        let map = map_of(1, 1, vec![Point2::new(0.25, 0.0)]);
        let out = remap_default(&float, &map, Interpolation::Bilinear);
        assert_eq!(out.get_pixel(0, 0)[0], 0.25);

        let wide: ImageBuffer<Luma<u16>, Vec<u16>> =
            ImageBuffer::from_fn(2, 1, |x, _| Luma([x as u16 * 1000]));
        let out = remap_default(&wide, &map, Interpolation::Nearest);
        assert_eq!(out.get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn test_indexed_matches_nearest() {
        let intrinsics = Intrinsics::new(150.0, 150.0, 80.0, 60.0, 0.0);
        let distortion = Distortion::PlumbBob(PlumbBob::new(-0.2, 0.05, 0.0, 0.0, 0.0));
        let resolution = Resolution::new(160, 120);
        let map = UndistortionMap::build(&intrinsics, &distortion, None, resolution).unwrap();
        let image = GrayImage::from_fn(160, 120, |x, y| Luma([((x * 7 + y * 3) % 251) as u8]));

        let index = IndexMap::from_map(&map, resolution).unwrap();
        let indexed = remap_indexed(&image, &index, Luma([0])).unwrap();
        let nearest = remap_default(&image, &map, Interpolation::Nearest);
        assert_eq!(indexed, nearest);

        let small = GrayImage::new(10, 10);
        assert!(remap_indexed(&small, &index, Luma([0])).is_err());
    }

    #[test]
    fn test_undistortion_reverses_synthetic_distortion() {
        let intrinsics = Intrinsics::new(180.0, 180.0, 100.0, 75.0, 0.0);
        let distortion = Distortion::PlumbBob(PlumbBob::new(-0.15, 0.03, 0.002, -0.001, 0.0));
        let resolution = Resolution::new(200, 150);
        let original: ImageBuffer<Luma<f32>, Vec<f32>> = ImageBuffer::from_fn(200, 150, |x, y| {
            let (x, y) = (x as f32, y as f32);
            Luma([100.0 + 40.0 * (x / 17.0).sin() + 30.0 * (y / 13.0).cos()])
        });

        let distort = UndistortionMap::build_distortion(&intrinsics, &distortion, None, resolution)
            .unwrap();
        let captured = remap_default(&original, &distort, Interpolation::Bilinear);
        let undistort = UndistortionMap::build(&intrinsics, &distortion, None, resolution).unwrap();
        let restored = remap_default(&captured, &undistort, Interpolation::Bilinear);

        let mut worst = 0.0f32;
        for y in 40..110 {
            for x in 50..150 {
                let diff = (restored.get_pixel(x, y)[0] - original.get_pixel(x, y)[0]).abs();
                worst = worst.max(diff);
            }
        }
        assert!(worst < 2.0, "max difference {worst}");
    }

    #[test]
    fn test_empty_map_gives_empty_output() {
        let image = GrayImage::from_pixel(4, 4, Luma([9]));
        let out = remap_default(&image, &map_of(0, 0, Vec::new()), Interpolation::Bilinear);
        assert_eq!(out.dimensions(), (0, 0));
    }

    #[test]
    fn test_remap_with_cancel() {
        let image = GrayImage::from_pixel(8, 8, Luma([1]));
        let map = map_of(2, 1, vec![Point2::new(1.0, 1.0), Point2::new(3.0, 3.0)]);
        let flag = CancelFlag::new();
        let out = remap_with_cancel(&image, &map, Interpolation::Nearest, Luma([0]), &flag).unwrap();
        assert_eq!(out.as_raw(), &vec![1, 1]);

        flag.cancel();
        assert_eq!(
            remap_with_cancel(&image, &map, Interpolation::Nearest, Luma([0]), &flag),
            Err(UndistortError::Cancelled)
        );
    }
}
