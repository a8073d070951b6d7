//! Lens undistortion: per-pixel lookup tables and interpolated remapping.
//!
//! An [`UndistortionMap`] is built once per (camera, target camera, output
//! resolution) and can then be applied to any number of images with
//! [`remap`]. For the fastest repeated nearest-neighbour remaps of one source
//! resolution, the map can be flattened into an [`IndexMap`].

use crate::camera::CameraModelError;

pub mod map;
pub mod remap;

pub use map::{IndexMap, UndistortionMap};
pub use remap::{remap, remap_default, remap_indexed, remap_with_cancel, Interpolation, Sample};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum UndistortError {
    #[error("Invalid undistortion parameters: {0}")]
    InvalidParams(String),
    #[error("Undistortion cancelled")]
    Cancelled,
}

impl From<CameraModelError> for UndistortError {
    fn from(err: CameraModelError) -> Self {
        UndistortError::InvalidParams(err.to_string())
    }
}
