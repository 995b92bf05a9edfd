//! Utility functions for image layout conversions and region cropping.

pub mod safe_cast;
pub mod image_conversion;

use crate::types::{BoundingBox, Frame};
use crate::{Error, Result};
use ndarray::s;
use safe_cast::{i32_to_usize, usize_to_i32};

/// Crop a frame to a bounding box, clamping the box to the frame first
///
/// # Errors
///
/// Returns an error if the box does not overlap the frame
pub fn crop_frame(frame: &Frame, bbox: BoundingBox) -> Result<Frame> {
    let (height, width, _) = frame.dim();
    let clamped = bbox
        .clamp_to(usize_to_i32(width)?, usize_to_i32(height)?)
        .ok_or_else(|| Error::InvalidInput(format!("Box {bbox:?} lies outside {width}x{height} frame")))?;

    let x0 = i32_to_usize(clamped.x)?;
    let y0 = i32_to_usize(clamped.y)?;
    let x1 = x0 + i32_to_usize(clamped.width)?;
    let y1 = y0 + i32_to_usize(clamped.height)?;

    Ok(frame.slice(s![y0..y1, x0..x1, ..]).to_owned())
}
