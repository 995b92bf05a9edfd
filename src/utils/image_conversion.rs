//! Image conversion utilities between ndarray frames, `image` buffers and OpenCV Mats.
//!
//! Frames travel through the pipeline as `(height, width, 3)` BGR arrays, the layout
//! OpenCV decodes into. The `image` crate works in RGB, so every hop swaps channels.

use crate::constants::FRAME_CHANNELS;
use crate::types::{Frame, NormalizedFace};
use crate::utils::safe_cast::{f32_to_u8_clamp, usize_to_u32};
use crate::{Error, Result};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::{Array3, Array4, ArrayView3};

/// Convert a BGR frame to an RGB `image` buffer
///
/// # Errors
/// * Returns error if the frame does not have 3 channels
pub fn frame_to_rgb_image(frame: &Frame) -> Result<RgbImage> {
    let (height, width, channels) = frame.dim();
    if channels != FRAME_CHANNELS {
        return Err(Error::InvalidInput(format!(
            "Expected {FRAME_CHANNELS} channels, got {channels}"
        )));
    }

    let mut image = RgbImage::new(usize_to_u32(width)?, usize_to_u32(height)?);
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        let (row, col) = (y as usize, x as usize);
        *pixel = Rgb([frame[[row, col, 2]], frame[[row, col, 1]], frame[[row, col, 0]]]);
    }
    Ok(image)
}

/// Convert an RGB `image` buffer to a BGR frame
#[must_use]
pub fn rgb_image_to_frame(image: &RgbImage) -> Frame {
    let (width, height) = image.dimensions();
    Array3::from_shape_fn((height as usize, width as usize, FRAME_CHANNELS), |(row, col, ch)| {
        image.get_pixel(col as u32, row as u32)[FRAME_CHANNELS - 1 - ch]
    })
}

/// Resize a frame with bilinear interpolation
///
/// # Errors
/// * Returns error if the frame is empty or not 3-channel
pub fn resize_frame(frame: &Frame, width: u32, height: u32) -> Result<Frame> {
    if frame.is_empty() {
        return Err(Error::InvalidInput("Cannot resize an empty frame".to_string()));
    }
    let rgb = frame_to_rgb_image(frame)?;
    let resized = imageops::resize(&rgb, width, height, FilterType::Triangle);
    Ok(rgb_image_to_frame(&resized))
}

/// Convert a unit-range BGR array to an 8-bit RGB `image` buffer
///
/// # Errors
/// * Returns error if the array does not have 3 channels
pub fn unit_bgr_to_rgb_image(array: ArrayView3<'_, f32>) -> Result<RgbImage> {
    let (height, width, channels) = array.dim();
    if channels != FRAME_CHANNELS {
        return Err(Error::InvalidInput(format!(
            "Expected {FRAME_CHANNELS} channels, got {channels}"
        )));
    }

    let mut image = RgbImage::new(usize_to_u32(width)?, usize_to_u32(height)?);
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        let (row, col) = (y as usize, x as usize);
        let channel = |ch: usize| f32_to_u8_clamp(array[[row, col, ch]] * 255.0);
        *pixel = Rgb([channel(2), channel(1), channel(0)]);
    }
    Ok(image)
}

/// Stack normalized faces into a `(batch, height, width, channels)` tensor
///
/// # Errors
/// * Returns error if `faces` is empty
/// * Returns error if the faces have different dimensions
pub fn faces_to_batch(faces: &[NormalizedFace]) -> Result<Array4<f32>> {
    let first = faces
        .first()
        .ok_or_else(|| Error::InvalidInput("Empty face batch".to_string()))?;
    let (rows, cols, channels) = first.dim();

    for (i, face) in faces.iter().enumerate() {
        if face.dim() != (rows, cols, channels) {
            return Err(Error::InvalidInput(format!(
                "Face at index {i} has shape {:?}, expected {:?}",
                face.shape(),
                first.shape()
            )));
        }
    }

    let mut batch = Array4::zeros((faces.len(), rows, cols, channels));
    for (mut slot, face) in batch.outer_iter_mut().zip(faces) {
        slot.assign(face);
    }
    Ok(batch)
}

#[cfg(feature = "opencv")]
mod mat {
    use super::*;
    use crate::utils::safe_cast::{i32_to_usize, usize_to_i32};
    use opencv::core::{Mat, Scalar, Vec3b, CV_8UC3};
    use opencv::prelude::*;

    /// Convert an 8-bit 3-channel OpenCV Mat to a frame
    ///
    /// # Errors
    /// * Returns error if the Mat is empty or not 3-channel
    /// * Returns error if Mat data cannot be accessed
    pub fn mat_to_frame(mat: &Mat) -> Result<Frame> {
        let rows = mat.rows();
        let cols = mat.cols();
        let channels = mat.channels();

        if rows <= 0 || cols <= 0 || channels != 3 {
            return Err(Error::InvalidInput(format!(
                "Invalid Mat dimensions: {rows}x{cols}x{channels}"
            )));
        }

        let mut frame = Frame::zeros((i32_to_usize(rows)?, i32_to_usize(cols)?, FRAME_CHANNELS));
        for row in 0..rows {
            for col in 0..cols {
                let pixel = mat.at_2d::<Vec3b>(row, col)?;
                let (r, c) = (i32_to_usize(row)?, i32_to_usize(col)?);
                for ch in 0..FRAME_CHANNELS {
                    frame[[r, c, ch]] = pixel[ch];
                }
            }
        }
        Ok(frame)
    }

    /// Convert a frame to an 8-bit 3-channel OpenCV Mat
    ///
    /// # Errors
    /// * Returns error if Mat creation fails
    pub fn frame_to_mat(frame: &Frame) -> Result<Mat> {
        let (height, width, _) = frame.dim();
        let mut mat = Mat::new_rows_cols_with_default(
            usize_to_i32(height)?,
            usize_to_i32(width)?,
            CV_8UC3,
            Scalar::default(),
        )?;

        for ((row, col), _) in frame.slice(ndarray::s![.., .., 0]).indexed_iter() {
            let mut pixel = Vec3b::default();
            for ch in 0..FRAME_CHANNELS {
                pixel[ch] = frame[[row, col, ch]];
            }
            *mat.at_2d_mut::<Vec3b>(usize_to_i32(row)?, usize_to_i32(col)?)? = pixel;
        }
        Ok(mat)
    }
}

#[cfg(feature = "opencv")]
pub use mat::{frame_to_mat, mat_to_frame};
