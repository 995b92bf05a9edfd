//! Local contrast equalization of face crops.
//!
//! The crop is converted to CIE L*a*b*, the lightness channel is equalized with OpenCV's
//! contrast-limited adaptive histogram equalization (CLAHE), and the result is converted
//! back to BGR. Chroma is left untouched so skin tones survive the equalization.

use crate::constants::{CLAHE_CLIP_LIMIT, CLAHE_TILE_GRID, FRAME_CHANNELS, PIXEL_SCALE};
use crate::types::{Degradable, FaceCrop, NormalizedFace};
use crate::{Error, Result};
use log::warn;
use ndarray::Zip;

/// Equalizes lightness of face crops, passing the crop through unchanged on failure
#[derive(Debug, Clone)]
pub struct ContrastNormalizer {
    clip_limit: f32,
    tile_grid: usize,
}

impl Default for ContrastNormalizer {
    fn default() -> Self {
        Self::new(CLAHE_CLIP_LIMIT, CLAHE_TILE_GRID)
    }
}

impl ContrastNormalizer {
    #[must_use]
    pub fn new(clip_limit: f32, tile_grid: usize) -> Self {
        Self { clip_limit, tile_grid }
    }

    /// Equalize the lightness channel of a BGR crop
    pub fn normalize(&self, crop: &FaceCrop) -> Degradable<FaceCrop> {
        match self.check(crop).and_then(|()| self.equalize(crop)) {
            Ok(equalized) => Degradable::Clean(equalized),
            Err(e) => {
                warn!("Contrast equalization failed: {}. Returning original image.", e);
                Degradable::Degraded {
                    value: crop.clone(),
                    reason: e.to_string(),
                }
            }
        }
    }

    fn check(&self, crop: &FaceCrop) -> Result<()> {
        let (height, width, channels) = crop.dim();
        if height == 0 || width == 0 {
            return Err(Error::InvalidInput("Cannot equalize an empty crop".to_string()));
        }
        if channels != FRAME_CHANNELS {
            return Err(Error::InvalidInput(format!(
                "Expected {FRAME_CHANNELS} channels, got {channels}"
            )));
        }
        if self.tile_grid == 0 {
            return Err(Error::InvalidInput("Tile grid must be greater than 0".to_string()));
        }
        if !(self.clip_limit.is_finite() && self.clip_limit > 0.0) {
            return Err(Error::InvalidInput(format!("Invalid clip limit: {}", self.clip_limit)));
        }
        Ok(())
    }

    #[cfg(feature = "opencv")]
    fn equalize(&self, crop: &FaceCrop) -> Result<FaceCrop> {
        use crate::utils::image_conversion::{frame_to_mat, mat_to_frame};
        use crate::utils::safe_cast::usize_to_i32;
        use opencv::core::{self, Mat, Size, Vector};
        use opencv::imgproc;
        use opencv::prelude::*;

        let grid = usize_to_i32(self.tile_grid)?;
        let bgr = frame_to_mat(crop)?;

        let mut lab = Mat::default();
        imgproc::cvt_color(&bgr, &mut lab, imgproc::COLOR_BGR2Lab, 0)?;
        let mut channels = Vector::<Mat>::new();
        core::split(&lab, &mut channels)?;

        let mut clahe = imgproc::create_clahe(f64::from(self.clip_limit), Size::new(grid, grid))?;
        let mut lightness = Mat::default();
        clahe.apply(&channels.get(0)?, &mut lightness)?;
        channels.set(0, lightness)?;

        let mut merged = Mat::default();
        core::merge(&channels, &mut merged)?;
        let mut equalized = Mat::default();
        imgproc::cvt_color(&merged, &mut equalized, imgproc::COLOR_Lab2BGR, 0)?;
        mat_to_frame(&equalized)
    }

    #[cfg(not(feature = "opencv"))]
    #[allow(clippy::unused_self)]
    fn equalize(&self, _crop: &FaceCrop) -> Result<FaceCrop> {
        Err(Error::ConfigError(
            "Contrast equalization requires the `opencv` feature".to_string(),
        ))
    }
}

/// Scale an 8-bit crop to floating point values in [0, 1]
#[must_use]
pub fn to_unit_range(crop: &FaceCrop) -> NormalizedFace {
    let mut face = NormalizedFace::zeros(crop.raw_dim());
    Zip::from(&mut face).and(crop).for_each(|out, &value| *out = f32::from(value) / PIXEL_SCALE);
    face
}
