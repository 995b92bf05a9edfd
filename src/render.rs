//! Rendering explanations to images and transport encodings.

use crate::types::Heatmap;
use crate::utils::image_conversion::unit_bgr_to_rgb_image;
use crate::utils::safe_cast::{f32_to_u8_clamp, usize_to_u32};
use crate::Result;
use base64::Engine;
use image::{ImageFormat, Rgb, RgbImage};
use ndarray::Array3;
use std::io::Cursor;
use std::path::Path;

/// Viridis colour map sampled at nine evenly spaced stops
const VIRIDIS: [[f32; 3]; 9] = [
    [68.0, 1.0, 84.0],
    [71.0, 44.0, 122.0],
    [59.0, 81.0, 139.0],
    [44.0, 113.0, 142.0],
    [33.0, 144.0, 141.0],
    [39.0, 173.0, 129.0],
    [92.0, 200.0, 99.0],
    [170.0, 220.0, 50.0],
    [253.0, 231.0, 37.0],
];

/// Map a value in `[0, 1]` to its viridis colour; out-of-range values are clamped
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn viridis(value: f32) -> Rgb<u8> {
    let value = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
    let position = value * (VIRIDIS.len() - 1) as f32;
    let lower = (position.floor() as usize).min(VIRIDIS.len() - 2);
    let t = position - lower as f32;

    let (a, b) = (VIRIDIS[lower], VIRIDIS[lower + 1]);
    Rgb([0, 1, 2].map(|c| f32_to_u8_clamp(a[c] + (b[c] - a[c]) * t)))
}

/// Colour a heatmap with the viridis map
///
/// # Errors
///
/// Returns an error if the heatmap is too large for an image buffer
pub fn heatmap_to_rgb(heatmap: &Heatmap) -> Result<RgbImage> {
    let (height, width) = heatmap.dim();
    let mut image = RgbImage::new(usize_to_u32(width)?, usize_to_u32(height)?);
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        *pixel = viridis(heatmap[[y as usize, x as usize]]);
    }
    Ok(image)
}

/// Convert a unit-range BGR overlay to an RGB image
///
/// # Errors
///
/// Returns an error if the overlay is not 3-channel
pub fn overlay_to_rgb(overlay: &Array3<f32>) -> Result<RgbImage> {
    unit_bgr_to_rgb_image(overlay.view())
}

/// Encode an image as PNG bytes
///
/// # Errors
///
/// Returns an error if encoding fails
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, ImageFormat::Png)?;
    Ok(bytes.into_inner())
}

/// Encode an image as base64 PNG for embedding in text reports
///
/// # Errors
///
/// Returns an error if encoding fails
pub fn to_base64_png(image: &RgbImage) -> Result<String> {
    Ok(base64::engine::general_purpose::STANDARD.encode(encode_png(image)?))
}

/// Write an image as a PNG file
///
/// # Errors
///
/// Returns an error if encoding or writing fails
pub fn save_png<P: AsRef<Path>>(image: &RgbImage, path: P) -> Result<()> {
    std::fs::write(path, encode_png(image)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    #[test]
    fn test_viridis_endpoints() {
        assert_eq!(viridis(0.0), Rgb([68, 1, 84]));
        assert_eq!(viridis(1.0), Rgb([253, 231, 37]));
        assert_eq!(viridis(2.0), viridis(1.0));
        assert_eq!(viridis(f32::NAN), viridis(0.0));
    }

    #[test]
    fn test_heatmap_to_rgb_dimensions() {
        let heatmap = Array2::from_shape_fn((3, 5), |(y, x)| (y * 5 + x) as f32 / 14.0);
        let image = heatmap_to_rgb(&heatmap).unwrap();
        assert_eq!(image.dimensions(), (5, 3));
        assert_eq!(*image.get_pixel(4, 2), viridis(1.0));
    }

    #[test]
    fn test_png_and_base64() {
        let image = RgbImage::from_pixel(4, 4, Rgb([10, 20, 30]));
        let png = encode_png(&image).unwrap();
        assert_eq!(&png[..8], &PNG_SIGNATURE);

        let encoded = to_base64_png(&image).unwrap();
        let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
        assert_eq!(decoded, png);

        let roundtrip = image::load_from_memory(&png).unwrap().to_rgb8();
        assert_eq!(roundtrip, image);
    }
}
