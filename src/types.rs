//! Image and result types shared by the pipeline stages.

use ndarray::{Array2, Array3};

/// Decoded video frame, shape (height, width, 3), BGR channel order
pub type Frame = Array3<u8>;

/// Face region resized to the square network input size
pub type FaceCrop = Array3<u8>;

/// Contrast-equalized face crop scaled to [0, 1]
pub type NormalizedFace = Array3<f32>;

/// Attribution map in [0, 1] with the spatial shape of the explained frame
pub type Heatmap = Array2<f32>;

/// Axis-aligned face region in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    #[must_use]
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// Box area, zero for degenerate boxes
    #[must_use]
    pub fn area(&self) -> i64 {
        i64::from(self.width.max(0)) * i64::from(self.height.max(0))
    }

    /// Intersect with a `width` × `height` image, `None` if nothing remains
    #[must_use]
    pub fn clamp_to(&self, width: i32, height: i32) -> Option<Self> {
        let x0 = self.x.clamp(0, width);
        let y0 = self.y.clamp(0, height);
        let x1 = self.x.saturating_add(self.width).clamp(0, width);
        let y1 = self.y.saturating_add(self.height).clamp(0, height);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Self::new(x0, y0, x1 - x0, y1 - y0))
    }
}

/// Outcome of face localization on a single frame
#[derive(Debug, Clone, PartialEq)]
pub enum Localized {
    /// Largest detected face, cropped and resized
    Face(FaceCrop),
    /// No detector available, the whole frame was resized instead
    WholeFrame(FaceCrop),
    /// The detector ran and found nothing; the frame should be skipped
    Absent,
}

impl Localized {
    /// Crop produced by either the detector or the whole-frame fallback
    #[must_use]
    pub fn into_crop(self) -> Option<FaceCrop> {
        match self {
            Self::Face(crop) | Self::WholeFrame(crop) => Some(crop),
            Self::Absent => None,
        }
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::WholeFrame(_))
    }
}

/// Result of a step that falls back to a simpler behaviour instead of failing
#[derive(Debug, Clone, PartialEq)]
pub enum Degradable<T> {
    /// The step ran as intended
    Clean(T),
    /// The step failed and `value` is the fallback
    Degraded { value: T, reason: String },
}

impl<T> Degradable<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Clean(value) | Self::Degraded { value, .. } => value,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}
