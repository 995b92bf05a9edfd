use crate::constants::{CASCADE_MIN_FACE_SIZE, CASCADE_MIN_NEIGHBORS, CASCADE_SCALE_FACTOR, DEFAULT_TARGET_SIZE};
use crate::types::{BoundingBox, Frame, Localized};
use crate::utils::{crop_frame, image_conversion::resize_frame};
use crate::Result;
use log::{debug, warn};
use std::path::Path;
use std::sync::Arc;

/// Pluggable face detection backend.
///
/// Detectors are loaded once and shared by every localizer call, so implementations
/// take `&self` and must be thread-safe.
pub trait FaceDetector: Send + Sync {
    /// Detect candidate face regions in a BGR frame
    ///
    /// # Errors
    ///
    /// Returns an error if the detector backend fails on this frame
    fn detect(&self, frame: &Frame) -> Result<Vec<BoundingBox>>;
}

/// Select the box with the largest area, keeping the first one on ties
#[must_use]
pub fn largest_face(boxes: &[BoundingBox]) -> Option<BoundingBox> {
    boxes
        .iter()
        .copied()
        .reduce(|best, candidate| if candidate.area() > best.area() { candidate } else { best })
}

/// Crops the dominant face of a frame to a fixed square size
#[derive(Clone)]
pub struct FaceLocalizer {
    detector: Option<Arc<dyn FaceDetector>>,
    target_size: u32,
}

impl FaceLocalizer {
    /// Create a localizer around a loaded detector
    #[must_use]
    pub fn new(detector: Arc<dyn FaceDetector>, target_size: u32) -> Self {
        Self {
            detector: Some(detector),
            target_size,
        }
    }

    /// Create a localizer whose detector failed to load; every frame is resized whole
    #[must_use]
    pub fn without_detector(target_size: u32) -> Self {
        Self {
            detector: None,
            target_size,
        }
    }

    /// Create a localizer from an optional detector
    #[must_use]
    pub fn from_option(detector: Option<Arc<dyn FaceDetector>>, target_size: u32) -> Self {
        Self { detector, target_size }
    }

    #[must_use]
    pub fn target_size(&self) -> u32 {
        self.target_size
    }

    #[must_use]
    pub fn has_detector(&self) -> bool {
        self.detector.is_some()
    }

    /// Locate the largest face and resize it to the target size
    ///
    /// A detector failure on a single frame counts as a miss for that frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is empty or the crop cannot be resized
    pub fn localize(&self, frame: &Frame) -> Result<Localized> {
        let Some(detector) = &self.detector else {
            warn!("Face detector not loaded, resizing whole frame");
            return Ok(Localized::WholeFrame(resize_frame(frame, self.target_size, self.target_size)?));
        };

        let boxes = match detector.detect(frame) {
            Ok(boxes) => boxes,
            Err(e) => {
                warn!("Face detection failed on frame: {}", e);
                return Ok(Localized::Absent);
            }
        };

        let Some(face) = largest_face(&boxes) else {
            debug!("No faces detected in frame");
            return Ok(Localized::Absent);
        };

        debug!("Selected face {:?} out of {} candidates", face, boxes.len());
        let crop = crop_frame(frame, face)?;
        Ok(Localized::Face(resize_frame(&crop, self.target_size, self.target_size)?))
    }
}

impl Default for FaceLocalizer {
    fn default() -> Self {
        Self::without_detector(DEFAULT_TARGET_SIZE)
    }
}

/// Multi-scale detection parameters for the Haar cascade
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeParams {
    pub scale_factor: f64,
    pub min_neighbors: i32,
    pub min_size: i32,
}

impl Default for CascadeParams {
    fn default() -> Self {
        Self {
            scale_factor: CASCADE_SCALE_FACTOR,
            min_neighbors: CASCADE_MIN_NEIGHBORS,
            min_size: CASCADE_MIN_FACE_SIZE,
        }
    }
}

/// Load the Haar cascade detector, returning `None` when it cannot be used
///
/// Failing to load is not fatal: the localizer falls back to whole-frame resizing.
#[must_use]
#[cfg_attr(not(feature = "opencv"), allow(unused_variables))]
pub fn load_detector(cascade_path: Option<&Path>, params: CascadeParams) -> Option<Arc<dyn FaceDetector>> {
    let Some(path) = cascade_path else {
        warn!("No face cascade configured, face detection disabled");
        return None;
    };

    #[cfg(feature = "opencv")]
    {
        match CascadeDetector::new(path) {
            Ok(detector) => {
                let detector = detector.with_params(params);
                log::info!("Loaded Haar cascade from: {}", path.display());
                Some(Arc::new(detector))
            }
            Err(e) => {
                warn!("Failed to load Haar cascade from {}: {}", path.display(), e);
                None
            }
        }
    }

    #[cfg(not(feature = "opencv"))]
    {
        warn!(
            "Cascade {} ignored: built without the `opencv` feature, face detection disabled",
            path.display()
        );
        None
    }
}

#[cfg(feature = "opencv")]
pub use cascade::CascadeDetector;

#[cfg(feature = "opencv")]
mod cascade {
    use super::*;
    use crate::utils::image_conversion::frame_to_mat;
    use crate::Error;
    use opencv::core::{Mat, Rect, Size, Vector};
    use opencv::imgproc;
    use opencv::objdetect::CascadeClassifier;
    use opencv::prelude::*;
    use std::sync::Mutex;

    /// Viola-Jones face detector backed by an OpenCV Haar cascade
    pub struct CascadeDetector {
        classifier: Mutex<CascadeClassifier>,
        params: CascadeParams,
    }

    impl CascadeDetector {
        /// Load a cascade XML file
        ///
        /// # Errors
        ///
        /// Returns an error if the file cannot be parsed as a cascade
        pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
            let classifier = CascadeClassifier::new(&path.as_ref().to_string_lossy())?;
            if classifier.empty()? {
                return Err(Error::ModelError(format!(
                    "Empty Haar cascade: {}",
                    path.as_ref().display()
                )));
            }

            Ok(Self {
                classifier: Mutex::new(classifier),
                params: CascadeParams::default(),
            })
        }

        /// Override the multi-scale detection parameters
        #[must_use]
        pub fn with_params(mut self, params: CascadeParams) -> Self {
            self.params = params;
            self
        }
    }

    impl FaceDetector for CascadeDetector {
        fn detect(&self, frame: &Frame) -> Result<Vec<BoundingBox>> {
            let mat = frame_to_mat(frame)?;
            let mut gray = Mat::default();
            imgproc::cvt_color(&mat, &mut gray, imgproc::COLOR_BGR2GRAY, 0)?;

            let mut faces = Vector::<Rect>::new();
            let mut classifier = self
                .classifier
                .lock()
                .map_err(|_| Error::ModelError("Cascade classifier lock poisoned".to_string()))?;
            classifier.detect_multi_scale(
                &gray,
                &mut faces,
                self.params.scale_factor,
                self.params.min_neighbors,
                0,
                Size::new(self.params.min_size, self.params.min_size),
                Size::default(),
            )?;

            Ok(faces
                .iter()
                .map(|rect| BoundingBox::new(rect.x, rect.y, rect.width, rect.height))
                .collect())
        }
    }
}
