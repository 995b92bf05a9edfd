//! Frame sampling from video sources.
//!
//! A [`FrameSampler`] picks evenly spaced frame indices across a [`VideoSource`] and decodes
//! only those. Opening failures and undecodable frames never abort sampling; they shrink
//! the returned sequence instead.

use crate::constants::DEFAULT_FRAME_COUNT;
use crate::types::Frame;
use crate::utils::image_conversion::rgb_image_to_frame;
use crate::{Error, Result};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};

/// Random-access source of decoded frames
pub trait VideoSource {
    /// Total number of frames reported by the source
    fn frame_count(&self) -> usize;

    /// Decode the frame at `index`
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be seeked to or decoded
    fn read_frame(&mut self, index: usize) -> Result<Frame>;
}

/// Evenly spaced indices from `0` to `total - 1` inclusive, at most `requested` of them
///
/// Indices are truncated toward zero, so for short videos neighbouring samples may
/// repeat an index when `requested` approaches `total`.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn sample_indices(total: usize, requested: usize) -> Vec<usize> {
    let count = requested.min(total);
    match count {
        0 => Vec::new(),
        1 => vec![0],
        _ => {
            let step = (total - 1) as f64 / (count - 1) as f64;
            (0..count)
                .map(|i| if i == count - 1 { total - 1 } else { (i as f64 * step) as usize })
                .collect()
        }
    }
}

/// Extracts an evenly spaced subset of frames from a video
#[derive(Debug, Clone)]
pub struct FrameSampler {
    frame_count: usize,
}

impl Default for FrameSampler {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_COUNT)
    }
}

impl FrameSampler {
    /// Create a sampler requesting `frame_count` frames per video
    #[must_use]
    pub fn new(frame_count: usize) -> Self {
        Self { frame_count }
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Sample frames from an already opened source, skipping frames that fail to decode
    pub fn extract(&self, source: &mut dyn VideoSource) -> Vec<Frame> {
        let indices = sample_indices(source.frame_count(), self.frame_count);
        let mut frames = Vec::with_capacity(indices.len());

        for index in indices {
            match source.read_frame(index) {
                Ok(frame) => frames.push(frame),
                Err(e) => warn!("Could not read frame at index {}: {}", index, e),
            }
        }

        debug!("Extracted {} frames", frames.len());
        frames
    }

    /// Open `path` and sample frames from it
    ///
    /// An unopenable source yields an empty sequence rather than an error.
    pub fn extract_from_path<P: AsRef<Path>>(&self, path: P) -> Vec<Frame> {
        let path = path.as_ref();
        match open_source(path) {
            Ok(mut source) => {
                let frames = self.extract(source.as_mut());
                info!("Extracted {} frames from {}", frames.len(), path.display());
                frames
            }
            Err(e) => {
                warn!("Could not open video source {}: {}", path.display(), e);
                Vec::new()
            }
        }
    }
}

/// Open a video source: directories are read as image sequences, files as containers
///
/// # Errors
///
/// Returns an error if the path does not exist or cannot be decoded by any backend
pub fn open_source(path: &Path) -> Result<Box<dyn VideoSource>> {
    if path.is_dir() {
        return Ok(Box::new(ImageSequence::open(path)?));
    }
    if !path.exists() {
        return Err(Error::InvalidInput(format!("Video not found: {}", path.display())));
    }

    #[cfg(feature = "opencv")]
    {
        Ok(Box::new(OpenCvVideo::open(path)?))
    }

    #[cfg(not(feature = "opencv"))]
    {
        Err(Error::InvalidInput(format!(
            "Decoding {} requires the `opencv` feature; pass a directory of frames instead",
            path.display()
        )))
    }
}

/// Frames already held in memory
#[derive(Debug, Clone, Default)]
pub struct FrameSequence {
    frames: Vec<Frame>,
}

impl FrameSequence {
    #[must_use]
    pub fn new(frames: Vec<Frame>) -> Self {
        Self { frames }
    }
}

impl VideoSource for FrameSequence {
    fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn read_frame(&mut self, index: usize) -> Result<Frame> {
        self.frames
            .get(index)
            .cloned()
            .ok_or_else(|| Error::InvalidInput(format!("Frame index {index} out of range")))
    }
}

/// Still images in a directory, ordered by file name
#[derive(Debug, Clone)]
pub struct ImageSequence {
    paths: Vec<PathBuf>,
}

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

impl ImageSequence {
    /// Index the image files of `dir`
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir.as_ref())?
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
            })
            .collect();
        paths.sort();

        debug!("Indexed {} images in {}", paths.len(), dir.as_ref().display());
        Ok(Self { paths })
    }
}

impl VideoSource for ImageSequence {
    fn frame_count(&self) -> usize {
        self.paths.len()
    }

    fn read_frame(&mut self, index: usize) -> Result<Frame> {
        let path = self
            .paths
            .get(index)
            .ok_or_else(|| Error::InvalidInput(format!("Frame index {index} out of range")))?;
        let image = image::open(path)?.to_rgb8();
        Ok(rgb_image_to_frame(&image))
    }
}

#[cfg(feature = "opencv")]
pub use opencv_source::OpenCvVideo;

#[cfg(feature = "opencv")]
mod opencv_source {
    use super::*;
    use crate::utils::image_conversion::mat_to_frame;
    use opencv::core::Mat;
    use opencv::prelude::*;
    use opencv::videoio::{self, VideoCapture, CAP_PROP_FRAME_COUNT, CAP_PROP_POS_FRAMES};

    /// Container video decoded through OpenCV
    pub struct OpenCvVideo {
        capture: VideoCapture,
        frame_count: usize,
    }

    impl OpenCvVideo {
        /// Open a video file
        ///
        /// # Errors
        ///
        /// Returns an error if OpenCV cannot open the file
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        pub fn open(path: &Path) -> Result<Self> {
            let capture = VideoCapture::from_file(&path.to_string_lossy(), videoio::CAP_ANY)?;
            if !capture.is_opened()? {
                return Err(Error::InvalidInput(format!(
                    "Could not open video file: {}",
                    path.display()
                )));
            }

            let total = capture.get(CAP_PROP_FRAME_COUNT)?;
            let frame_count = if total.is_finite() && total > 0.0 { total as usize } else { 0 };
            info!("Opened {} ({} frames)", path.display(), frame_count);

            Ok(Self { capture, frame_count })
        }
    }

    impl VideoSource for OpenCvVideo {
        fn frame_count(&self) -> usize {
            self.frame_count
        }

        #[allow(clippy::cast_precision_loss)]
        fn read_frame(&mut self, index: usize) -> Result<Frame> {
            self.capture.set(CAP_PROP_POS_FRAMES, index as f64)?;
            let mut mat = Mat::default();
            if !self.capture.read(&mut mat)? || mat.empty() {
                return Err(Error::InvalidInput(format!("Frame {index} could not be decoded")));
            }
            mat_to_frame(&mat)
        }
    }
}
