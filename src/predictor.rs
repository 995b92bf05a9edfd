//! Video-level prediction: sampling, face preparation, batched inference and voting.

use crate::constants::FAKE_THRESHOLD;
use crate::contrast::{to_unit_range, ContrastNormalizer};
use crate::face_detection::FaceLocalizer;
use crate::network::Network;
use crate::types::{Frame, NormalizedFace};
use crate::utils::image_conversion::faces_to_batch;
use crate::video::{open_source, FrameSampler, VideoSource};
use crate::{Error, Result};
use log::{debug, info, warn};
use ndarray::Axis;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Verdict for a video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Label {
    Real,
    Fake,
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Real => write!(f, "Real"),
            Self::Fake => write!(f, "Fake"),
        }
    }
}

/// Label chosen when exactly half the frames vote fake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    #[default]
    Fake,
    Real,
}

impl From<TieBreak> for Label {
    fn from(tie: TieBreak) -> Self {
        match tie {
            TieBreak::Fake => Self::Fake,
            TieBreak::Real => Self::Real,
        }
    }
}

/// Majority vote over per-frame scores, each frame voting fake when its score exceeds `threshold`
///
/// Returns `None` for an empty score list.
#[must_use]
pub fn majority_vote(scores: &[f32], threshold: f32, tie: TieBreak) -> Option<Label> {
    if scores.is_empty() {
        return None;
    }

    let fake_votes = scores.iter().filter(|&&score| score > threshold).count();
    let real_votes = scores.len() - fake_votes;
    Some(match fake_votes.cmp(&real_votes) {
        std::cmp::Ordering::Greater => Label::Fake,
        std::cmp::Ordering::Less => Label::Real,
        std::cmp::Ordering::Equal => tie.into(),
    })
}

/// Outcome of a successful prediction
#[derive(Debug, Clone)]
pub struct Verdict {
    pub label: Label,
    /// Mean raw score over the usable frames
    pub confidence: f32,
    /// Per-frame scores, in frame order
    pub scores: Vec<f32>,
    /// The normalized faces that were scored, in frame order
    pub faces: Vec<NormalizedFace>,
    /// Frames that went through a fallback path (whole-frame resize or skipped equalization)
    pub degraded_frames: usize,
}

impl Verdict {
    /// Number of frames that contributed to the verdict
    #[must_use]
    pub fn frames(&self) -> usize {
        self.scores.len()
    }

    /// The face handed to the explainers
    #[must_use]
    pub fn representative_face(&self) -> Option<&NormalizedFace> {
        self.faces.first()
    }
}

/// Result of [`Predictor::predict_video`]
#[derive(Debug, Clone)]
pub enum Prediction {
    Verdict(Verdict),
    /// No frame contained a usable face
    NoSignal,
    /// The video could not be opened or decoded
    SourceUnavailable(String),
}

/// Tunables for [`Predictor`]
#[derive(Debug, Clone, Copy)]
pub struct PredictorSettings {
    pub threshold: f32,
    pub tie_break: TieBreak,
    /// Column of the network output holding the fake probability
    pub score_index: usize,
}

impl Default for PredictorSettings {
    fn default() -> Self {
        Self {
            threshold: FAKE_THRESHOLD,
            tie_break: TieBreak::default(),
            score_index: 0,
        }
    }
}

/// Runs the full pipeline from video to verdict
pub struct Predictor {
    network: Arc<dyn Network>,
    sampler: FrameSampler,
    localizer: FaceLocalizer,
    normalizer: ContrastNormalizer,
    settings: PredictorSettings,
}

impl Predictor {
    #[must_use]
    pub fn new(
        network: Arc<dyn Network>,
        sampler: FrameSampler,
        localizer: FaceLocalizer,
        normalizer: ContrastNormalizer,
        settings: PredictorSettings,
    ) -> Self {
        Self {
            network,
            sampler,
            localizer,
            normalizer,
            settings,
        }
    }

    /// Predictor with default sampling, no face detector and default contrast settings
    #[must_use]
    pub fn with_network(network: Arc<dyn Network>) -> Self {
        Self::new(
            network,
            FrameSampler::default(),
            FaceLocalizer::default(),
            ContrastNormalizer::default(),
            PredictorSettings::default(),
        )
    }

    #[must_use]
    pub fn network(&self) -> &Arc<dyn Network> {
        &self.network
    }

    /// Predict from a video file or frame directory
    ///
    /// An unopenable source yields [`Prediction::SourceUnavailable`].
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails
    pub fn predict_video<P: AsRef<Path>>(&self, path: P) -> Result<Prediction> {
        let path = path.as_ref();
        match open_source(path) {
            Ok(mut source) => self.predict_source(source.as_mut()),
            Err(e) => {
                warn!("Could not open video source {}: {}", path.display(), e);
                Ok(Prediction::SourceUnavailable(e.to_string()))
            }
        }
    }

    /// Predict from an opened video source
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails
    pub fn predict_source(&self, source: &mut dyn VideoSource) -> Result<Prediction> {
        let frames = self.sampler.extract(source);
        self.predict_frames(&frames)
    }

    /// Predict from already sampled frames
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails or the network output has no score column
    pub fn predict_frames(&self, frames: &[Frame]) -> Result<Prediction> {
        let mut faces = Vec::with_capacity(frames.len());
        let mut degraded_frames = 0;

        for (index, frame) in frames.iter().enumerate() {
            if let Some((face, degraded)) = self.prepare_face(index, frame) {
                faces.push(face);
                degraded_frames += usize::from(degraded);
            }
        }

        if faces.is_empty() {
            info!("No usable faces in {} frames", frames.len());
            return Ok(Prediction::NoSignal);
        }

        let batch = faces_to_batch(&faces)?;
        let output = self.network.predict(&batch)?;
        if self.settings.score_index >= output.len_of(Axis(1)) {
            return Err(Error::ModelError(format!(
                "Score column {} out of range for network output of shape {:?}",
                self.settings.score_index,
                output.shape()
            )));
        }
        let scores: Vec<f32> = output.column(self.settings.score_index).to_vec();
        debug!("Per-frame scores: {:?}", scores);

        let Some(label) = majority_vote(&scores, self.settings.threshold, self.settings.tie_break) else {
            return Ok(Prediction::NoSignal);
        };
        #[allow(clippy::cast_precision_loss)]
        let confidence = scores.iter().sum::<f32>() / scores.len() as f32;

        info!(
            "Prediction {} with confidence {:.4} over {} frames ({} degraded)",
            label,
            confidence,
            scores.len(),
            degraded_frames
        );

        Ok(Prediction::Verdict(Verdict {
            label,
            confidence,
            scores,
            faces,
            degraded_frames,
        }))
    }

    /// Localize and normalize one frame, returning the face and whether any step degraded
    fn prepare_face(&self, index: usize, frame: &Frame) -> Option<(NormalizedFace, bool)> {
        let localized = match self.localizer.localize(frame) {
            Ok(localized) => localized,
            Err(e) => {
                warn!("Skipping frame {}: {}", index, e);
                return None;
            }
        };

        let whole_frame = localized.is_degraded();
        let crop = localized.into_crop()?;
        let normalized = self.normalizer.normalize(&crop);
        let degraded = whole_frame || normalized.is_degraded();
        Some((to_unit_range(&normalized.into_inner()), degraded))
    }
}
