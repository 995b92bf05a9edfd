//! Configuration management for the detection pipeline

use crate::constants::{
    CASCADE_MIN_FACE_SIZE, CASCADE_MIN_NEIGHBORS, CASCADE_SCALE_FACTOR, CLAHE_CLIP_LIMIT, CLAHE_TILE_GRID,
    DEFAULT_FRAME_COUNT, DEFAULT_TARGET_SIZE, FAKE_THRESHOLD,
};
use crate::contrast::ContrastNormalizer;
use crate::explain::ExplainSettings;
use crate::face_detection::{load_detector, CascadeParams, FaceLocalizer};
use crate::fusion::{FusionEnsemble, WeightPolicy};
use crate::network::{CapsNet, Network};
use crate::predictor::{PredictorSettings, TieBreak};
use crate::video::FrameSampler;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Ensemble members and fusion weights
    pub models: ModelConfig,

    /// Frame sampling
    pub sampling: SamplingConfig,

    /// Face detection and cropping
    pub face_detection: FaceDetectionConfig,

    /// Local contrast equalization
    pub contrast: ContrastConfig,

    /// Vote aggregation
    pub prediction: PredictionConfig,

    /// Saliency and perturbation explainers
    pub explain: ExplainSettings,
}

/// Serialized network format of an ensemble member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Bincode-serialized capsule network
    #[default]
    Native,
    /// `ONNX` model, requires the `onnx` feature
    Onnx,
}

/// One ensemble member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberConfig {
    /// Path to the serialized network
    pub path: PathBuf,

    /// Fusion weight
    pub weight: f32,

    #[serde(default)]
    pub kind: ModelKind,

    /// `ONNX` input layout is `(batch, channels, height, width)`
    #[serde(default)]
    pub channels_first: bool,
}

/// Ensemble configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub members: Vec<MemberConfig>,

    /// How fusion weights are checked
    pub weight_policy: WeightPolicy,

    /// Member used for gradient saliency; defaults to the first one exposing its layers
    pub attribution_member: Option<usize>,
}

/// Frame sampling parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Frames sampled per video
    pub frame_count: usize,
}

/// Face detection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceDetectionConfig {
    /// Haar cascade XML; without one every frame is resized whole
    pub cascade: Option<PathBuf>,

    /// Side of the square face crop
    pub target_size: u32,

    /// Cascade pyramid scale step
    pub scale_factor: f64,

    /// Neighbouring detections required to keep a candidate
    pub min_neighbors: i32,

    /// Smallest face considered, in pixels
    pub min_face_size: i32,
}

/// Contrast equalization parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContrastConfig {
    pub clip_limit: f32,
    pub tile_grid: usize,
}

/// Vote aggregation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    /// Score above which a frame votes fake (0.0-1.0)
    pub threshold: f32,

    /// Verdict when the vote is split evenly
    pub tie_break: TieBreak,

    /// Network output column holding the fake probability
    pub score_index: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            members: vec![MemberConfig {
                path: PathBuf::from("assets/capsnet.bin"),
                weight: 1.0,
                kind: ModelKind::Native,
                channels_first: false,
            }],
            weight_policy: WeightPolicy::default(),
            attribution_member: None,
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            frame_count: DEFAULT_FRAME_COUNT,
        }
    }
}

impl Default for FaceDetectionConfig {
    fn default() -> Self {
        Self {
            cascade: Some(PathBuf::from("assets/haarcascade_frontalface_default.xml")),
            target_size: DEFAULT_TARGET_SIZE,
            scale_factor: CASCADE_SCALE_FACTOR,
            min_neighbors: CASCADE_MIN_NEIGHBORS,
            min_face_size: CASCADE_MIN_FACE_SIZE,
        }
    }
}

impl Default for ContrastConfig {
    fn default() -> Self {
        Self {
            clip_limit: CLAHE_CLIP_LIMIT,
            tile_grid: CLAHE_TILE_GRID,
        }
    }
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            threshold: FAKE_THRESHOLD,
            tie_break: TieBreak::default(),
            score_index: 0,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content).map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))
    }

    /// Save configuration to a YAML file
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            serde_yaml::to_string(self).map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    ///
    /// Model files are not checked here; a missing model surfaces when the ensemble loads.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting
    pub fn validate(&self) -> Result<()> {
        if self.models.members.is_empty() {
            return Err(Error::ConfigError("At least one model member is required".to_string()));
        }
        if let Some(index) = self.models.attribution_member {
            if index >= self.models.members.len() {
                return Err(Error::ConfigError(format!(
                    "Attribution member {index} out of range for {} members",
                    self.models.members.len()
                )));
            }
        }

        if self.sampling.frame_count == 0 {
            return Err(Error::ConfigError("Frame count must be greater than 0".to_string()));
        }

        if self.face_detection.target_size == 0 {
            return Err(Error::ConfigError("Face target size must be greater than 0".to_string()));
        }
        if self.face_detection.scale_factor <= 1.0 {
            return Err(Error::ConfigError("Cascade scale factor must be greater than 1.0".to_string()));
        }

        if !(self.contrast.clip_limit > 0.0) {
            return Err(Error::ConfigError("Contrast clip limit must be positive".to_string()));
        }
        if self.contrast.tile_grid == 0 {
            return Err(Error::ConfigError("Contrast tile grid must be greater than 0".to_string()));
        }

        if !(0.0..=1.0).contains(&self.prediction.threshold) {
            return Err(Error::ConfigError("Prediction threshold must be between 0.0 and 1.0".to_string()));
        }

        let perturbation = &self.explain.perturbation;
        if perturbation.num_samples == 0 || perturbation.batch_size == 0 {
            return Err(Error::ConfigError(
                "Perturbation sample count and batch size must be greater than 0".to_string(),
            ));
        }
        if !(perturbation.kernel_width > 0.0) || perturbation.ridge_alpha < 0.0 {
            return Err(Error::ConfigError(
                "Perturbation kernel width must be positive and ridge alpha non-negative".to_string(),
            ));
        }
        if perturbation.segmentation.num_segments == 0 {
            return Err(Error::ConfigError("Segment count must be greater than 0".to_string()));
        }

        Ok(())
    }

    /// Frame sampler from configuration
    #[must_use]
    pub fn create_sampler(&self) -> FrameSampler {
        FrameSampler::new(self.sampling.frame_count)
    }

    /// Face localizer from configuration, degrading to whole-frame crops if the cascade
    /// cannot be loaded
    #[must_use]
    pub fn create_localizer(&self) -> FaceLocalizer {
        let detection = &self.face_detection;
        let params = CascadeParams {
            scale_factor: detection.scale_factor,
            min_neighbors: detection.min_neighbors,
            min_size: detection.min_face_size,
        };
        let detector = load_detector(detection.cascade.as_deref(), params);

        FaceLocalizer::from_option(detector, detection.target_size)
    }

    /// Contrast normalizer from configuration
    #[must_use]
    pub fn create_normalizer(&self) -> ContrastNormalizer {
        ContrastNormalizer::new(self.contrast.clip_limit, self.contrast.tile_grid)
    }

    /// Predictor settings from configuration
    #[must_use]
    pub fn predictor_settings(&self) -> PredictorSettings {
        PredictorSettings {
            threshold: self.prediction.threshold,
            tie_break: self.prediction.tie_break,
            score_index: self.prediction.score_index,
        }
    }

    /// Load every member and build the fused network
    ///
    /// # Errors
    ///
    /// Returns an error if a member cannot be loaded or the fusion weights are invalid
    pub fn load_ensemble(&self) -> Result<FusionEnsemble> {
        let members = self
            .models
            .members
            .iter()
            .map(load_member)
            .collect::<Result<Vec<_>>>()?;
        let weights = self.models.members.iter().map(|member| member.weight).collect();

        let ensemble = FusionEnsemble::new(members, weights, self.models.weight_policy)?;
        match self.models.attribution_member {
            Some(index) => ensemble.with_attribution_member(index),
            None => Ok(ensemble),
        }
    }
}

/// Load one ensemble member
///
/// # Errors
///
/// Returns an error if the file cannot be loaded, or if it is an `ONNX` member and the
/// `onnx` feature is disabled
pub fn load_member(member: &MemberConfig) -> Result<Arc<dyn Network>> {
    match member.kind {
        ModelKind::Native => Ok(Arc::new(CapsNet::load(&member.path)?)),
        #[cfg(feature = "onnx")]
        ModelKind::Onnx => Ok(Arc::new(crate::onnx::OnnxNetwork::new(&member.path, member.channels_first)?)),
        #[cfg(not(feature = "onnx"))]
        ModelKind::Onnx => Err(Error::ConfigError(format!(
            "Model {} is ONNX, but this build lacks the `onnx` feature",
            member.path.display()
        ))),
    }
}

/// Example configuration file content
pub const EXAMPLE_CONFIG: &str = r#"# Deepfake Detection Configuration

# Ensemble members, fused by a weighted sum of their outputs
models:
  members:
    - path: "assets/capsnet_a.bin"
      weight: 0.6
    - path: "assets/capsnet_b.bin"
      weight: 0.4
  weight_policy: require_unit_sum

# Frames sampled evenly across each video
sampling:
  frame_count: 7

# Face detection
face_detection:
  cascade: "assets/haarcascade_frontalface_default.xml"
  target_size: 224
  scale_factor: 1.1
  min_neighbors: 5
  min_face_size: 30

# Contrast limited adaptive histogram equalization
contrast:
  clip_limit: 2.0
  tile_grid: 8

# Vote aggregation
prediction:
  threshold: 0.5
  tie_break: fake
  score_index: 0

# Explanations
explain:
  saliency:
    attribution_layer: -3
    target: 0
  perturbation:
    num_samples: 1000
    top_k: 5
    batch_size: 10
    kernel_width: 0.25
    ridge_alpha: 1.0
    hide_color: 0.0
    suppress_factor: 0.0
    seed: 42
    segmentation:
      num_segments: 50
      compactness: 10.0
      iterations: 10
"#;
