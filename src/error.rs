//! Error types for the deepfake detection library.

use thiserror::Error;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    /// `OpenCV` operation failed
    #[cfg(feature = "opencv")]
    #[error("OpenCV error: {0}")]
    OpenCV(#[from] opencv::Error),

    /// `ONNX` Runtime inference failed
    #[cfg(feature = "onnx")]
    #[error("ONNX Runtime error: {0}")]
    OnnxRuntime(#[from] ort::OrtError),

    /// File I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decoding, resizing or encoding failed
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// Network weights could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Invalid input parameters provided
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Ensemble members produced predictions of different shapes
    #[error("Mismatch in member output shapes: member {member} = {found:?}, member 0 = {expected:?}")]
    ShapeMismatch {
        /// Index of the member whose output diverged
        member: usize,
        /// Output shape of the first member
        expected: Vec<usize>,
        /// Output shape of the offending member
        found: Vec<usize>,
    },

    /// Ensemble could not be assembled from the given members and weights
    #[error("Ensemble configuration error: {0}")]
    EnsembleConfig(String),

    /// Model loading or inference error
    #[error("Model error: {0}")]
    ModelError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Saliency or surrogate attribution failed
    #[error("Explainer error: {0}")]
    ExplainerError(String),
}

/// Convenience type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;
