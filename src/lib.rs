//! Deepfake detection library built on an ensemble of capsule networks.
//!
//! This library classifies a video as real or manipulated and explains the decision:
//! - Capsule networks with routing by agreement, evaluated on `ndarray` tensors
//! - Weighted fusion of several member networks
//! - `OpenCV` video decoding and Haar cascade face detection (feature `opencv`)
//! - `ONNX` Runtime ensemble members (feature `onnx`)
//!
//! The prediction pipeline consists of:
//! 1. Sampling evenly spaced frames from the video
//! 2. Cropping the largest face in each frame
//! 3. Equalizing local contrast on the lightness channel
//! 4. Scoring all faces in one batch through the fused network
//! 5. Majority vote over the per-frame scores
//!
//! Two explainers then work on a representative face: a gradient-weighted activation map
//! and a superpixel perturbation surrogate.
//!
//! # Examples
//!
//! ## Basic Usage
//!
//! ```no_run
//! use deepfake_detection::{config::Config, predictor::{Prediction, Predictor}};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_file("config.yaml")?;
//! config.validate()?;
//!
//! let ensemble = Arc::new(config.load_ensemble()?);
//! let predictor = Predictor::new(
//!     ensemble,
//!     config.create_sampler(),
//!     config.create_localizer(),
//!     config.create_normalizer(),
//!     config.predictor_settings(),
//! );
//!
//! match predictor.predict_video("videos/clip_frames")? {
//!     Prediction::Verdict(verdict) => {
//!         println!("{} ({:.3}) over {} frames", verdict.label, verdict.confidence, verdict.frames());
//!     }
//!     Prediction::NoSignal => println!("No faces detected"),
//!     Prediction::SourceUnavailable(reason) => println!("Could not open video: {reason}"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Explaining a Face
//!
//! ```no_run
//! use deepfake_detection::{
//!     explain::{explain_frame, ExplainSettings},
//!     network::CapsNet,
//!     render,
//! };
//! use ndarray::Array3;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let network = CapsNet::load("assets/capsnet.bin")?;
//! let face = Array3::<f32>::zeros((224, 224, 3));
//!
//! let explanations = explain_frame(&network, &face, &ExplainSettings::default());
//! if let Ok(heatmap) = &explanations.saliency {
//!     render::save_png(&render::heatmap_to_rgb(heatmap)?, "saliency.png")?;
//! }
//! if let Ok(perturbation) = &explanations.perturbation {
//!     let overlay = render::overlay_to_rgb(&perturbation.overlay)?;
//!     println!("{}", render::to_base64_png(&overlay)?);
//! }
//! # Ok(())
//! # }
//! ```

/// Frame sampling from videos and image sequences
pub mod video;

/// Face detection and cropping
pub mod face_detection;

/// Local contrast equalization
pub mod contrast;

/// Capsule nonlinearities and routing by agreement
pub mod capsule;

/// Network traits and the native capsule network
pub mod network;

/// `ONNX` Runtime ensemble members
#[cfg(feature = "onnx")]
pub mod onnx;

/// Weighted fusion of member networks
pub mod fusion;

/// Video-level prediction and voting
pub mod predictor;

/// Saliency and perturbation explainers
pub mod explain;

/// Heatmap colouring and image encoding
pub mod render;

/// Shared data types
pub mod types;

/// Utility functions for image conversion and numeric casts
pub mod utils;

/// Error types and result handling
pub mod error;

/// Constants used throughout the pipeline
pub mod constants;

/// Configuration management
pub mod config;

pub use error::{Error, Result};
