//! Visual explanations of a single face's prediction.
//!
//! Two independent explainers are provided:
//! - [`gradcam`]: activation maps weighted by output-score gradients
//! - [`lime`]: superpixel perturbation with a local linear surrogate
//!
//! [`explain_frame`] runs both and keeps their results apart, so one failing never hides
//! the other.

pub mod gradcam;
pub mod lime;
pub mod segmentation;

pub use gradcam::{SaliencyExplainer, SaliencySettings};
pub use lime::{PerturbationExplainer, PerturbationExplanation, PerturbationSettings};
pub use segmentation::{Segmentation, SlicSettings};

use crate::network::Network;
use crate::types::{Heatmap, NormalizedFace};
use crate::Result;
use log::warn;
use serde::{Deserialize, Serialize};

/// Settings for both explainers
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplainSettings {
    pub saliency: SaliencySettings,
    pub perturbation: PerturbationSettings,
}

/// Both explanations for one face
#[derive(Debug)]
pub struct Explanations {
    pub saliency: Result<Heatmap>,
    pub perturbation: Result<PerturbationExplanation>,
}

/// Run both explainers on `face`
#[must_use]
pub fn explain_frame(network: &dyn Network, face: &NormalizedFace, settings: &ExplainSettings) -> Explanations {
    let saliency = SaliencyExplainer::new(settings.saliency).explain(network, face);
    if let Err(e) = &saliency {
        warn!("Gradient saliency failed: {}", e);
    }

    let perturbation = PerturbationExplainer::new(settings.perturbation).explain(network, face);
    if let Err(e) = &perturbation {
        warn!("Perturbation explanation failed: {}", e);
    }

    Explanations { saliency, perturbation }
}
