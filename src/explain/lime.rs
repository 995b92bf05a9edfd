//! Perturbation-based explanations from a locally fitted linear surrogate.
//!
//! The face is split into superpixels, random subsets of them are blanked out, and the
//! network's response to each variant is regressed on which superpixels were visible.
//! Superpixels with the largest positive coefficients are the explanation.

use super::segmentation::{mask_boundaries, slic, Segmentation, SlicSettings};
use crate::constants::{
    BOUNDARY_COLOR, DEFAULT_BATCH_SIZE, DEFAULT_HIDE_COLOR, DEFAULT_KERNEL_WIDTH, DEFAULT_NUM_SAMPLES,
    DEFAULT_RIDGE_ALPHA, DEFAULT_SEED, DEFAULT_TOP_K, EPSILON,
};
use crate::network::Network;
use crate::types::NormalizedFace;
use crate::{Error, Result};
use log::{debug, info};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, Array3, Array4, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerturbationSettings {
    /// Perturbed variants scored, including the unperturbed one
    pub num_samples: usize,
    /// Maximum number of segments kept in the explanation
    pub top_k: usize,
    /// Variants per network call
    pub batch_size: usize,
    pub kernel_width: f64,
    pub ridge_alpha: f64,
    /// Value written into hidden segments
    pub hide_color: f32,
    /// Brightness factor applied outside the selected segments in the overlay
    pub suppress_factor: f32,
    pub seed: u64,
    pub segmentation: SlicSettings,
}

impl Default for PerturbationSettings {
    fn default() -> Self {
        Self {
            num_samples: DEFAULT_NUM_SAMPLES,
            top_k: DEFAULT_TOP_K,
            batch_size: DEFAULT_BATCH_SIZE,
            kernel_width: DEFAULT_KERNEL_WIDTH,
            ridge_alpha: DEFAULT_RIDGE_ALPHA,
            hide_color: DEFAULT_HIDE_COLOR,
            suppress_factor: 0.0,
            seed: DEFAULT_SEED,
            segmentation: SlicSettings::default(),
        }
    }
}

/// Fitted local surrogate
#[derive(Debug, Clone, PartialEq)]
pub struct Surrogate {
    pub intercept: f64,
    pub coefficients: Vec<f64>,
    /// Weighted coefficient of determination on the sampled variants
    pub score: f64,
}

/// A perturbation explanation for one face
#[derive(Debug, Clone)]
pub struct PerturbationExplanation {
    /// The face with non-selected regions suppressed and selection boundaries drawn,
    /// unit-range BGR
    pub overlay: Array3<f32>,
    /// Pixels belonging to the selected segments
    pub mask: Array2<bool>,
    /// Selected segment ids with their surrogate coefficients, strongest first
    pub segments: Vec<(usize, f64)>,
    /// Output column that was explained
    pub target_class: usize,
    pub surrogate: Surrogate,
    pub segmentation: Segmentation,
}

/// Exponential kernel on cosine distance to the all-visible mask
fn sample_weights(masks: &Array2<f64>, kernel_width: f64) -> Array1<f64> {
    let features = masks.len_of(Axis(1));
    #[allow(clippy::cast_precision_loss)]
    let reference_norm = (features as f64).sqrt();

    masks.map_axis(Axis(1), |row| {
        let norm = row.dot(&row).sqrt();
        let distance = if norm < EPSILON || reference_norm < EPSILON {
            1.0
        } else {
            1.0 - row.sum() / (norm * reference_norm)
        };
        (-(distance * distance) / (kernel_width * kernel_width)).exp().sqrt()
    })
}

/// Weighted ridge regression with an unpenalized intercept
///
/// # Errors
///
/// Returns an error if the inputs disagree in length or the normal equations are singular
pub fn fit_surrogate(masks: &Array2<f64>, targets: &Array1<f64>, weights: &Array1<f64>, alpha: f64) -> Result<Surrogate> {
    let (samples, features) = masks.dim();
    if targets.len() != samples || weights.len() != samples || samples == 0 {
        return Err(Error::ExplainerError(format!(
            "Surrogate needs matching samples, got {} masks, {} targets, {} weights",
            samples,
            targets.len(),
            weights.len()
        )));
    }

    let total_weight = weights.sum();
    if total_weight < EPSILON {
        return Err(Error::ExplainerError("Surrogate sample weights are all zero".to_string()));
    }

    let mask_mean = masks.t().dot(weights) / total_weight;
    let target_mean = targets.dot(weights) / total_weight;

    let total_ss: f64 = targets.mapv(|t| (t - target_mean).powi(2)).dot(weights);
    if total_ss < EPSILON {
        return Ok(Surrogate {
            intercept: target_mean,
            coefficients: vec![0.0; features],
            score: 0.0,
        });
    }

    let centered = DMatrix::from_fn(samples, features, |i, j| masks[[i, j]] - mask_mean[j]);
    let residual = DVector::from_fn(samples, |i, _| targets[i] - target_mean);
    let w = DVector::from_fn(samples, |i, _| weights[i]);

    let weighted = DMatrix::from_fn(samples, features, |i, j| centered[(i, j)] * w[i]);
    let gram = weighted.transpose() * &centered + DMatrix::identity(features, features) * alpha;
    let rhs = weighted.transpose() * &residual;

    let beta = match gram.clone().cholesky() {
        Some(cholesky) => cholesky.solve(&rhs),
        None => gram
            .lu()
            .solve(&rhs)
            .ok_or_else(|| Error::ExplainerError("Surrogate normal equations are singular".to_string()))?,
    };

    let coefficients: Vec<f64> = beta.iter().copied().collect();
    let intercept = target_mean - mask_mean.iter().zip(&coefficients).map(|(m, b)| m * b).sum::<f64>();

    let fitted = masks.dot(&Array1::from(coefficients.clone())) + intercept;
    let residual_ss: f64 = (targets - &fitted).mapv(|r| r * r).dot(weights);
    let score = 1.0 - residual_ss / total_ss;

    Ok(Surrogate {
        intercept,
        coefficients,
        score,
    })
}

/// Ids of at most `top_k` segments with positive coefficients, strongest first
#[must_use]
pub fn top_positive_segments(coefficients: &[f64], top_k: usize) -> Vec<(usize, f64)> {
    let mut ranked: Vec<(usize, f64)> = coefficients
        .iter()
        .copied()
        .enumerate()
        .filter(|&(_, c)| c > 0.0)
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.truncate(top_k);
    ranked
}

/// Perturbation-based explanations for single faces
#[derive(Debug, Clone, Default)]
pub struct PerturbationExplainer {
    settings: PerturbationSettings,
}

impl PerturbationExplainer {
    #[must_use]
    pub fn new(settings: PerturbationSettings) -> Self {
        Self { settings }
    }

    /// Random visibility masks, the first one all visible
    fn sample_masks(&self, features: usize) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(self.settings.seed);
        let mut masks = Array2::from_shape_fn((self.settings.num_samples, features), |_| {
            if rng.gen_bool(0.5) {
                1.0
            } else {
                0.0
            }
        });
        if let Some(mut first) = masks.outer_iter_mut().next() {
            first.fill(1.0);
        }
        masks
    }

    fn perturb(&self, face: &NormalizedFace, segmentation: &Segmentation, mask: ndarray::ArrayView1<'_, f64>) -> Array3<f32> {
        let mut image = face.clone();
        for ((y, x), &label) in segmentation.labels().indexed_iter() {
            if mask[label] == 0.0 {
                image.slice_mut(ndarray::s![y, x, ..]).fill(self.settings.hide_color);
            }
        }
        image
    }

    /// Score every masked variant, one row of network output per mask
    fn score_variants(
        &self,
        network: &dyn Network,
        face: &NormalizedFace,
        segmentation: &Segmentation,
        masks: &Array2<f64>,
    ) -> Result<Array2<f32>> {
        let (height, width, channels) = face.dim();
        let batch_size = self.settings.batch_size.max(1);
        let mut rows = Vec::with_capacity(masks.nrows());

        for chunk in masks.axis_chunks_iter(Axis(0), batch_size) {
            let mut batch = Array4::zeros((chunk.nrows(), height, width, channels));
            for (mut slot, mask) in batch.outer_iter_mut().zip(chunk.outer_iter()) {
                slot.assign(&self.perturb(face, segmentation, mask));
            }
            let output = network.predict(&batch)?;
            rows.extend(output.outer_iter().map(|row| row.to_owned()));
        }

        let views: Vec<_> = rows.iter().map(|row| row.view()).collect();
        ndarray::stack(Axis(0), &views).map_err(|e| Error::ExplainerError(format!("Inconsistent predictions: {e}")))
    }

    fn overlay(&self, face: &NormalizedFace, mask: &Array2<bool>) -> Array3<f32> {
        let boundaries = mask_boundaries(mask);
        let mut overlay = face.clone();
        for ((y, x, c), value) in overlay.indexed_iter_mut() {
            if boundaries[[y, x]] {
                *value = BOUNDARY_COLOR[2 - c];
            } else if !mask[[y, x]] {
                *value *= self.settings.suppress_factor;
            }
        }
        overlay
    }

    /// Explain the network's top-class prediction on `face`
    ///
    /// # Errors
    ///
    /// Returns an error if segmentation fails, the network fails on a variant, or the
    /// surrogate cannot be fitted
    pub fn explain(&self, network: &dyn Network, face: &NormalizedFace) -> Result<PerturbationExplanation> {
        if self.settings.num_samples == 0 {
            return Err(Error::ExplainerError("Perturbation explainer needs at least one sample".to_string()));
        }

        let segmentation = slic(face.view(), &self.settings.segmentation)?;
        debug!("Segmented face into {} superpixels", segmentation.count());

        let masks = self.sample_masks(segmentation.count());
        let predictions = self.score_variants(network, face, &segmentation, &masks)?;

        let target_class = predictions
            .row(0)
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(class, _)| class)
            .ok_or_else(|| Error::ExplainerError("Network returned no scores".to_string()))?;

        let targets = predictions.column(target_class).mapv(f64::from);
        let weights = sample_weights(&masks, self.settings.kernel_width);
        let surrogate = fit_surrogate(&masks, &targets, &weights, self.settings.ridge_alpha)?;

        let segments = top_positive_segments(&surrogate.coefficients, self.settings.top_k);
        let mut selected = vec![false; segmentation.count()];
        for &(segment, _) in &segments {
            selected[segment] = true;
        }
        let mask = segmentation.mask(&selected);

        info!(
            "Perturbation explanation kept {} segments for class {} (local fit {:.3})",
            segments.len(),
            target_class,
            surrogate.score
        );

        Ok(PerturbationExplanation {
            overlay: self.overlay(face, &mask),
            mask,
            segments,
            target_class,
            surrogate,
            segmentation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovers_linear_model() {
        let mut rng = StdRng::seed_from_u64(7);
        let masks = Array2::from_shape_fn((400, 3), |_| if rng.gen_bool(0.5) { 1.0 } else { 0.0 });
        let targets = masks.map_axis(Axis(1), |row| 0.2 + 0.5 * row[0] - 0.3 * row[2]);
        let weights = Array1::ones(400);

        let surrogate = fit_surrogate(&masks, &targets, &weights, 1e-6).unwrap();
        assert!((surrogate.coefficients[0] - 0.5).abs() < 1e-4);
        assert!(surrogate.coefficients[1].abs() < 1e-4);
        assert!((surrogate.coefficients[2] + 0.3).abs() < 1e-4);
        assert!((surrogate.intercept - 0.2).abs() < 1e-4);
        assert!(surrogate.score > 0.999);
    }

    #[test]
    fn test_top_positive_segments_only_positive() {
        let ranked = top_positive_segments(&[0.1, -0.5, 0.4, 0.0, 0.2], 5);
        assert_eq!(ranked.iter().map(|r| r.0).collect::<Vec<_>>(), vec![2, 4, 0]);
        assert_eq!(top_positive_segments(&[0.3, 0.2, 0.1], 2).len(), 2);
    }

    #[test]
    fn test_sample_weights_peak_at_full_mask() {
        let masks = ndarray::array![[1.0, 1.0, 1.0, 1.0], [1.0, 1.0, 0.0, 0.0], [0.0, 0.0, 0.0, 0.0]];
        let weights = sample_weights(&masks, 0.25);
        assert!((weights[0] - 1.0).abs() < 1e-12);
        assert!(weights[1] < weights[0]);
        assert!(weights[2] < weights[1]);
    }

    #[test]
    fn test_first_mask_all_visible_and_seeded() {
        let explainer = PerturbationExplainer::new(PerturbationSettings {
            num_samples: 20,
            ..PerturbationSettings::default()
        });
        let masks = explainer.sample_masks(6);
        assert!(masks.row(0).iter().all(|&m| m == 1.0));
        assert_eq!(masks, explainer.sample_masks(6));
    }
}
