//! Weighted fusion of several member networks into one.

use crate::constants::FUSION_WEIGHT_SUM_TOLERANCE;
use crate::network::{LayerAccess, Network};
use crate::{Error, Result};
use log::{debug, info};
use ndarray::{Array2, Array4};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How fusion weights are checked when an ensemble is built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightPolicy {
    /// Weights must sum to one within a small tolerance
    #[default]
    RequireUnitSum,
    /// Weights are divided by their sum
    Normalize,
    /// Weights are used unchanged
    AsGiven,
}

/// Checked, possibly normalized fusion weights
fn resolve_weights(weights: Vec<f32>, policy: WeightPolicy) -> Result<Vec<f32>> {
    if let Some((index, weight)) = weights.iter().enumerate().find(|(_, w)| !w.is_finite()) {
        return Err(Error::EnsembleConfig(format!("Fusion weight {index} is not finite: {weight}")));
    }

    let sum: f32 = weights.iter().sum();
    match policy {
        WeightPolicy::RequireUnitSum => {
            if (sum - 1.0).abs() > FUSION_WEIGHT_SUM_TOLERANCE {
                return Err(Error::EnsembleConfig(format!("Fusion weights sum to {sum}, expected 1")));
            }
            Ok(weights)
        }
        WeightPolicy::Normalize => {
            if sum <= 0.0 {
                return Err(Error::EnsembleConfig(format!("Cannot normalize fusion weights summing to {sum}")));
            }
            Ok(weights.into_iter().map(|w| w / sum).collect())
        }
        WeightPolicy::AsGiven => Ok(weights),
    }
}

/// A nonempty list of networks whose outputs are combined by a weighted sum
pub struct FusionEnsemble {
    members: Vec<Arc<dyn Network>>,
    weights: Vec<f32>,
    attribution_member: Option<usize>,
}

impl FusionEnsemble {
    /// Build an ensemble
    ///
    /// # Errors
    ///
    /// Returns `Error::EnsembleConfig` if there are no members, the weight count differs from
    /// the member count, or the weights fail `policy`
    pub fn new(members: Vec<Arc<dyn Network>>, weights: Vec<f32>, policy: WeightPolicy) -> Result<Self> {
        if members.is_empty() {
            return Err(Error::EnsembleConfig("Ensemble needs at least one member".to_string()));
        }
        if weights.len() != members.len() {
            return Err(Error::EnsembleConfig(format!(
                "Got {} fusion weights for {} members",
                weights.len(),
                members.len()
            )));
        }

        let weights = resolve_weights(weights, policy)?;
        let attribution_member = members.iter().position(|member| member.layer_access().is_some());
        info!(
            "Built ensemble of {} members with weights {:?}",
            members.len(),
            weights
        );

        Ok(Self {
            members,
            weights,
            attribution_member,
        })
    }

    /// Use member `index` for gradient attribution
    ///
    /// # Errors
    ///
    /// Returns an error if the member does not exist or exposes no layer access
    pub fn with_attribution_member(mut self, index: usize) -> Result<Self> {
        let member = self
            .members
            .get(index)
            .ok_or_else(|| Error::EnsembleConfig(format!("No ensemble member {index}")))?;
        if member.layer_access().is_none() {
            return Err(Error::EnsembleConfig(format!(
                "Member {index} ({}) does not expose its layers",
                member.name()
            )));
        }
        self.attribution_member = Some(index);
        Ok(self)
    }

    #[must_use]
    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    #[must_use]
    pub fn members(&self) -> &[Arc<dyn Network>] {
        &self.members
    }

    #[must_use]
    pub fn attribution_member(&self) -> Option<usize> {
        self.attribution_member
    }
}

impl Network for FusionEnsemble {
    fn predict(&self, batch: &Array4<f32>) -> Result<Array2<f32>> {
        let mut fused: Option<Array2<f32>> = None;

        for (index, (member, &weight)) in self.members.iter().zip(&self.weights).enumerate() {
            let prediction = member.predict(batch)?;
            debug!("Member {} ({}) predicted shape {:?}", index, member.name(), prediction.shape());

            match fused.as_mut() {
                None => fused = Some(prediction * weight),
                Some(sum) => {
                    if sum.shape() != prediction.shape() {
                        return Err(Error::ShapeMismatch {
                            member: index,
                            expected: sum.shape().to_vec(),
                            found: prediction.shape().to_vec(),
                        });
                    }
                    sum.scaled_add(weight, &prediction);
                }
            }
        }

        fused.ok_or_else(|| Error::EnsembleConfig("Ensemble has no members".to_string()))
    }

    fn name(&self) -> &str {
        "fusion_ensemble"
    }

    fn layer_access(&self) -> Option<&dyn LayerAccess> {
        self.attribution_member
            .and_then(|index| self.members.get(index))
            .and_then(|member| member.layer_access())
    }
}
