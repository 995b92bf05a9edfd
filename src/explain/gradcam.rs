//! Gradient-weighted class activation maps.

use crate::constants::DEFAULT_ATTRIBUTION_LAYER;
use crate::network::{LayerAccess, Network};
use crate::types::{Heatmap, NormalizedFace};
use crate::{Error, Result};
use log::debug;
use ndarray::{Array2, Array3, Axis, Ix3};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaliencySettings {
    /// Layer whose activations are attributed; negative values count from the end
    pub attribution_layer: isize,
    /// Output column whose score is explained
    pub target: usize,
}

impl Default for SaliencySettings {
    fn default() -> Self {
        Self {
            attribution_layer: DEFAULT_ATTRIBUTION_LAYER,
            target: 0,
        }
    }
}

/// Resolve the attribution layer, stepping back to the nearest spatial layer if needed
///
/// # Errors
///
/// Returns an error if the index is out of range or no spatial layer precedes it
pub fn resolve_attribution_layer(access: &dyn LayerAccess, index: isize) -> Result<usize> {
    let requested = access.resolve_layer(index)?;
    (0..=requested)
        .rev()
        .find(|&layer| access.layer_shape(layer).is_some_and(|shape| shape.len() == 3))
        .ok_or_else(|| Error::ExplainerError(format!("No spatial layer at or before layer {requested}")))
}

/// Bilinear resize with pixel-centre alignment
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn bilinear_resize(map: &Array2<f32>, height: usize, width: usize) -> Array2<f32> {
    let (src_h, src_w) = map.dim();
    if src_h == 0 || src_w == 0 {
        return Array2::zeros((height, width));
    }

    let sample = |dst: usize, scale: f32, len: usize| {
        let pos = ((dst as f32 + 0.5) * scale - 0.5).clamp(0.0, (len - 1) as f32);
        let lo = pos.floor() as usize;
        (lo, (lo + 1).min(len - 1), pos - lo as f32)
    };
    let (scale_y, scale_x) = (src_h as f32 / height as f32, src_w as f32 / width as f32);

    Array2::from_shape_fn((height, width), |(y, x)| {
        let (y0, y1, fy) = sample(y, scale_y, src_h);
        let (x0, x1, fx) = sample(x, scale_x, src_w);
        let top = map[[y0, x0]] * (1.0 - fx) + map[[y0, x1]] * fx;
        let bottom = map[[y1, x0]] * (1.0 - fx) + map[[y1, x1]] * fx;
        top * (1.0 - fy) + bottom * fy
    })
}

/// Combine activations and their gradients into a heatmap of the given size
///
/// Channels are weighted by their spatially averaged gradient and averaged, negative
/// evidence is clipped, and the map is scaled so its maximum is 1. A map with no positive
/// evidence is all zeros.
#[must_use]
pub fn heatmap_from_gradients(activations: &Array3<f32>, gradients: &Array3<f32>, size: (usize, usize)) -> Heatmap {
    let channel_weights = gradients
        .mean_axis(Axis(0))
        .and_then(|g| g.mean_axis(Axis(0)))
        .unwrap_or_else(|| ndarray::Array1::zeros(activations.len_of(Axis(2))));

    let weighted = activations * &channel_weights;
    let cam = weighted
        .mean_axis(Axis(2))
        .unwrap_or_else(|| Array2::zeros((activations.len_of(Axis(0)), activations.len_of(Axis(1)))))
        .mapv_into(|v| v.max(0.0));

    let heatmap = bilinear_resize(&cam, size.0, size.1);
    let max = heatmap.fold(0.0f32, |acc, &v| acc.max(v));
    if max > 0.0 {
        heatmap / max
    } else {
        Array2::zeros(size)
    }
}

/// Gradient-based saliency for one face
#[derive(Debug, Clone, Default)]
pub struct SaliencyExplainer {
    settings: SaliencySettings,
}

impl SaliencyExplainer {
    #[must_use]
    pub fn new(settings: SaliencySettings) -> Self {
        Self { settings }
    }

    /// Heatmap over `face` for the configured target score
    ///
    /// # Errors
    ///
    /// Returns an error if the network exposes no layers, the attribution layer is not
    /// usable, or the forward pass fails
    pub fn explain(&self, network: &dyn Network, face: &NormalizedFace) -> Result<Heatmap> {
        let access = network
            .layer_access()
            .ok_or_else(|| Error::ExplainerError(format!("Network {} does not expose its layers", network.name())))?;
        let layer = resolve_attribution_layer(access, self.settings.attribution_layer)?;
        debug!("Attributing {} at layer {}", network.name(), layer);

        let activations = access.activations(face, layer)?;
        let gradients = access.gradient(layer, &activations, self.settings.target)?;

        let to_map = |array: ndarray::ArrayD<f32>| {
            array
                .into_dimensionality::<Ix3>()
                .map_err(|e| Error::ExplainerError(format!("Layer {layer} is not a spatial map: {e}")))
        };
        let (activations, gradients) = (to_map(activations)?, to_map(gradients)?);

        let (height, width, _) = face.dim();
        Ok(heatmap_from_gradients(&activations, &gradients, (height, width)))
    }
}
