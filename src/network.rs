//! Network abstractions and the native capsule network.
//!
//! [`Network`] is the boundary the pipeline sees: a batch of normalized faces in, one row of
//! class scores per face out. Networks that can also be split at an inner layer implement
//! [`LayerAccess`], which is what the gradient explainer needs.
//!
//! [`CapsNet`] is a sequential network evaluated directly on `ndarray` tensors:
//! convolutions extract local features, a primary-capsule reshape groups them into pose
//! vectors, routing layers map those to class capsules, and a length readout turns class
//! poses into presence probabilities.

use crate::capsule::{length, squash_backward, squash_rows, CapsuleLayer};
use crate::constants::GRADIENT_STEP;
use crate::{Error, Result};
use log::info;
use ndarray::{s, Array1, Array2, Array3, Array4, ArrayD, ArrayView3, Axis, Ix1, Ix2, Ix3, Zip};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// A trained classifier over batches of normalized faces
///
/// Loaded networks are shared read-only between requests, so prediction takes `&self`.
pub trait Network: Send + Sync {
    /// Score a `(batch, height, width, channels)` tensor, returning `(batch, classes)`
    ///
    /// # Errors
    ///
    /// Returns an error if the batch has the wrong shape or inference fails
    fn predict(&self, batch: &Array4<f32>) -> Result<Array2<f32>>;

    /// Human readable name used in logs
    fn name(&self) -> &str {
        "network"
    }

    /// Inner-layer access, if this network supports it
    fn layer_access(&self) -> Option<&dyn LayerAccess> {
        None
    }
}

/// Addressable inner layers of a network, evaluated one image at a time
pub trait LayerAccess {
    /// Number of layers
    fn layer_count(&self) -> usize;

    /// Shape of the activations produced by `layer`
    fn layer_shape(&self, layer: usize) -> Option<Vec<usize>>;

    /// Run the network on one `(height, width, channels)` image up to and including `layer`
    ///
    /// # Errors
    ///
    /// Returns an error if the layer does not exist or the input has the wrong shape
    fn activations(&self, input: &Array3<f32>, layer: usize) -> Result<ArrayD<f32>>;

    /// Continue the forward pass from the activations of `layer` to the class scores
    ///
    /// # Errors
    ///
    /// Returns an error if the layer does not exist or the activations have the wrong shape
    fn forward_from(&self, layer: usize, activations: &ArrayD<f32>) -> Result<Array1<f32>>;

    /// Gradient of class score `target` with respect to the activations of `layer`
    ///
    /// # Errors
    ///
    /// Returns an error if the layer does not exist, the activations have the wrong shape,
    /// or `target` is out of range
    fn gradient(&self, layer: usize, activations: &ArrayD<f32>, target: usize) -> Result<ArrayD<f32>>;

    /// Resolve a possibly negative layer index (`-1` is the last layer)
    ///
    /// # Errors
    ///
    /// Returns an error if the index is out of range
    fn resolve_layer(&self, index: isize) -> Result<usize> {
        let count = self.layer_count();
        let resolved = if index < 0 { count.checked_sub(index.unsigned_abs()) } else { Some(index.unsigned_abs()) };
        resolved
            .filter(|&layer| layer < count)
            .ok_or_else(|| Error::InvalidInput(format!("Layer index {index} out of range for {count} layers")))
    }

    /// Deepest layer whose activations are spatial `(height, width, channels)` maps
    fn last_spatial_layer(&self) -> Option<usize> {
        (0..self.layer_count())
            .rev()
            .find(|&layer| self.layer_shape(layer).is_some_and(|shape| shape.len() == 3))
    }
}

/// Central-difference gradient of class score `target` over [`LayerAccess::forward_from`]
///
/// Two forward passes per activation element, so only suitable for checking analytic
/// [`LayerAccess::gradient`] implementations on small networks.
///
/// # Errors
///
/// Returns an error if the forward pass fails or `target` is out of range
pub fn numeric_gradient(
    access: &dyn LayerAccess,
    layer: usize,
    activations: &ArrayD<f32>,
    target: usize,
) -> Result<ArrayD<f32>> {
    let score = |perturbed: &ArrayD<f32>| -> Result<f32> {
        let scores = access.forward_from(layer, perturbed)?;
        scores.get(target).copied().ok_or_else(|| {
            Error::InvalidInput(format!("Target class {target} out of range for {} scores", scores.len()))
        })
    };

    let mut gradient = ArrayD::zeros(activations.raw_dim());
    let mut perturbed = activations.clone();
    for (index, grad) in gradient.indexed_iter_mut() {
        let original = perturbed[&index];
        perturbed[&index] = original + GRADIENT_STEP;
        let above = score(&perturbed)?;
        perturbed[&index] = original - GRADIENT_STEP;
        let below = score(&perturbed)?;
        perturbed[&index] = original;
        *grad = (above - below) / (2.0 * GRADIENT_STEP);
    }
    Ok(gradient)
}

/// One stage of a [`CapsNet`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Layer {
    /// Valid-padding convolution, kernel shape (kernel h, kernel w, in channels, out channels)
    Conv2d {
        kernel: Array4<f32>,
        bias: Array1<f32>,
        stride: usize,
    },
    /// Elementwise `max(x, 0)`
    Relu,
    /// Non-overlapping max pooling over `size` × `size` windows
    MaxPool { size: usize },
    /// Regroup a feature map into `dim`-dimensional pose vectors and squash them
    PrimaryCaps { dim: usize },
    /// Routing by agreement to the next set of capsules
    Capsule(CapsuleLayer),
    /// Capsule lengths as class presence probabilities
    Length,
}

impl Layer {
    fn kind(&self) -> &'static str {
        match self {
            Self::Conv2d { .. } => "conv2d",
            Self::Relu => "relu",
            Self::MaxPool { .. } => "max_pool",
            Self::PrimaryCaps { .. } => "primary_caps",
            Self::Capsule(_) => "capsule",
            Self::Length => "length",
        }
    }

    /// Output shape for a given input shape, or an error describing the mismatch
    fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>> {
        let mismatch = |expected: &str| {
            Error::InvalidInput(format!("{} layer expects {expected}, got shape {input:?}", self.kind()))
        };

        match self {
            Self::Conv2d { kernel, bias, stride } => {
                let &[height, width, channels] = input else {
                    return Err(mismatch("a (height, width, channels) map"));
                };
                let (kh, kw, cin, cout) = kernel.dim();
                if cin != channels || kh == 0 || kw == 0 || kh > height || kw > width {
                    return Err(mismatch(&format!("{kh}x{kw} kernel over {cin} channels")));
                }
                if bias.len() != cout || *stride == 0 {
                    return Err(mismatch(&format!("{cout} biases and a positive stride")));
                }
                Ok(vec![(height - kh) / stride + 1, (width - kw) / stride + 1, cout])
            }
            Self::Relu => Ok(input.to_vec()),
            Self::MaxPool { size } => {
                let &[height, width, channels] = input else {
                    return Err(mismatch("a (height, width, channels) map"));
                };
                if *size == 0 || *size > height || *size > width {
                    return Err(mismatch(&format!("a map of at least {size}x{size}")));
                }
                Ok(vec![height / size, width / size, channels])
            }
            Self::PrimaryCaps { dim } => {
                let total: usize = input.iter().product();
                if input.len() != 3 || *dim == 0 || total % dim != 0 {
                    return Err(mismatch(&format!("a map divisible into {dim}-dimensional capsules")));
                }
                Ok(vec![total / dim, *dim])
            }
            Self::Capsule(layer) => {
                layer.validate()?;
                let &[capsules, dim] = input else {
                    return Err(mismatch("(capsules, dim) poses"));
                };
                layer.check_input(capsules, dim)?;
                Ok(vec![layer.num_capsules(), layer.dim_capsule()])
            }
            Self::Length => {
                let &[capsules, _] = input else {
                    return Err(mismatch("(capsules, dim) poses"));
                };
                Ok(vec![capsules])
            }
        }
    }

    fn forward(&self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let as_dim = |e: ndarray::ShapeError| Error::ModelError(format!("{} layer: {e}", self.kind()));

        match self {
            Self::Conv2d { kernel, bias, stride } => {
                let map = input.into_dimensionality::<Ix3>().map_err(as_dim)?;
                Ok(conv2d(&map, kernel, bias, *stride)?.into_dyn())
            }
            Self::Relu => Ok(input.mapv_into(|x| x.max(0.0))),
            Self::MaxPool { size } => {
                let map = input.into_dimensionality::<Ix3>().map_err(as_dim)?;
                Ok(max_pool(&map, *size).into_dyn())
            }
            Self::PrimaryCaps { dim } => {
                let total = input.len();
                let poses = input
                    .as_standard_layout()
                    .into_owned()
                    .into_shape((total / dim, *dim))
                    .map_err(as_dim)?;
                Ok(squash_rows(poses.view()).into_dyn())
            }
            Self::Capsule(layer) => {
                let poses = input.into_dimensionality::<Ix2>().map_err(as_dim)?;
                Ok(layer.route(poses.view())?.into_dyn())
            }
            Self::Length => {
                let poses = input.into_dimensionality::<Ix2>().map_err(as_dim)?;
                Ok(length(poses.view()).into_dyn())
            }
        }
    }

    /// Gradient with respect to this layer's input, given the gradient of its output
    fn backward(&self, input: &ArrayD<f32>, grad_output: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let as_dim = |e: ndarray::ShapeError| Error::ModelError(format!("{} layer: {e}", self.kind()));

        match self {
            Self::Conv2d { kernel, stride, .. } => {
                let map = input.view().into_dimensionality::<Ix3>().map_err(as_dim)?;
                let grad = grad_output.into_dimensionality::<Ix3>().map_err(as_dim)?;
                Ok(conv2d_backward(map.dim(), &grad, kernel, *stride)?.into_dyn())
            }
            Self::Relu => Ok(Zip::from(&grad_output)
                .and(input)
                .map_collect(|&g, &x| if x > 0.0 { g } else { 0.0 })),
            Self::MaxPool { size } => {
                let map = input.view().into_dimensionality::<Ix3>().map_err(as_dim)?;
                let grad = grad_output.into_dimensionality::<Ix3>().map_err(as_dim)?;
                Ok(max_pool_backward(&map, &grad, *size).into_dyn())
            }
            Self::PrimaryCaps { dim } => {
                let total = input.len();
                let poses = input
                    .as_standard_layout()
                    .into_owned()
                    .into_shape((total / dim, *dim))
                    .map_err(as_dim)?;
                let grad = grad_output.into_dimensionality::<Ix2>().map_err(as_dim)?;
                let mut grad_poses = Array2::zeros(poses.raw_dim());
                for ((mut out, pose), g) in grad_poses.outer_iter_mut().zip(poses.outer_iter()).zip(grad.outer_iter()) {
                    out.assign(&squash_backward(pose, g));
                }
                grad_poses.into_shape(input.raw_dim()).map_err(as_dim)
            }
            Self::Capsule(layer) => {
                let poses = input.view().into_dimensionality::<Ix2>().map_err(as_dim)?;
                let grad = grad_output.into_dimensionality::<Ix2>().map_err(as_dim)?;
                Ok(layer.backward(poses, grad.view())?.into_dyn())
            }
            Self::Length => {
                let poses = input.view().into_dimensionality::<Ix2>().map_err(as_dim)?;
                let grad = grad_output.into_dimensionality::<Ix1>().map_err(as_dim)?;
                let lengths = length(poses);
                let mut grad_poses = poses.to_owned();
                for ((mut row, &norm), &g) in grad_poses.outer_iter_mut().zip(lengths.iter()).zip(grad.iter()) {
                    let scale = if norm > 0.0 { g / norm } else { 0.0 };
                    row.mapv_inplace(|v| v * scale);
                }
                Ok(grad_poses.into_dyn())
            }
        }
    }
}

/// Valid-padding 2D convolution of a `(height, width, channels)` map
fn conv2d(input: &Array3<f32>, kernel: &Array4<f32>, bias: &Array1<f32>, stride: usize) -> Result<Array3<f32>> {
    let (height, width, _) = input.dim();
    let (kh, kw, cin, cout) = kernel.dim();
    let out_h = (height - kh) / stride + 1;
    let out_w = (width - kw) / stride + 1;

    let weights = kernel
        .as_standard_layout()
        .into_owned()
        .into_shape((kh * kw * cin, cout))
        .map_err(|e| Error::ModelError(format!("conv2d kernel: {e}")))?;

    let mut output = Array3::zeros((out_h, out_w, cout));
    for y in 0..out_h {
        for x in 0..out_w {
            let patch: Array1<f32> = input
                .slice(s![y * stride..y * stride + kh, x * stride..x * stride + kw, ..])
                .iter()
                .copied()
                .collect();
            output.slice_mut(s![y, x, ..]).assign(&(patch.dot(&weights) + bias));
        }
    }
    Ok(output)
}

fn max_pool(input: &Array3<f32>, size: usize) -> Array3<f32> {
    let (height, width, channels) = input.dim();
    Array3::from_shape_fn((height / size, width / size, channels), |(y, x, c)| {
        input
            .slice(s![y * size..(y + 1) * size, x * size..(x + 1) * size, c])
            .fold(f32::NEG_INFINITY, |acc, &v| acc.max(v))
    })
}

/// Input gradient of [`conv2d`] for an input of shape `input_dim`
fn conv2d_backward(
    input_dim: (usize, usize, usize),
    grad_output: &Array3<f32>,
    kernel: &Array4<f32>,
    stride: usize,
) -> Result<Array3<f32>> {
    let (kh, kw, cin, cout) = kernel.dim();
    let weights = kernel
        .as_standard_layout()
        .into_owned()
        .into_shape((kh * kw * cin, cout))
        .map_err(|e| Error::ModelError(format!("conv2d kernel: {e}")))?;

    let mut grad_input = Array3::zeros(input_dim);
    for ((y, x), _) in grad_output.slice(s![.., .., 0]).indexed_iter() {
        let patch: Array1<f32> = weights.dot(&grad_output.slice(s![y, x, ..]));
        let patch = patch
            .into_shape((kh, kw, cin))
            .map_err(|e| Error::ModelError(format!("conv2d patch: {e}")))?;
        let mut window = grad_input.slice_mut(s![y * stride..y * stride + kh, x * stride..x * stride + kw, ..]);
        window += &patch;
    }
    Ok(grad_input)
}

/// Input gradient of [`max_pool`]: each window's gradient goes to its first maximum
fn max_pool_backward(input: &ArrayView3<'_, f32>, grad_output: &Array3<f32>, size: usize) -> Array3<f32> {
    let mut grad_input = Array3::zeros(input.raw_dim());
    for ((y, x, c), &grad) in grad_output.indexed_iter() {
        let window = input.slice(s![y * size..(y + 1) * size, x * size..(x + 1) * size, c]);
        let mut best = (0, 0);
        for ((dy, dx), &value) in window.indexed_iter() {
            if value > window[best] {
                best = (dy, dx);
            }
        }
        grad_input[[y * size + best.0, x * size + best.1, c]] += grad;
    }
    grad_input
}

/// Serialized form of a [`CapsNet`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapsNetSpec {
    pub name: String,
    /// Expected `(height, width, channels)` of every input image
    pub input_shape: [usize; 3],
    pub layers: Vec<Layer>,
}

/// Sequential capsule network evaluated on `ndarray` tensors
#[derive(Debug, Clone)]
pub struct CapsNet {
    spec: CapsNetSpec,
    shapes: Vec<Vec<usize>>,
}

impl CapsNet {
    /// Build a network, checking that every layer accepts its predecessor's output
    ///
    /// # Errors
    ///
    /// Returns an error naming the first layer whose input shape does not fit, or if the
    /// network does not end in a vector of class scores
    pub fn new(spec: CapsNetSpec) -> Result<Self> {
        if spec.layers.is_empty() {
            return Err(Error::InvalidInput(format!("Network {} has no layers", spec.name)));
        }

        let mut shapes = Vec::with_capacity(spec.layers.len());
        let mut current = spec.input_shape.to_vec();
        for (index, layer) in spec.layers.iter().enumerate() {
            current = layer
                .output_shape(&current)
                .map_err(|e| Error::InvalidInput(format!("{} layer {index}: {e}", spec.name)))?;
            shapes.push(current.clone());
        }

        if current.len() != 1 {
            return Err(Error::InvalidInput(format!(
                "Network {} must end in class scores, final shape is {current:?}",
                spec.name
            )));
        }

        Ok(Self { spec, shapes })
    }

    /// Load a bincode-serialized [`CapsNetSpec`]
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, decoded, or describes an invalid network
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let mut reader = BufReader::new(file);
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let spec: CapsNetSpec = bincode::deserialize(&bytes)?;
        let network = Self::new(spec)?;
        info!(
            "Loaded capsule network {} ({} layers) from {}",
            network.spec.name,
            network.spec.layers.len(),
            path.as_ref().display()
        );
        Ok(network)
    }

    /// Write the network in the format read by [`CapsNet::load`]
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let bytes = bincode::serialize(&self.spec)?;
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&bytes)?;
        writer.flush()?;
        Ok(())
    }

    #[must_use]
    pub fn spec(&self) -> &CapsNetSpec {
        &self.spec
    }

    /// Number of class scores produced per image
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.shapes.last().map_or(0, |shape| shape[0])
    }

    fn check_image(&self, image: &Array3<f32>) -> Result<()> {
        let (height, width, channels) = image.dim();
        if [height, width, channels] != self.spec.input_shape {
            return Err(Error::InvalidInput(format!(
                "Network {} expects {:?} images, got {:?}",
                self.spec.name,
                self.spec.input_shape,
                image.shape()
            )));
        }
        Ok(())
    }

    fn check_activations(&self, layer: usize, activations: &ArrayD<f32>) -> Result<()> {
        let expected = self
            .layer_shape(layer)
            .ok_or_else(|| Error::InvalidInput(format!("Layer {layer} out of range")))?;
        if activations.shape() != expected.as_slice() {
            return Err(Error::InvalidInput(format!(
                "Layer {layer} activations must have shape {expected:?}, got {:?}",
                activations.shape()
            )));
        }
        Ok(())
    }

    fn run(&self, mut activations: ArrayD<f32>, layers: std::ops::Range<usize>) -> Result<ArrayD<f32>> {
        for layer in &self.spec.layers[layers] {
            activations = layer.forward(activations)?;
        }
        Ok(activations)
    }

    /// Class scores for a single image
    ///
    /// # Errors
    ///
    /// Returns an error if the image has the wrong shape
    pub fn forward(&self, image: &Array3<f32>) -> Result<Array1<f32>> {
        self.check_image(image)?;
        let scores = self.run(image.clone().into_dyn(), 0..self.spec.layers.len())?;
        scores
            .into_dimensionality::<Ix1>()
            .map_err(|e| Error::ModelError(format!("{}: {e}", self.spec.name)))
    }
}

impl Network for CapsNet {
    fn predict(&self, batch: &Array4<f32>) -> Result<Array2<f32>> {
        let mut scores = Array2::zeros((batch.len_of(Axis(0)), self.num_classes()));
        for (image, mut row) in batch.outer_iter().zip(scores.outer_iter_mut()) {
            row.assign(&self.forward(&image.to_owned())?);
        }
        Ok(scores)
    }

    fn name(&self) -> &str {
        &self.spec.name
    }

    fn layer_access(&self) -> Option<&dyn LayerAccess> {
        Some(self)
    }
}

impl LayerAccess for CapsNet {
    fn layer_count(&self) -> usize {
        self.spec.layers.len()
    }

    fn layer_shape(&self, layer: usize) -> Option<Vec<usize>> {
        self.shapes.get(layer).cloned()
    }

    fn activations(&self, input: &Array3<f32>, layer: usize) -> Result<ArrayD<f32>> {
        if layer >= self.layer_count() {
            return Err(Error::InvalidInput(format!("Layer {layer} out of range")));
        }
        self.check_image(input)?;
        self.run(input.clone().into_dyn(), 0..layer + 1)
    }

    fn forward_from(&self, layer: usize, activations: &ArrayD<f32>) -> Result<Array1<f32>> {
        self.check_activations(layer, activations)?;
        let scores = self.run(activations.clone(), layer + 1..self.layer_count())?;
        scores
            .into_dimensionality::<Ix1>()
            .map_err(|e| Error::ModelError(format!("{}: {e}", self.spec.name)))
    }

    fn gradient(&self, layer: usize, activations: &ArrayD<f32>, target: usize) -> Result<ArrayD<f32>> {
        self.check_activations(layer, activations)?;
        let layers = &self.spec.layers[layer + 1..];

        let mut inputs = Vec::with_capacity(layers.len());
        let mut current = activations.clone();
        for stage in layers {
            let next = stage.forward(current.clone())?;
            inputs.push(current);
            current = next;
        }

        if target >= current.len() {
            return Err(Error::InvalidInput(format!(
                "Target class {target} out of range for {} scores",
                current.len()
            )));
        }
        let mut grad = ArrayD::zeros(current.raw_dim());
        grad[[target].as_slice()] = 1.0;

        for (stage, input) in layers.iter().zip(&inputs).rev() {
            grad = stage.backward(input, grad)?;
        }
        Ok(grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn tiny_spec() -> CapsNetSpec {
        let kernel = Array::from_shape_fn((3, 3, 3, 4), |(y, x, c, o)| {
            ((y * 3 + x + c * 5 + o * 7) % 9) as f32 / 9.0 - 0.4
        });
        let capsule = CapsuleLayer::new(
            Array::from_shape_fn((2, 4, 4, 4), |(j, i, o, d)| ((j + i * 2 + o * 3 + d) % 5) as f32 / 5.0 - 0.4),
            3,
        )
        .unwrap();

        CapsNetSpec {
            name: "tiny".to_string(),
            input_shape: [6, 6, 3],
            layers: vec![
                Layer::Conv2d {
                    kernel,
                    bias: Array1::from(vec![0.1, -0.1, 0.05, 0.0]),
                    stride: 1,
                },
                Layer::Relu,
                Layer::MaxPool { size: 2 },
                Layer::PrimaryCaps { dim: 4 },
                Layer::Capsule(capsule),
                Layer::Length,
            ],
        }
    }

    fn test_image() -> Array3<f32> {
        Array3::from_shape_fn((6, 6, 3), |(y, x, c)| ((y * 6 + x + c) % 10) as f32 / 10.0)
    }

    #[test]
    fn test_construction_records_shapes() {
        let net = CapsNet::new(tiny_spec()).unwrap();
        assert_eq!(net.layer_shape(0), Some(vec![4, 4, 4]));
        assert_eq!(net.layer_shape(2), Some(vec![2, 2, 4]));
        assert_eq!(net.layer_shape(3), Some(vec![4, 4]));
        assert_eq!(net.num_classes(), 2);
    }

    #[test]
    fn test_construction_rejects_pose_dimension_mismatch() {
        let mut spec = tiny_spec();
        spec.layers[3] = Layer::PrimaryCaps { dim: 8 };
        let err = CapsNet::new(spec).unwrap_err();
        assert!(err.to_string().contains("layer 4"), "{err}");
    }

    #[test]
    fn test_construction_requires_class_scores() {
        let mut spec = tiny_spec();
        spec.layers.pop();
        assert!(CapsNet::new(spec).is_err());
    }

    #[test]
    fn test_predict_scores_in_unit_range() {
        let net = CapsNet::new(tiny_spec()).unwrap();
        let batch = ndarray::stack(Axis(0), &[test_image().view(), test_image().view()]).unwrap();
        let scores = net.predict(&batch).unwrap();
        assert_eq!(scores.dim(), (2, 2));
        assert!(scores.iter().all(|&s| (0.0..1.0).contains(&s)));
        assert_eq!(scores.row(0), scores.row(1));
    }

    #[test]
    fn test_predict_rejects_wrong_image_size() {
        let net = CapsNet::new(tiny_spec()).unwrap();
        assert!(net.predict(&Array4::zeros((1, 8, 8, 3))).is_err());
    }

    #[test]
    fn test_split_forward_matches_full_forward() {
        let net = CapsNet::new(tiny_spec()).unwrap();
        let image = test_image();
        let full = net.forward(&image).unwrap();
        for layer in 0..net.layer_count() - 1 {
            let activations = net.activations(&image, layer).unwrap();
            let resumed = net.forward_from(layer, &activations).unwrap();
            for (a, b) in full.iter().zip(resumed.iter()) {
                assert!((a - b).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_resolve_layer_negative_indices() {
        let net = CapsNet::new(tiny_spec()).unwrap();
        assert_eq!(net.resolve_layer(-1).unwrap(), 5);
        assert_eq!(net.resolve_layer(-3).unwrap(), 3);
        assert_eq!(net.resolve_layer(2).unwrap(), 2);
        assert!(net.resolve_layer(6).is_err());
        assert!(net.resolve_layer(-7).is_err());
    }

    #[test]
    fn test_last_spatial_layer() {
        let net = CapsNet::new(tiny_spec()).unwrap();
        assert_eq!(net.last_spatial_layer(), Some(2));
    }

    #[test]
    fn test_gradient_of_length_layer() {
        // d‖v‖/dv = v / ‖v‖
        let net = CapsNet::new(tiny_spec()).unwrap();
        let poses = Array2::from_shape_vec((2, 4), vec![0.3, 0.4, 0.0, 0.0, 0.0, 0.1, 0.2, 0.2])
            .unwrap()
            .into_dyn();
        let gradient = net.gradient(4, &poses, 0).unwrap();
        assert!((gradient[[0, 0]] - 0.6).abs() < 1e-5);
        assert!((gradient[[0, 1]] - 0.8).abs() < 1e-5);
        assert_eq!(gradient[[1, 2]], 0.0);
    }

    /// Smooth network (no relu or pooling) with a strided second convolution
    fn smooth_spec() -> CapsNetSpec {
        let first = Array::from_shape_fn((3, 3, 3, 4), |(y, x, c, o)| ((y * 5 + x * 3 + c + o * 7) % 11) as f32 / 11.0 - 0.5);
        let second = Array::from_shape_fn((2, 2, 4, 4), |(y, x, c, o)| ((y + x * 2 + c * 3 + o * 5) % 7) as f32 / 7.0 - 0.4);
        let capsule = CapsuleLayer::new(
            Array::from_shape_fn((2, 4, 3, 4), |(j, i, o, d)| ((j * 3 + i + o * 2 + d * 5) % 9) as f32 / 9.0 - 0.45),
            3,
        )
        .unwrap();

        CapsNetSpec {
            name: "smooth".to_string(),
            input_shape: [6, 6, 3],
            layers: vec![
                Layer::Conv2d {
                    kernel: first,
                    bias: Array1::from(vec![0.05, -0.05, 0.1, 0.0]),
                    stride: 1,
                },
                Layer::Conv2d {
                    kernel: second,
                    bias: Array1::zeros(4),
                    stride: 2,
                },
                Layer::PrimaryCaps { dim: 4 },
                Layer::Capsule(capsule),
                Layer::Length,
            ],
        }
    }

    fn assert_gradients_close(analytic: &ArrayD<f32>, numeric: &ArrayD<f32>) {
        assert_eq!(analytic.shape(), numeric.shape());
        for (index, (a, n)) in analytic.iter().zip(numeric.iter()).enumerate() {
            assert!((a - n).abs() < 2e-3 + 2e-2 * n.abs(), "element {index}: {a} vs {n}");
        }
    }

    #[test]
    fn test_gradient_matches_numeric_through_convolutions() {
        let net = CapsNet::new(smooth_spec()).unwrap();
        let image = test_image() * 0.5;
        for layer in 0..3 {
            let activations = net.activations(&image, layer).unwrap();
            for target in 0..2 {
                let analytic = net.gradient(layer, &activations, target).unwrap();
                let numeric = numeric_gradient(&net, layer, &activations, target).unwrap();
                assert_gradients_close(&analytic, &numeric);
            }
        }
    }

    #[test]
    fn test_gradient_matches_numeric_after_pooling() {
        let net = CapsNet::new(tiny_spec()).unwrap();
        let image = test_image();
        for layer in [2, 3] {
            let activations = net.activations(&image, layer).unwrap();
            let analytic = net.gradient(layer, &activations, 1).unwrap();
            let numeric = numeric_gradient(&net, layer, &activations, 1).unwrap();
            assert_gradients_close(&analytic, &numeric);
        }
    }

    #[test]
    fn test_relu_and_pool_backward_route_to_active_inputs() {
        let input = Array3::from_shape_vec((2, 2, 1), vec![0.5, -1.0, 2.0, 0.0]).unwrap().into_dyn();
        let ones = ArrayD::from_elem(input.raw_dim(), 1.0);
        let relu = Layer::Relu.backward(&input, ones).unwrap();
        assert_eq!(relu.iter().copied().collect::<Vec<_>>(), vec![1.0, 0.0, 1.0, 0.0]);

        let pooled = Layer::MaxPool { size: 2 }
            .backward(&input, Array3::from_elem((1, 1, 1), 3.0).into_dyn())
            .unwrap();
        assert_eq!(pooled.iter().copied().collect::<Vec<_>>(), vec![0.0, 0.0, 3.0, 0.0]);
    }

    #[test]
    fn test_gradient_rejects_bad_target_and_shape() {
        let net = CapsNet::new(tiny_spec()).unwrap();
        let activations = net.activations(&test_image(), 2).unwrap();
        assert!(net.gradient(2, &activations, 2).is_err());
        assert!(net.gradient(3, &activations, 0).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let net = CapsNet::new(tiny_spec()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.bin");
        net.save(&path).unwrap();

        let loaded = CapsNet::load(&path).unwrap();
        assert_eq!(loaded.name(), "tiny");
        assert_eq!(loaded.forward(&test_image()).unwrap(), net.forward(&test_image()).unwrap());
    }
}
