//! Capsule primitives: the squash nonlinearity, the length readout, and routing by agreement.
//!
//! A capsule layer maps `I` input pose vectors of dimension `D_in` to `J` output pose vectors
//! of dimension `D_out`. Every (output, input) pair owns a `D_out × D_in` transform that turns
//! the input pose into a vote for the output pose. Routing then iteratively shifts coupling
//! toward the outputs whose current estimate agrees with the votes:
//!
//! 1. `vote[j, i] = W[j, i] · u[i]`
//! 2. `b[j, i] = 0`
//! 3. for each iteration: `c = softmax_j(b)`, `s[j] = Σ_i c[j, i] vote[j, i]`,
//!    `v[j] = squash(s[j])`, and unless this is the last iteration `b[j, i] += vote[j, i] · v[j]`
//!
//! The logits `b` are threaded through the iterations as an explicit [`RoutingState`] value.

use crate::constants::{DEFAULT_ROUTINGS, SQUASH_EPSILON};
use crate::{Error, Result};
use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Largest norm [`squash`] may return; keeps huge inputs strictly inside the unit ball
const MAX_SQUASHED_NORM: f64 = 1.0 - 4.0 * f32::EPSILON as f64;

/// Squared norm in f64, which cannot overflow for finite f32 components
fn squared_norm(vector: ArrayView1<'_, f32>) -> f64 {
    vector.iter().map(|&x| f64::from(x) * f64::from(x)).sum()
}

/// Scale a vector to a norm in [0, 1) while keeping its direction
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn squash(vector: ArrayView1<'_, f32>) -> Array1<f32> {
    let squared = squared_norm(vector);
    let squashed_norm = (squared / (1.0 + squared)).min(MAX_SQUASHED_NORM);
    let scale = squashed_norm / (squared + f64::from(SQUASH_EPSILON)).sqrt();
    vector.mapv(|x| (f64::from(x) * scale) as f32)
}

/// Gradient of [`squash`] with respect to its input, given the gradient of its output
///
/// With `q = ‖x‖²` and `squash(x) = g(q) x`, the vector-Jacobian product is
/// `g(q) grad + 2 g'(q) (x · grad) x`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn squash_backward(vector: ArrayView1<'_, f32>, grad: ArrayView1<'_, f32>) -> Array1<f32> {
    let q = squared_norm(vector);
    let shifted = q + f64::from(SQUASH_EPSILON);
    let g = q / ((1.0 + q) * shifted.sqrt());
    let dg = (2.0 * shifted - q * (1.0 + q)) / (2.0 * (1.0 + q).powi(2) * shifted.powf(1.5));
    let projection: f64 = vector.iter().zip(grad).map(|(&x, &d)| f64::from(x) * f64::from(d)).sum();

    Array1::from_shape_fn(vector.len(), |k| {
        (g * f64::from(grad[k]) + 2.0 * dg * projection * f64::from(vector[k])) as f32
    })
}

/// Apply [`squash`] to every row
#[must_use]
pub fn squash_rows(vectors: ArrayView2<'_, f32>) -> Array2<f32> {
    let mut squashed = Array2::zeros(vectors.raw_dim());
    for (mut out, row) in squashed.outer_iter_mut().zip(vectors.outer_iter()) {
        out.assign(&squash(row));
    }
    squashed
}

/// Presence probability of each capsule: the L2 norm of its pose
#[must_use]
pub fn length(poses: ArrayView2<'_, f32>) -> Array1<f32> {
    poses.map_axis(Axis(1), |pose| pose.dot(&pose).sqrt())
}

/// Softmax over the output-capsule axis (rows), so that every column sums to one
#[must_use]
pub fn coupling_coefficients(logits: &Array2<f32>) -> Array2<f32> {
    let mut coupling = logits.clone();
    for mut column in coupling.axis_iter_mut(Axis(1)) {
        let max = column.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
        column.mapv_inplace(|x| (x - max).exp());
        let sum = column.sum();
        column.mapv_inplace(|x| x / sum);
    }
    coupling
}

/// Agreement logits carried from one routing iteration to the next
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingState {
    /// `b[j, i]`, shape (output capsules, input capsules)
    pub logits: Array2<f32>,
}

impl RoutingState {
    /// All-zero logits: every input starts uniformly coupled to every output
    #[must_use]
    pub fn initial(output_capsules: usize, input_capsules: usize) -> Self {
        Self {
            logits: Array2::zeros((output_capsules, input_capsules)),
        }
    }
}

/// Result of a single routing iteration
#[derive(Debug, Clone)]
pub struct RoutingStep {
    /// Coupled votes before squashing, `s[j]`, shape (J, D_out)
    pub weighted: Array2<f32>,
    /// Output poses after squashing, shape (J, D_out)
    pub outputs: Array2<f32>,
    /// Coupling coefficients used in this iteration, shape (J, I)
    pub coupling: Array2<f32>,
}

/// Run one routing iteration, returning its outputs and the state for the next iteration
///
/// When `update` is false the logits are passed through unchanged.
#[must_use]
pub fn routing_step(votes: &Array3<f32>, state: RoutingState, update: bool) -> (RoutingStep, RoutingState) {
    let (output_capsules, _, dim) = votes.dim();
    let coupling = coupling_coefficients(&state.logits);

    let mut weighted = Array2::<f32>::zeros((output_capsules, dim));
    for (j, mut s_j) in weighted.outer_iter_mut().enumerate() {
        let votes_j = votes.index_axis(Axis(0), j);
        s_j.assign(&coupling.row(j).dot(&votes_j));
    }
    let outputs = squash_rows(weighted.view());

    let next = if update {
        let mut logits = state.logits;
        for ((j, i), b) in logits.indexed_iter_mut() {
            *b += votes.slice(s![j, i, ..]).dot(&outputs.row(j));
        }
        RoutingState { logits }
    } else {
        state
    };

    (
        RoutingStep {
            weighted,
            outputs,
            coupling,
        },
        next,
    )
}

/// Per-iteration record of a routing pass
#[derive(Debug, Clone)]
pub struct RoutingTrace {
    /// One entry per iteration, in order
    pub steps: Vec<RoutingStep>,
}

impl RoutingTrace {
    /// Output poses of the final iteration
    #[must_use]
    pub fn outputs(&self) -> Option<&Array2<f32>> {
        self.steps.last().map(|step| &step.outputs)
    }
}

/// Capsule layer with dynamic routing between capsules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapsuleLayer {
    /// Vote transforms, shape (output capsules, input capsules, output dim, input dim)
    weights: Array4<f32>,
    routings: usize,
}

impl CapsuleLayer {
    /// Create a layer from its transform tensor
    ///
    /// # Errors
    ///
    /// Returns an error if any weight dimension is zero or `routings` is zero
    pub fn new(weights: Array4<f32>, routings: usize) -> Result<Self> {
        let layer = Self { weights, routings };
        layer.validate()?;
        Ok(layer)
    }

    /// Check the invariants `new` enforces; deserialized layers go through this too
    ///
    /// # Errors
    ///
    /// Returns an error if any weight dimension is zero or `routings` is zero
    pub fn validate(&self) -> Result<()> {
        if self.weights.shape().contains(&0) {
            return Err(Error::InvalidInput(format!(
                "Capsule transform has an empty dimension: {:?}",
                self.weights.shape()
            )));
        }
        if self.routings == 0 {
            return Err(Error::InvalidInput("Routing iterations must be greater than 0".to_string()));
        }
        Ok(())
    }

    /// Create a layer with the default number of routing iterations
    ///
    /// # Errors
    ///
    /// Returns an error if any weight dimension is zero
    pub fn with_default_routings(weights: Array4<f32>) -> Result<Self> {
        Self::new(weights, DEFAULT_ROUTINGS)
    }

    #[must_use]
    pub fn num_capsules(&self) -> usize {
        self.weights.shape()[0]
    }

    #[must_use]
    pub fn input_capsules(&self) -> usize {
        self.weights.shape()[1]
    }

    #[must_use]
    pub fn dim_capsule(&self) -> usize {
        self.weights.shape()[2]
    }

    #[must_use]
    pub fn input_dim(&self) -> usize {
        self.weights.shape()[3]
    }

    #[must_use]
    pub fn routings(&self) -> usize {
        self.routings
    }

    /// Check that this layer accepts `input_capsules` poses of dimension `input_dim`
    ///
    /// # Errors
    ///
    /// Returns an error naming both shapes if they disagree
    pub fn check_input(&self, input_capsules: usize, input_dim: usize) -> Result<()> {
        if (input_capsules, input_dim) != (self.input_capsules(), self.input_dim()) {
            return Err(Error::InvalidInput(format!(
                "Capsule layer expects {}x{} input poses, got {}x{}",
                self.input_capsules(),
                self.input_dim(),
                input_capsules,
                input_dim
            )));
        }
        Ok(())
    }

    /// Votes of every input capsule for every output capsule, shape (J, I, D_out)
    fn votes(&self, inputs: ArrayView2<'_, f32>) -> Array3<f32> {
        let mut votes = Array3::zeros((self.num_capsules(), self.input_capsules(), self.dim_capsule()));
        for j in 0..self.num_capsules() {
            for i in 0..self.input_capsules() {
                let transform = self.weights.slice(s![j, i, .., ..]);
                votes.slice_mut(s![j, i, ..]).assign(&transform.dot(&inputs.row(i)));
            }
        }
        votes
    }

    /// Route input poses (I × D_in) to output poses (J × D_out)
    ///
    /// # Errors
    ///
    /// Returns an error if `inputs` does not match the layer's input shape
    pub fn route(&self, inputs: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        let trace = self.route_traced(inputs)?;
        trace
            .steps
            .into_iter()
            .last()
            .map(|step| step.outputs)
            .ok_or_else(|| Error::ModelError("Routing produced no iterations".to_string()))
    }

    /// Route input poses and keep the coupling coefficients of every iteration
    ///
    /// # Errors
    ///
    /// Returns an error if `inputs` does not match the layer's input shape
    pub fn route_traced(&self, inputs: ArrayView2<'_, f32>) -> Result<RoutingTrace> {
        let (input_capsules, input_dim) = inputs.dim();
        self.check_input(input_capsules, input_dim)?;
        Ok(self.route_votes(&self.votes(inputs)))
    }

    fn route_votes(&self, votes: &Array3<f32>) -> RoutingTrace {
        let mut state = RoutingState::initial(self.num_capsules(), self.input_capsules());
        let mut steps = Vec::with_capacity(self.routings);

        for iteration in 0..self.routings {
            let (step, next) = routing_step(votes, state, iteration + 1 < self.routings);
            steps.push(step);
            state = next;
        }

        RoutingTrace { steps }
    }

    /// Gradient with respect to the input poses, given the gradient of the routed outputs
    ///
    /// Backpropagates through every routing iteration, including the dependence of the
    /// coupling coefficients on the agreement updates.
    ///
    /// # Errors
    ///
    /// Returns an error if `inputs` or `grad_outputs` do not match the layer's shapes
    pub fn backward(&self, inputs: ArrayView2<'_, f32>, grad_outputs: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        let (input_capsules, input_dim) = inputs.dim();
        self.check_input(input_capsules, input_dim)?;
        let (outputs, dim) = (self.num_capsules(), self.dim_capsule());
        if grad_outputs.dim() != (outputs, dim) {
            return Err(Error::InvalidInput(format!(
                "Capsule layer output gradient must be {outputs}x{dim}, got {:?}",
                grad_outputs.shape()
            )));
        }

        let votes = self.votes(inputs);
        let trace = self.route_votes(&votes);
        let last = trace.steps.len().saturating_sub(1);

        let mut grad_votes = Array3::<f32>::zeros(votes.raw_dim());
        // Gradient with respect to the logits entering the iteration after the current one
        let mut grad_logits = Array2::<f32>::zeros((outputs, input_capsules));
        let mut grad_out = grad_outputs.to_owned();

        for (iteration, step) in trace.steps.iter().enumerate().rev() {
            if iteration < last {
                // b[j, i] += vote[j, i] · v[j]
                grad_out.fill(0.0);
                for ((j, i), &grad_b) in grad_logits.indexed_iter() {
                    grad_out.row_mut(j).scaled_add(grad_b, &votes.slice(s![j, i, ..]));
                    grad_votes.slice_mut(s![j, i, ..]).scaled_add(grad_b, &step.outputs.row(j));
                }
            }

            let mut grad_weighted = Array2::<f32>::zeros((outputs, dim));
            for (j, mut row) in grad_weighted.outer_iter_mut().enumerate() {
                row.assign(&squash_backward(step.weighted.row(j), grad_out.row(j)));
            }

            let mut grad_coupling = Array2::<f32>::zeros((outputs, input_capsules));
            for ((j, i), grad_c) in grad_coupling.indexed_iter_mut() {
                let vote = votes.slice(s![j, i, ..]);
                *grad_c = grad_weighted.row(j).dot(&vote);
                grad_votes
                    .slice_mut(s![j, i, ..])
                    .scaled_add(step.coupling[[j, i]], &grad_weighted.row(j));
            }

            // Softmax over outputs for each input capsule
            for i in 0..input_capsules {
                let coupling = step.coupling.column(i);
                let inner = coupling.dot(&grad_coupling.column(i));
                for j in 0..outputs {
                    grad_logits[[j, i]] += coupling[j] * (grad_coupling[[j, i]] - inner);
                }
            }
        }

        let mut grad_inputs = Array2::<f32>::zeros((input_capsules, input_dim));
        for j in 0..outputs {
            for (i, mut row) in grad_inputs.outer_iter_mut().enumerate() {
                let transform = self.weights.slice(s![j, i, .., ..]);
                row += &transform.t().dot(&grad_votes.slice(s![j, i, ..]));
            }
        }
        Ok(grad_inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};
    use proptest::prelude::*;

    fn test_layer(routings: usize) -> CapsuleLayer {
        let weights = Array4::from_shape_fn((3, 4, 2, 5), |(j, i, o, d)| {
            ((j * 7 + i * 3 + o * 5 + d) % 11) as f32 / 11.0 - 0.45
        });
        CapsuleLayer::new(weights, routings).unwrap()
    }

    fn test_inputs() -> Array2<f32> {
        Array2::from_shape_fn((4, 5), |(i, d)| ((i * 5 + d) % 7) as f32 / 7.0 - 0.3)
    }

    #[test]
    fn test_squash_zero_is_zero() {
        let squashed = squash(Array1::<f32>::zeros(4).view());
        assert!(squashed.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_squash_known_value() {
        // ‖(3, 4)‖ = 5, so the squashed norm is 25 / 26
        let squashed = squash(arr1(&[3.0f32, 4.0]).view());
        let norm = squashed.dot(&squashed).sqrt();
        assert!((norm - 25.0 / 26.0).abs() < 1e-5);
        assert!((squashed[0] / squashed[1] - 0.75).abs() < 1e-5);
    }

    #[test]
    fn test_squash_large_inputs_stay_inside_unit_ball() {
        for &magnitude in &[1e4f32, 1e10, 1e20, f32::MAX] {
            for vector in [arr1(&[magnitude, 0.0]), arr1(&[magnitude, -magnitude]), arr1(&[0.5, magnitude])] {
                let squashed = squash(vector.view());
                assert!(squashed.iter().all(|x| x.is_finite()), "{magnitude}: {squashed}");
                let norm: f64 = squashed.iter().map(|&x| f64::from(x).powi(2)).sum::<f64>().sqrt();
                assert!(norm < 1.0 && norm > 0.99, "{magnitude}: norm {norm}");
                for (x, y) in vector.iter().zip(squashed.iter()) {
                    assert_eq!(x.signum(), y.signum());
                }
            }
        }
        let squashed = squash(arr1(&[f32::MAX, f32::MAX]).view());
        assert!((squashed[0] - squashed[1]).abs() < 1e-6);
    }

    fn weighted_sum(outputs: &Array2<f32>, weights: &Array2<f32>) -> f32 {
        (outputs * weights).sum()
    }

    #[test]
    fn test_squash_backward_matches_finite_differences() {
        let vector = arr1(&[0.4f32, -1.2, 0.7]);
        let grad = arr1(&[0.3f32, 0.5, -0.8]);
        let analytic = squash_backward(vector.view(), grad.view());

        let step = 1e-3;
        for k in 0..3 {
            let mut above = vector.clone();
            above[k] += step;
            let mut below = vector.clone();
            below[k] -= step;
            let numeric = (squash(above.view()).dot(&grad) - squash(below.view()).dot(&grad)) / (2.0 * step);
            assert!((analytic[k] - numeric).abs() < 1e-3, "{k}: {} vs {numeric}", analytic[k]);
        }
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        for routings in [1, 3] {
            let layer = test_layer(routings);
            let inputs = test_inputs();
            let weights = Array2::from_shape_fn((3, 2), |(j, d)| (j as f32 - 1.0) * 0.7 + d as f32 * 0.4);
            let analytic = layer.backward(inputs.view(), weights.view()).unwrap();

            let step = 1e-3;
            for ((i, d), &grad) in analytic.indexed_iter() {
                let mut above = inputs.clone();
                above[[i, d]] += step;
                let mut below = inputs.clone();
                below[[i, d]] -= step;
                let numeric = (weighted_sum(&layer.route(above.view()).unwrap(), &weights)
                    - weighted_sum(&layer.route(below.view()).unwrap(), &weights))
                    / (2.0 * step);
                assert!(
                    (grad - numeric).abs() < 2e-3 + 2e-2 * numeric.abs(),
                    "routings {routings}, input ({i}, {d}): {grad} vs {numeric}"
                );
            }
        }
    }

    #[test]
    fn test_backward_rejects_mismatched_gradient() {
        let layer = test_layer(3);
        assert!(layer.backward(test_inputs().view(), Array2::zeros((2, 2)).view()).is_err());
    }

    #[test]
    fn test_length_readout() {
        let poses = arr2(&[[3.0f32, 4.0], [0.0, 0.0], [1.0, 0.0]]);
        let lengths = length(poses.view());
        assert_eq!(lengths, arr1(&[5.0, 0.0, 1.0]));
    }

    #[test]
    fn test_coupling_columns_sum_to_one() {
        let logits = arr2(&[[0.0f32, 5.0, -3.0], [1.0, 5.0, 2.0]]);
        let coupling = coupling_coefficients(&logits);
        for column in coupling.columns() {
            assert!((column.sum() - 1.0).abs() < 1e-6);
        }
        assert!((coupling[[0, 1]] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_initial_coupling_is_uniform() {
        let trace = test_layer(3).route_traced(test_inputs().view()).unwrap();
        assert!(trace.steps[0].coupling.iter().all(|&c| (c - 1.0 / 3.0).abs() < 1e-6));
    }

    #[test]
    fn test_route_shapes_and_norms() {
        let layer = test_layer(3);
        let outputs = layer.route(test_inputs().view()).unwrap();
        assert_eq!(outputs.dim(), (3, 2));
        assert!(length(outputs.view()).iter().all(|&l| (0.0..1.0).contains(&l)));
    }

    #[test]
    fn test_route_matches_traced_final_step() {
        let layer = test_layer(4);
        let inputs = test_inputs();
        let trace = layer.route_traced(inputs.view()).unwrap();
        assert_eq!(trace.steps.len(), 4);
        assert_eq!(trace.outputs().unwrap(), &layer.route(inputs.view()).unwrap());
    }

    #[test]
    fn test_single_routing_iteration_uses_uniform_coupling() {
        let layer = test_layer(1);
        let inputs = test_inputs();
        let votes = layer.votes(inputs.view());
        // Uniform coupling is 1 / J for each of the J outputs
        let expected = squash_rows((votes.sum_axis(Axis(1)) / 3.0).view());
        let outputs = layer.route(inputs.view()).unwrap();
        for (a, b) in outputs.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_agreement_increases_coupling() {
        // Input 0 votes strongly for output 0; its coupling to output 0 must grow.
        let mut weights = Array4::<f32>::zeros((2, 1, 2, 2));
        weights[[0, 0, 0, 0]] = 2.0;
        weights[[1, 0, 1, 1]] = 0.1;
        let layer = CapsuleLayer::new(weights, 3).unwrap();
        let trace = layer.route_traced(arr2(&[[1.0f32, 1.0]]).view()).unwrap();

        let first = trace.steps[0].coupling[[0, 0]];
        let last = trace.steps[2].coupling[[0, 0]];
        assert!(last > first);
    }

    #[test]
    fn test_route_rejects_mismatched_input() {
        let layer = test_layer(3);
        assert!(layer.route(Array2::<f32>::zeros((4, 3)).view()).is_err());
        assert!(layer.check_input(5, 5).is_err());
    }

    #[test]
    fn test_new_rejects_degenerate_layers() {
        assert!(CapsuleLayer::new(Array4::zeros((0, 1, 1, 1)), 3).is_err());
        assert!(CapsuleLayer::new(Array4::zeros((1, 1, 1, 1)), 0).is_err());
    }

    proptest! {
        #[test]
        fn prop_squash_norm_below_one(values in proptest::collection::vec(-1e30f32..1e30, 1..16)) {
            let vector = Array1::from(values);
            let squashed = squash(vector.view());
            let norm: f64 = squashed.iter().map(|&x| f64::from(x).powi(2)).sum::<f64>().sqrt();
            prop_assert!((0.0..1.0).contains(&norm));
        }

        #[test]
        fn prop_squash_preserves_direction(values in proptest::collection::vec(-50f32..50.0, 2..8)) {
            let vector = Array1::from(values);
            let norm = vector.dot(&vector).sqrt();
            prop_assume!(norm > 1e-2);
            let squashed = squash(vector.view());
            let squashed_norm = squashed.dot(&squashed).sqrt();
            let cosine = vector.dot(&squashed) / (norm * squashed_norm);
            prop_assert!((cosine - 1.0).abs() < 1e-4);
        }

        #[test]
        fn prop_coupling_sums_to_one_every_iteration(
            values in proptest::collection::vec(-2f32..2.0, 20),
            routings in 1usize..6,
        ) {
            let inputs = Array2::from_shape_vec((4, 5), values).unwrap();
            let trace = test_layer(routings).route_traced(inputs.view()).unwrap();
            for step in &trace.steps {
                for column in step.coupling.columns() {
                    prop_assert!((column.sum() - 1.0).abs() < 1e-5);
                    prop_assert!(column.iter().all(|&c| c >= 0.0));
                }
            }
        }
    }
}
