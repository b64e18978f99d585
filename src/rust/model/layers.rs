//! Building blocks of the center-loss model.
//!
//! Layers do not cache activations themselves: forward passes return the
//! values needed for backpropagation so that several replicas can run a
//! forward/backward pass over the same weights at once.

use ndarray::{Array1, Array2, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::error::TrainingError;

/// Role of a layer inside the model, assigned when the model is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerRole {
    /// Hidden layers of the embedding network
    Trunk,
    /// Final layer of the embedding network, producing the embedding
    TrunkOutput,
    /// Layers added on top of the embedding (softmax and center-loss heads)
    Head,
}

/// Common interface of all parameterised layers.
pub trait Layer: Send + Sync {
    fn name(&self) -> &str;

    fn role(&self) -> LayerRole;

    fn trainable(&self) -> bool;

    fn set_trainable(&mut self, trainable: bool);

    /// Layers whose weights were supplied from outside and must never change.
    fn locked(&self) -> bool {
        false
    }

    /// Parameters touched by the optimizer, in a fixed order.
    fn params_mut(&mut self) -> Vec<&mut Array2<f32>>;

    /// Every persisted tensor, including non-trainable state.
    fn weights(&self) -> Vec<Array2<f32>>;

    /// Replaces all persisted tensors. Shapes must match [`Layer::weights`].
    fn set_weights(&mut self, weights: Vec<Array2<f32>>) -> Result<(), TrainingError>;

    fn num_params(&self) -> usize {
        self.weights().iter().map(|w| w.len()).sum()
    }
}

fn check_shapes(layer: &str, current: &[Array2<f32>], incoming: &[Array2<f32>]) -> Result<(), TrainingError> {
    if current.len() != incoming.len() {
        return Err(TrainingError::ValidationError(format!(
            "Layer '{}' expects {} tensors, got {}",
            layer,
            current.len(),
            incoming.len()
        )));
    }
    for (i, (c, w)) in current.iter().zip(incoming).enumerate() {
        if c.dim() != w.dim() {
            return Err(TrainingError::ValidationError(format!(
                "Layer '{}' tensor {} has shape {:?}, got {:?}",
                layer,
                i,
                c.dim(),
                w.dim()
            )));
        }
    }
    Ok(())
}

pub fn relu(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(|v| v.max(0.0))
}

/// Gradient of ReLU given its pre-activation input.
pub fn relu_backward(pre_activation: &Array2<f32>, grad_output: &Array2<f32>) -> Array2<f32> {
    let mut grad = grad_output.clone();
    grad.zip_mut_with(pre_activation, |g, &x| {
        if x <= 0.0 {
            *g = 0.0;
        }
    });
    grad
}

/// Row-wise softmax.
pub fn softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    for mut row in out.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    out
}

/// Fully connected layer: `y = x W + b`.
#[derive(Debug, Clone)]
pub struct Dense {
    name: String,
    role: LayerRole,
    weights: Array2<f32>,
    bias: Array2<f32>,
    trainable: bool,
}

impl Dense {
    /// Creates a layer with Glorot-uniform weights and zero bias.
    pub fn new(name: impl Into<String>, input_dim: usize, output_dim: usize, role: LayerRole, rng: &mut StdRng) -> Self {
        let limit = (6.0 / (input_dim + output_dim) as f32).sqrt();
        Self {
            name: name.into(),
            role,
            weights: Array2::random_using((input_dim, output_dim), Uniform::new(-limit, limit), rng),
            bias: Array2::zeros((1, output_dim)),
            trainable: true,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.weights.nrows()
    }

    pub fn output_dim(&self) -> usize {
        self.weights.ncols()
    }

    pub fn forward(&self, input: &Array2<f32>) -> Array2<f32> {
        input.dot(&self.weights) + &self.bias
    }

    /// Returns the input gradient and `[dW, db]`.
    pub fn backward(&self, input: &Array2<f32>, grad_output: &Array2<f32>) -> (Array2<f32>, Vec<Array2<f32>>) {
        let grad_weights = input.t().dot(grad_output);
        let grad_bias = grad_output.sum_axis(Axis(0)).insert_axis(Axis(0));
        let grad_input = grad_output.dot(&self.weights.t());
        (grad_input, vec![grad_weights, grad_bias])
    }
}

impl Layer for Dense {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> LayerRole {
        self.role
    }

    fn trainable(&self) -> bool {
        self.trainable
    }

    fn set_trainable(&mut self, trainable: bool) {
        self.trainable = trainable;
    }

    fn params_mut(&mut self) -> Vec<&mut Array2<f32>> {
        vec![&mut self.weights, &mut self.bias]
    }

    fn weights(&self) -> Vec<Array2<f32>> {
        vec![self.weights.clone(), self.bias.clone()]
    }

    fn set_weights(&mut self, weights: Vec<Array2<f32>>) -> Result<(), TrainingError> {
        check_shapes(&self.name, &self.weights(), &weights)?;
        let mut it = weights.into_iter();
        if let (Some(w), Some(b)) = (it.next(), it.next()) {
            self.weights = w;
            self.bias = b;
        }
        Ok(())
    }
}

/// Values kept from a training-mode batch normalization pass.
#[derive(Debug, Clone)]
pub struct BatchNormCache {
    normalized: Array2<f32>,
    inv_std: Array1<f32>,
    mean: Array1<f32>,
    var: Array1<f32>,
}

/// Batch normalization over the feature axis.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    name: String,
    gamma: Array2<f32>,
    beta: Array2<f32>,
    moving_mean: Array2<f32>,
    moving_var: Array2<f32>,
    momentum: f32,
    epsilon: f32,
    trainable: bool,
}

impl BatchNorm {
    pub fn new(name: impl Into<String>, dim: usize) -> Self {
        Self {
            name: name.into(),
            gamma: Array2::ones((1, dim)),
            beta: Array2::zeros((1, dim)),
            moving_mean: Array2::zeros((1, dim)),
            moving_var: Array2::ones((1, dim)),
            momentum: 0.99,
            epsilon: 1e-3,
            trainable: true,
        }
    }

    /// Normalizes with the statistics of the batch itself.
    pub fn forward_train(&self, input: &Array2<f32>) -> (Array2<f32>, BatchNormCache) {
        let n = input.nrows().max(1) as f32;
        let mean = input.sum_axis(Axis(0)) / n;
        let centered = input - &mean;
        let var = centered.mapv(|v| v * v).sum_axis(Axis(0)) / n;
        let inv_std = var.mapv(|v| 1.0 / (v + self.epsilon).sqrt());
        let normalized = &centered * &inv_std;
        let output = &normalized * &self.gamma + &self.beta;
        (output, BatchNormCache { normalized, inv_std, mean, var })
    }

    /// Normalizes with the moving statistics.
    pub fn forward_inference(&self, input: &Array2<f32>) -> Array2<f32> {
        let inv_std = self.moving_var.mapv(|v| 1.0 / (v + self.epsilon).sqrt());
        (input - &self.moving_mean) * &inv_std * &self.gamma + &self.beta
    }

    /// Returns the input gradient and `[dgamma, dbeta]`.
    pub fn backward(&self, cache: &BatchNormCache, grad_output: &Array2<f32>) -> (Array2<f32>, Vec<Array2<f32>>) {
        let n = grad_output.nrows().max(1) as f32;
        let grad_gamma = (grad_output * &cache.normalized).sum_axis(Axis(0)).insert_axis(Axis(0));
        let grad_beta = grad_output.sum_axis(Axis(0)).insert_axis(Axis(0));

        let grad_normalized = grad_output * &self.gamma;
        let sum_grad = grad_normalized.sum_axis(Axis(0));
        let sum_grad_dot = (&grad_normalized * &cache.normalized).sum_axis(Axis(0));
        let grad_input = (grad_normalized * n - &sum_grad - &cache.normalized * &sum_grad_dot) * &cache.inv_std / n;

        (grad_input, vec![grad_gamma, grad_beta])
    }

    pub fn update_moving_stats(&mut self, cache: &BatchNormCache) {
        let m = self.momentum;
        let mean = cache.mean.view().insert_axis(Axis(0));
        let var = cache.var.view().insert_axis(Axis(0));
        self.moving_mean = &self.moving_mean * m + &mean * (1.0 - m);
        self.moving_var = &self.moving_var * m + &var * (1.0 - m);
    }
}

impl Layer for BatchNorm {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> LayerRole {
        LayerRole::Head
    }

    fn trainable(&self) -> bool {
        self.trainable
    }

    fn set_trainable(&mut self, trainable: bool) {
        self.trainable = trainable;
    }

    fn params_mut(&mut self) -> Vec<&mut Array2<f32>> {
        vec![&mut self.gamma, &mut self.beta]
    }

    fn weights(&self) -> Vec<Array2<f32>> {
        vec![
            self.gamma.clone(),
            self.beta.clone(),
            self.moving_mean.clone(),
            self.moving_var.clone(),
        ]
    }

    fn set_weights(&mut self, weights: Vec<Array2<f32>>) -> Result<(), TrainingError> {
        check_shapes(&self.name, &self.weights(), &weights)?;
        let mut it = weights.into_iter();
        if let (Some(g), Some(b), Some(m), Some(v)) = (it.next(), it.next(), it.next(), it.next()) {
            self.gamma = g;
            self.beta = b;
            self.moving_mean = m;
            self.moving_var = v;
        }
        Ok(())
    }
}

/// Per-class centroid lookup table.
#[derive(Debug, Clone)]
pub struct CentroidTable {
    name: String,
    centroids: Array2<f32>,
    trainable: bool,
    fixed: bool,
}

impl CentroidTable {
    /// Trainable centroids, initialised uniformly in `[-0.05, 0.05]`.
    pub fn learned(name: impl Into<String>, num_classes: usize, embed_dim: usize, rng: &mut StdRng) -> Self {
        Self {
            name: name.into(),
            centroids: Array2::random_using((num_classes, embed_dim), Uniform::new(-0.05, 0.05), rng),
            trainable: true,
            fixed: false,
        }
    }

    /// Externally supplied centroids; never trainable.
    pub fn fixed(name: impl Into<String>, centroids: Array2<f32>) -> Self {
        Self { name: name.into(), centroids, trainable: false, fixed: true }
    }

    pub fn num_classes(&self) -> usize {
        self.centroids.nrows()
    }

    pub fn centroids(&self) -> &Array2<f32> {
        &self.centroids
    }

    pub fn lookup(&self, labels: &[usize]) -> Array2<f32> {
        self.centroids.select(Axis(0), labels)
    }

    /// Scatters per-example gradients back onto the rows of their classes.
    pub fn backward(&self, labels: &[usize], grad_rows: &Array2<f32>) -> Array2<f32> {
        let mut grad = Array2::zeros(self.centroids.raw_dim());
        for (row, &label) in grad_rows.rows().into_iter().zip(labels) {
            let mut target = grad.row_mut(label);
            target += &row;
        }
        grad
    }
}

impl Layer for CentroidTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> LayerRole {
        LayerRole::Head
    }

    fn trainable(&self) -> bool {
        self.trainable
    }

    fn set_trainable(&mut self, trainable: bool) {
        self.trainable = trainable && !self.fixed;
    }

    fn locked(&self) -> bool {
        self.fixed
    }

    fn params_mut(&mut self) -> Vec<&mut Array2<f32>> {
        vec![&mut self.centroids]
    }

    fn weights(&self) -> Vec<Array2<f32>> {
        vec![self.centroids.clone()]
    }

    fn set_weights(&mut self, weights: Vec<Array2<f32>>) -> Result<(), TrainingError> {
        if self.fixed {
            return Err(TrainingError::ValidationError(format!(
                "Layer '{}' holds fixed centroids and cannot be overwritten",
                self.name
            )));
        }
        check_shapes(&self.name, &self.weights(), &weights)?;
        if let Some(c) = weights.into_iter().next() {
            self.centroids = c;
        }
        Ok(())
    }
}
