use std::fmt;
use std::str::FromStr;

use ndarray::Array2;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::layers::{relu, relu_backward, Dense, Layer, LayerRole};
use crate::error::TrainingError;

/// Name of the final trunk layer; its output is the embedding.
pub const EMBEDDING_LAYER: &str = "embedding";

/// Supported embedding network architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    /// One hidden layer of 128 units
    Simple,
    /// Three hidden layers of 512, 256 and 128 units
    Deep,
}

impl Architecture {
    pub fn hidden_layers(&self) -> &'static [usize] {
        match self {
            Self::Simple => &[128],
            Self::Deep => &[512, 256, 128],
        }
    }
}

impl FromStr for Architecture {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "simple" => Ok(Self::Simple),
            "deep" => Ok(Self::Deep),
            other => Err(TrainingError::ConfigError(format!(
                "Unknown architecture '{}' (expected one of: simple, deep)",
                other
            ))),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple => write!(f, "simple"),
            Self::Deep => write!(f, "deep"),
        }
    }
}

/// Activations of a trunk forward pass.
#[derive(Debug, Clone)]
pub struct TrunkCache {
    /// Input of every layer, in order
    inputs: Vec<Array2<f32>>,
    /// Pre-activation output of every hidden layer
    pre_activations: Vec<Array2<f32>>,
}

/// Feed-forward network mapping input rows to embeddings.
///
/// Hidden layers use ReLU; the final `embedding` layer is linear.
#[derive(Debug, Clone)]
pub struct EmbeddingNetwork {
    architecture: Architecture,
    layers: Vec<Dense>,
}

impl EmbeddingNetwork {
    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub fn input_dim(&self) -> usize {
        self.layers.first().map(Dense::input_dim).unwrap_or(0)
    }

    pub fn embed_dim(&self) -> usize {
        self.layers.last().map(Dense::output_dim).unwrap_or(0)
    }

    pub fn hidden_widths(&self) -> Vec<usize> {
        self.layers[..self.layers.len() - 1].iter().map(Dense::output_dim).collect()
    }

    pub fn layers(&self) -> &[Dense] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Dense] {
        &mut self.layers
    }

    pub(crate) fn layer_refs(&self) -> impl Iterator<Item = &dyn Layer> {
        self.layers.iter().map(|l| l as &dyn Layer)
    }

    pub fn forward(&self, input: &Array2<f32>) -> Array2<f32> {
        let last = self.layers.len() - 1;
        let mut x = input.to_owned();
        for (i, layer) in self.layers.iter().enumerate() {
            let z = layer.forward(&x);
            x = if i == last { z } else { relu(&z) };
        }
        x
    }

    pub fn forward_train(&self, input: &Array2<f32>) -> (Array2<f32>, TrunkCache) {
        let last = self.layers.len() - 1;
        let mut cache = TrunkCache { inputs: Vec::with_capacity(self.layers.len()), pre_activations: Vec::new() };
        let mut x = input.to_owned();
        for (i, layer) in self.layers.iter().enumerate() {
            let z = layer.forward(&x);
            cache.inputs.push(x);
            x = if i == last {
                z
            } else {
                let activated = relu(&z);
                cache.pre_activations.push(z);
                activated
            };
        }
        (x, cache)
    }

    /// Backpropagates an embedding gradient; returns `[dW, db]` per layer.
    pub fn backward(&self, cache: &TrunkCache, grad_embedding: &Array2<f32>) -> Vec<Vec<Array2<f32>>> {
        let last = self.layers.len() - 1;
        let mut grads = vec![Vec::new(); self.layers.len()];
        let mut grad = grad_embedding.to_owned();
        for i in (0..self.layers.len()).rev() {
            if i != last {
                grad = relu_backward(&cache.pre_activations[i], &grad);
            }
            let (grad_input, layer_grads) = self.layers[i].backward(&cache.inputs[i], &grad);
            grads[i] = layer_grads;
            grad = grad_input;
        }
        grads
    }
}

/// Builds an embedding network of the given architecture.
///
/// The widths passed in `hidden` override the architecture defaults; this is
/// how reloaded model definitions reproduce their exact layout.
pub fn build_network(
    architecture: Architecture,
    input_dim: usize,
    embed_dim: usize,
    hidden: Option<&[usize]>,
    rng: &mut StdRng,
) -> Result<EmbeddingNetwork, TrainingError> {
    if input_dim == 0 {
        return Err(TrainingError::BuildError("Input dimensionality must be positive".into()));
    }
    if embed_dim == 0 {
        return Err(TrainingError::BuildError("Embedding dimensionality must be positive".into()));
    }
    let hidden = hidden.unwrap_or_else(|| architecture.hidden_layers());

    let mut layers = Vec::with_capacity(hidden.len() + 1);
    let mut width = input_dim;
    for (i, &units) in hidden.iter().enumerate() {
        if units == 0 {
            return Err(TrainingError::BuildError(format!("Hidden layer {} has no units", i + 1)));
        }
        layers.push(Dense::new(format!("dense_{}", i + 1), width, units, LayerRole::Trunk, rng));
        width = units;
    }
    layers.push(Dense::new(EMBEDDING_LAYER, width, embed_dim, LayerRole::TrunkOutput, rng));

    Ok(EmbeddingNetwork { architecture, layers })
}
