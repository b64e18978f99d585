//! The dual-head center-loss model.
//!
//! One embedding trunk feeds two heads:
//! - a softmax classifier (`ReLU -> embedding_bn -> prob`), and
//! - a center-distance head comparing each embedding with the centroid of its
//!   class in `cls_centroids`.

use std::fmt::Write as _;

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

pub mod builder;
pub mod layers;
pub mod network;
pub mod weights;

use crate::error::TrainingError;
use layers::{relu, relu_backward, softmax, BatchNorm, BatchNormCache, CentroidTable, Dense, Layer, LayerRole};
use network::{EmbeddingNetwork, TrunkCache};

pub use builder::{CenterLossModelBuilder, CentroidSource};
pub use network::{build_network, Architecture, EMBEDDING_LAYER};
pub use weights::{LoadReport, ModelDefinition};

pub const EMBEDDING_BN_LAYER: &str = "embedding_bn";
pub const PROB_LAYER: &str = "prob";
pub const CENTROID_LAYER: &str = "cls_centroids";

/// Where the model's weights live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    /// Neutral host memory, shared by all replicas
    Host,
    /// A specific compute device
    Device(usize),
}

/// Outputs of a forward pass.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Class probabilities, `(batch, num_classes)`
    pub prob: Array2<f32>,
    /// Halved squared distance to the class centroid, `(batch,)`
    pub center_loss: Array1<f32>,
    /// Trunk embeddings, `(batch, embed_dim)`
    pub embedding: Array2<f32>,
}

/// Loss gradients with respect to the two model outputs.
#[derive(Debug, Clone)]
pub struct OutputGrads {
    /// Gradient w.r.t. the softmax logits
    pub logits: Array2<f32>,
    /// Gradient w.r.t. the per-example center distance
    pub center_loss: Array1<f32>,
}

/// Intermediate values of a training-mode forward pass.
#[derive(Debug, Clone)]
pub struct ForwardCache {
    labels: Vec<usize>,
    trunk: TrunkCache,
    embedding: Array2<f32>,
    batch_norm: BatchNormCache,
    normalized: Array2<f32>,
    center_diff: Array2<f32>,
}

/// Per-layer parameter gradients, in model layer order.
///
/// Layers that are not trainable carry no gradient.
#[derive(Debug, Clone)]
pub struct Gradients {
    layers: Vec<Option<Vec<Array2<f32>>>>,
}

impl Gradients {
    pub fn layer(&self, index: usize) -> Option<&[Array2<f32>]> {
        self.layers.get(index).and_then(|g| g.as_deref())
    }

    pub fn into_layers(self) -> Vec<Option<Vec<Array2<f32>>>> {
        self.layers
    }

    pub fn global_norm(&self) -> f32 {
        self.layers
            .iter()
            .flatten()
            .flatten()
            .map(|g| g.iter().map(|&v| v * v).sum::<f32>())
            .sum::<f32>()
            .sqrt()
    }

    pub fn scale(&mut self, factor: f32) {
        for grad in self.layers.iter_mut().flatten().flatten() {
            grad.mapv_inplace(|v| v * factor);
        }
    }

    /// Adds the gradients of another replica of the same model.
    pub fn accumulate(mut self, other: Gradients) -> Gradients {
        for (mine, theirs) in self.layers.iter_mut().zip(other.layers) {
            if let (Some(mine), Some(theirs)) = (mine.as_mut(), theirs) {
                for (a, b) in mine.iter_mut().zip(theirs) {
                    *a += &b;
                }
            }
        }
        self
    }
}

/// One row of [`CenterLossModel::summary`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSummary {
    pub name: String,
    pub role: LayerRole,
    pub params: usize,
    pub trainable: bool,
}

/// Embedding trunk plus softmax and center-loss heads.
#[derive(Debug, Clone)]
pub struct CenterLossModel {
    trunk: EmbeddingNetwork,
    embedding_bn: BatchNorm,
    prob: Dense,
    centroids: CentroidTable,
    placement: Placement,
}

impl CenterLossModel {
    /// Creates a new CenterLossModelBuilder for fluent construction
    pub fn builder() -> CenterLossModelBuilder {
        CenterLossModelBuilder::new()
    }

    pub(crate) fn from_parts(
        trunk: EmbeddingNetwork,
        embedding_bn: BatchNorm,
        prob: Dense,
        centroids: CentroidTable,
        placement: Placement,
    ) -> Self {
        Self { trunk, embedding_bn, prob, centroids, placement }
    }

    pub fn num_classes(&self) -> usize {
        self.centroids.num_classes()
    }

    pub fn embed_dim(&self) -> usize {
        self.trunk.embed_dim()
    }

    pub fn input_dim(&self) -> usize {
        self.trunk.input_dim()
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    pub fn network(&self) -> &EmbeddingNetwork {
        &self.trunk
    }

    pub fn has_fixed_centroids(&self) -> bool {
        self.centroids.locked()
    }

    pub fn centroids(&self) -> &Array2<f32> {
        self.centroids.centroids()
    }

    /// All layers in canonical order: trunk, `embedding_bn`, `prob`, `cls_centroids`.
    pub fn layers(&self) -> Vec<&dyn Layer> {
        let mut layers: Vec<&dyn Layer> = self.trunk.layer_refs().collect();
        layers.push(&self.embedding_bn);
        layers.push(&self.prob);
        layers.push(&self.centroids);
        layers
    }

    pub fn layers_mut(&mut self) -> Vec<&mut dyn Layer> {
        let mut layers: Vec<&mut dyn Layer> = self
            .trunk
            .layers_mut()
            .iter_mut()
            .map(|l| l as &mut dyn Layer)
            .collect();
        layers.push(&mut self.embedding_bn);
        layers.push(&mut self.prob);
        layers.push(&mut self.centroids);
        layers
    }

    /// Restricts training to the heads and the trunk's output layer.
    pub fn freeze_trunk(&mut self) {
        for layer in self.layers_mut() {
            let trainable = layer.role() != LayerRole::Trunk;
            layer.set_trainable(trainable);
        }
    }

    /// Makes every layer trainable again, except fixed centroids.
    pub fn unfreeze_all(&mut self) {
        for layer in self.layers_mut() {
            layer.set_trainable(true);
        }
    }

    pub fn summary(&self) -> Vec<LayerSummary> {
        self.layers()
            .into_iter()
            .map(|l| LayerSummary {
                name: l.name().to_string(),
                role: l.role(),
                params: l.num_params(),
                trainable: l.trainable(),
            })
            .collect()
    }

    /// Human readable layer table.
    pub fn summary_table(&self) -> String {
        let rows = self.summary();
        let mut out = String::new();
        let _ = writeln!(out, "{:<16} {:<12} {:>10} {:>10}", "Layer", "Role", "Params", "Trainable");
        for row in &rows {
            let _ = writeln!(
                out,
                "{:<16} {:<12} {:>10} {:>10}",
                row.name,
                format!("{:?}", row.role),
                row.params,
                row.trainable
            );
        }
        let total: usize = rows.iter().map(|r| r.params).sum();
        let trainable: usize = rows.iter().filter(|r| r.trainable).map(|r| r.params).sum();
        let _ = writeln!(out, "Total params: {} (trainable layers: {})", total, trainable);
        out
    }

    fn check_inputs(&self, images: &Array2<f32>, labels: &[usize]) -> Result<(), TrainingError> {
        if images.nrows() != labels.len() {
            return Err(TrainingError::ValidationError(format!(
                "Got {} images but {} labels",
                images.nrows(),
                labels.len()
            )));
        }
        if images.nrows() == 0 {
            return Err(TrainingError::ValidationError("Batch is empty".into()));
        }
        if images.ncols() != self.input_dim() {
            return Err(TrainingError::ValidationError(format!(
                "Images have {} features, model expects {}",
                images.ncols(),
                self.input_dim()
            )));
        }
        if let Some(&bad) = labels.iter().find(|&&l| l >= self.num_classes()) {
            return Err(TrainingError::ValidationError(format!(
                "Label {} out of range for {} classes",
                bad,
                self.num_classes()
            )));
        }
        Ok(())
    }

    fn center_distance(&self, embedding: &Array2<f32>, labels: &[usize]) -> (Array1<f32>, Array2<f32>) {
        let diff = embedding - &self.centroids.lookup(labels);
        let distance = diff.mapv(|v| v * v).sum_axis(Axis(1)) / 2.0;
        (distance, diff)
    }

    /// Inference-mode forward pass (batch normalization uses moving statistics).
    pub fn predict(&self, images: &Array2<f32>, labels: &[usize]) -> Result<ModelOutput, TrainingError> {
        self.check_inputs(images, labels)?;
        let embedding = self.trunk.forward(images);
        let normalized = self.embedding_bn.forward_inference(&relu(&embedding));
        let prob = softmax(&self.prob.forward(&normalized));
        let (center_loss, _) = self.center_distance(&embedding, labels);
        Ok(ModelOutput { prob, center_loss, embedding })
    }

    /// Training-mode forward pass, keeping what [`CenterLossModel::backward`] needs.
    pub fn forward_train(
        &self,
        images: &Array2<f32>,
        labels: &[usize],
    ) -> Result<(ModelOutput, ForwardCache), TrainingError> {
        self.check_inputs(images, labels)?;
        let (embedding, trunk) = self.trunk.forward_train(images);
        let (normalized, batch_norm) = self.embedding_bn.forward_train(&relu(&embedding));
        let prob = softmax(&self.prob.forward(&normalized));
        let (center_loss, center_diff) = self.center_distance(&embedding, labels);

        let cache = ForwardCache {
            labels: labels.to_vec(),
            trunk,
            embedding: embedding.clone(),
            batch_norm,
            normalized,
            center_diff,
        };
        Ok((ModelOutput { prob, center_loss, embedding }, cache))
    }

    pub fn backward(&self, cache: &ForwardCache, grads: &OutputGrads) -> Gradients {
        let (grad_normalized, prob_grads) = self.prob.backward(&cache.normalized, &grads.logits);
        let (grad_activated, bn_grads) = self.embedding_bn.backward(&cache.batch_norm, &grad_normalized);
        let mut grad_embedding = relu_backward(&cache.embedding, &grad_activated);

        let center_grad = &cache.center_diff * &grads.center_loss.view().insert_axis(Axis(1));
        grad_embedding += &center_grad;
        let centroid_grads = self.centroids.backward(&cache.labels, &(-&center_grad));

        let mut all: Vec<Vec<Array2<f32>>> = self.trunk.backward(&cache.trunk, &grad_embedding);
        all.push(bn_grads);
        all.push(prob_grads);
        all.push(vec![centroid_grads]);

        let layers = self
            .layers()
            .into_iter()
            .zip(all)
            .map(|(layer, g)| if layer.trainable() { Some(g) } else { None })
            .collect();
        Gradients { layers }
    }

    /// Folds the batch statistics of a training pass into the moving averages.
    pub fn update_batch_stats(&mut self, cache: &ForwardCache) {
        if self.embedding_bn.trainable() {
            self.embedding_bn.update_moving_stats(&cache.batch_norm);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    fn small_model(centroids: CentroidSource) -> CenterLossModel {
        CenterLossModel::builder()
            .with_architecture(Architecture::Simple, 4, 3)
            .unwrap()
            .with_hidden_layers(vec![6])
            .with_centroids(centroids)
            .unwrap()
            .with_seed(7)
            .build()
            .unwrap()
    }

    #[test]
    fn test_output_shapes() {
        let model = small_model(CentroidSource::Learned(5));
        let images = Array2::from_shape_fn((7, 4), |(i, j)| (i as f32 - j as f32) / 5.0);
        let labels = vec![0, 1, 2, 3, 4, 0, 1];
        let out = model.predict(&images, &labels).unwrap();
        assert_eq!(out.prob.dim(), (7, 5));
        assert_eq!(out.center_loss.len(), 7);
        assert_eq!(out.embedding.dim(), (7, 3));
        for row in out.prob.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_center_loss_is_half_squared_distance() {
        let fixed = arr2(&[[0.0, 0.0, 0.0], [1.0, 1.0, 1.0]]);
        let model = small_model(CentroidSource::Fixed(fixed.clone()));
        let images = Array2::from_elem((2, 4), 0.5);
        let out = model.predict(&images, &[1, 0]).unwrap();

        let expected: f32 = out.embedding.row(0).iter().map(|&e| (e - 1.0).powi(2)).sum::<f32>() / 2.0;
        assert_abs_diff_eq!(out.center_loss[0], expected, epsilon = 1e-5);
        let expected: f32 = out.embedding.row(1).iter().map(|&e| e * e).sum::<f32>() / 2.0;
        assert_abs_diff_eq!(out.center_loss[1], expected, epsilon = 1e-5);
    }

    #[test]
    fn test_out_of_range_label_rejected() {
        let model = small_model(CentroidSource::Learned(2));
        let images = Array2::zeros((1, 4));
        assert!(matches!(
            model.predict(&images, &[2]),
            Err(TrainingError::ValidationError(_))
        ));
    }

    #[test]
    fn test_freeze_trunk_keeps_heads_trainable() {
        let mut model = small_model(CentroidSource::Learned(2));
        model.freeze_trunk();
        let trainable: Vec<(String, bool)> =
            model.summary().into_iter().map(|s| (s.name, s.trainable)).collect();
        assert_eq!(
            trainable,
            vec![
                ("dense_1".to_string(), false),
                ("embedding".to_string(), true),
                ("embedding_bn".to_string(), true),
                ("prob".to_string(), true),
                ("cls_centroids".to_string(), true),
            ]
        );

        model.unfreeze_all();
        assert!(model.summary().iter().all(|s| s.trainable));
    }

    #[test]
    fn test_frozen_layers_have_no_gradient() {
        let fixed = Array2::zeros((2, 3));
        let mut model = small_model(CentroidSource::Fixed(fixed));
        model.freeze_trunk();
        let images = Array2::from_elem((2, 4), 1.0);
        let (out, cache) = model.forward_train(&images, &[0, 1]).unwrap();
        let grads = model.backward(
            &cache,
            &OutputGrads { logits: Array2::ones(out.prob.raw_dim()), center_loss: Array1::ones(2) },
        );
        assert!(grads.layer(0).is_none());
        assert!(grads.layer(1).is_some());
        assert!(grads.layer(4).is_none());
    }

    #[test]
    fn test_gradient_accumulation() {
        let model = small_model(CentroidSource::Learned(2));
        let images = Array2::from_elem((2, 4), 0.3);
        let (out, cache) = model.forward_train(&images, &[0, 1]).unwrap();
        let upstream = OutputGrads { logits: Array2::zeros(out.prob.raw_dim()), center_loss: Array1::ones(2) };
        let single = model.backward(&cache, &upstream);
        let doubled = single.clone().accumulate(single.clone());
        assert_abs_diff_eq!(doubled.global_norm(), 2.0 * single.global_norm(), epsilon = 1e-4);
    }
}
