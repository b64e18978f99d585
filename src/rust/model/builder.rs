use log::info;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::layers::{BatchNorm, CentroidTable, Dense, Layer, LayerRole};
use super::network::{build_network, Architecture};
use super::{CenterLossModel, Placement, CENTROID_LAYER, EMBEDDING_BN_LAYER, PROB_LAYER};
use crate::error::TrainingError;

/// Where the class centroids of the center-loss head come from.
#[derive(Debug, Clone)]
pub enum CentroidSource {
    /// Learn one centroid per class, starting from a small random init
    Learned(usize),
    /// Use a precomputed `(num_classes, embed_dim)` matrix and never update it
    Fixed(Array2<f32>),
}

impl CentroidSource {
    pub fn num_classes(&self) -> usize {
        match self {
            Self::Learned(n) => *n,
            Self::Fixed(m) => m.nrows(),
        }
    }
}

/// A builder for constructing a [`CenterLossModel`] with a fluent interface.
#[derive(Debug)]
pub struct CenterLossModelBuilder {
    network: Option<(Architecture, usize, usize)>,
    hidden_layers: Option<Vec<usize>>,
    centroids: Option<CentroidSource>,
    seed: Option<u64>,
    placement: Placement,
}

impl Default for CenterLossModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CenterLossModelBuilder {
    pub fn new() -> Self {
        Self {
            network: None,
            hidden_layers: None,
            centroids: None,
            seed: None,
            placement: Placement::Device(0),
        }
    }

    /// Sets the embedding network.
    ///
    /// # Arguments
    /// * `architecture` - Layout of the trunk
    /// * `input_dim` - Number of features per input row
    /// * `embed_dim` - Dimensionality of the embedding
    ///
    /// # Returns
    /// * `Result<Self, TrainingError>` - The builder, or a `BuildError` if the
    ///   network was already set or a dimension is zero
    pub fn with_architecture(
        mut self,
        architecture: Architecture,
        input_dim: usize,
        embed_dim: usize,
    ) -> Result<Self, TrainingError> {
        if self.network.is_some() {
            return Err(TrainingError::BuildError("Embedding network already set".to_string()));
        }
        if input_dim == 0 || embed_dim == 0 {
            return Err(TrainingError::BuildError(
                "Input and embedding dimensionality must be positive".to_string(),
            ));
        }
        self.network = Some((architecture, input_dim, embed_dim));
        Ok(self)
    }

    /// Overrides the hidden layer widths of the chosen architecture.
    pub fn with_hidden_layers(mut self, widths: Vec<usize>) -> Self {
        self.hidden_layers = Some(widths);
        self
    }

    pub fn with_centroids(mut self, source: CentroidSource) -> Result<Self, TrainingError> {
        if self.centroids.is_some() {
            return Err(TrainingError::BuildError("Centroid source already set".to_string()));
        }
        if source.num_classes() == 0 {
            return Err(TrainingError::BuildError("At least one class is required".to_string()));
        }
        self.centroids = Some(source);
        Ok(self)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    /// Builds the model.
    ///
    /// # Returns
    /// * `Result<CenterLossModel, TrainingError>` - The model, or a `BuildError` if:
    ///   - No network or centroid source is set
    ///   - Fixed centroids do not match the embedding dimensionality
    pub fn build(self) -> Result<CenterLossModel, TrainingError> {
        let (architecture, input_dim, embed_dim) = self
            .network
            .ok_or_else(|| TrainingError::BuildError("Embedding network must be set".to_string()))?;
        let source = self
            .centroids
            .ok_or_else(|| TrainingError::BuildError("Centroid source must be set".to_string()))?;

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let trunk = build_network(architecture, input_dim, embed_dim, self.hidden_layers.as_deref(), &mut rng)?;
        let num_classes = source.num_classes();
        let centroids = match source {
            CentroidSource::Learned(n) => CentroidTable::learned(CENTROID_LAYER, n, embed_dim, &mut rng),
            CentroidSource::Fixed(matrix) => {
                if matrix.ncols() != embed_dim {
                    return Err(TrainingError::BuildError(format!(
                        "Fixed centroids have dimension {}, embedding has {}",
                        matrix.ncols(),
                        embed_dim
                    )));
                }
                CentroidTable::fixed(CENTROID_LAYER, matrix)
            }
        };
        let embedding_bn = BatchNorm::new(EMBEDDING_BN_LAYER, embed_dim);
        let prob = Dense::new(PROB_LAYER, embed_dim, num_classes, LayerRole::Head, &mut rng);

        info!(
            "Built {} network: {} -> {:?} -> {}, {} classes ({} centroids), placement {:?}",
            architecture,
            input_dim,
            trunk.hidden_widths(),
            embed_dim,
            num_classes,
            if centroids.locked() { "fixed" } else { "learned" },
            self.placement
        );

        Ok(CenterLossModel::from_parts(trunk, embedding_bn, prob, centroids, self.placement))
    }
}
