//! Data-feeding side of training.
//!
//! A [`DataGenerator`] describes a dataset and hands out [`BatchSequence`]s of
//! transformed batches; [`loader::BatchQueue`] prefetches a sequence on a pool
//! of reader workers.

use std::sync::Arc;

pub mod datasets;
pub mod loader;
pub mod transform;

use crate::error::TrainingError;
pub use datasets::{get_data_generator, ArrayDataset, DatasetArchive, DatasetKind, SyntheticParams};
pub use loader::BatchQueue;
pub use transform::{one_hot, transform_inputs, BatchTransform, ModelInputs, Targets, TransformedBatch};

/// Indexable sequence of batches.
///
/// Sequences are shared with reader workers, so any per-epoch state (such as
/// the shuffle order) lives behind interior mutability.
pub trait BatchSequence: Send + Sync {
    /// Number of batches per epoch.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of examples covered by one epoch.
    fn num_examples(&self) -> usize;

    fn get(&self, index: usize) -> Result<TransformedBatch, TrainingError>;

    fn on_epoch_end(&self) {}
}

/// Source of training and test data.
pub trait DataGenerator: Send + Sync {
    fn num_classes(&self) -> usize;

    fn num_train(&self) -> usize;

    fn num_test(&self) -> usize;

    /// Class indices of the test examples, in test order.
    fn labels_test(&self) -> &[usize];

    fn input_dim(&self) -> usize;

    /// Shuffled training batches.
    fn train_sequence(
        &self,
        batch_size: usize,
        transform: BatchTransform,
    ) -> Result<Arc<dyn BatchSequence>, TrainingError>;

    /// Test batches in a fixed order.
    fn test_sequence(
        &self,
        batch_size: usize,
        transform: BatchTransform,
    ) -> Result<Arc<dyn BatchSequence>, TrainingError>;
}
