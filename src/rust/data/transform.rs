use ndarray::{Array1, Array2};

use crate::error::TrainingError;

/// The two model inputs: image rows and their class indices.
#[derive(Debug, Clone)]
pub struct ModelInputs {
    pub images: Array2<f32>,
    pub labels: Vec<usize>,
}

/// Targets for the two model outputs.
///
/// `center` is a placeholder of zeros; the joint objective never reads it.
#[derive(Debug, Clone)]
pub struct Targets {
    pub one_hot: Array2<f32>,
    pub center: Array1<f32>,
}

#[derive(Debug, Clone)]
pub struct TransformedBatch {
    pub inputs: ModelInputs,
    pub targets: Targets,
}

impl TransformedBatch {
    pub fn len(&self) -> usize {
        self.inputs.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.labels.is_empty()
    }
}

/// Converts a raw batch into the layout the batch sequences yield.
pub type BatchTransform = fn(Array2<f32>, Vec<usize>, usize) -> Result<TransformedBatch, TrainingError>;

pub fn one_hot(labels: &[usize], num_classes: usize) -> Result<Array2<f32>, TrainingError> {
    let mut encoded = Array2::zeros((labels.len(), num_classes));
    for (row, &label) in labels.iter().enumerate() {
        if label >= num_classes {
            return Err(TrainingError::ValidationError(format!(
                "Label {} at position {} out of range for {} classes",
                label, row, num_classes
            )));
        }
        encoded[[row, label]] = 1.0;
    }
    Ok(encoded)
}

/// Pairs images with their labels as inputs and builds one-hot plus
/// placeholder targets.
pub fn transform_inputs(
    images: Array2<f32>,
    labels: Vec<usize>,
    num_classes: usize,
) -> Result<TransformedBatch, TrainingError> {
    if images.nrows() != labels.len() {
        return Err(TrainingError::ValidationError(format!(
            "Batch has {} images but {} labels",
            images.nrows(),
            labels.len()
        )));
    }
    let one_hot = one_hot(&labels, num_classes)?;
    let center = Array1::zeros(labels.len());
    Ok(TransformedBatch {
        inputs: ModelInputs { images, labels },
        targets: Targets { one_hot, center },
    })
}
