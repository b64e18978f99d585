use ndarray::{Array1, Axis};

use crate::data::Targets;
use crate::error::TrainingError;
use crate::model::{ModelOutput, OutputGrads};

const PROB_EPSILON: f32 = 1e-7;

/// Loss values of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossBreakdown {
    /// Weighted sum of both terms
    pub total: f32,
    /// Categorical cross-entropy of the softmax head
    pub prob: f32,
    /// Mean center distance
    pub center_loss: f32,
    pub accuracy: f32,
}

/// Softmax cross-entropy plus weighted center loss.
///
/// The center-loss term is the mean of the model's own center-distance output;
/// its target is never read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointObjective {
    pub center_loss_weight: f32,
}

impl Default for JointObjective {
    fn default() -> Self {
        Self { center_loss_weight: 0.1 }
    }
}

impl JointObjective {
    pub fn new(center_loss_weight: f32) -> Result<Self, TrainingError> {
        if !center_loss_weight.is_finite() || center_loss_weight < 0.0 {
            return Err(TrainingError::ConfigError(format!(
                "Center loss weight must be a non-negative number, got {}",
                center_loss_weight
            )));
        }
        Ok(Self { center_loss_weight })
    }

    pub fn evaluate(&self, outputs: &ModelOutput, targets: &Targets) -> LossBreakdown {
        let n = outputs.prob.nrows();
        if n == 0 {
            return LossBreakdown::default();
        }
        let clipped = outputs.prob.mapv(|p| p.clamp(PROB_EPSILON, 1.0 - PROB_EPSILON));
        let prob = -(&targets.one_hot * &clipped.mapv(f32::ln)).sum() / n as f32;
        let center_loss = outputs.center_loss.mean().unwrap_or(0.0);

        let correct = outputs
            .prob
            .rows()
            .into_iter()
            .zip(targets.one_hot.rows())
            .filter(|(p, t)| argmax(p.iter()) == argmax(t.iter()))
            .count();

        LossBreakdown {
            total: prob + self.center_loss_weight * center_loss,
            prob,
            center_loss,
            accuracy: correct as f32 / n as f32,
        }
    }

    /// Gradients w.r.t. the softmax logits and the center-distance output.
    ///
    /// `denominator` is the size of the full batch, so that gradients of
    /// replica shards sum to the gradient of the whole batch.
    pub fn gradients(&self, outputs: &ModelOutput, targets: &Targets, denominator: usize) -> OutputGrads {
        let n = denominator.max(1) as f32;
        let logits = (&outputs.prob - &targets.one_hot) / n;
        let center_loss = Array1::from_elem(outputs.center_loss.len(), self.center_loss_weight / n);
        OutputGrads { logits, center_loss }
    }
}

/// Index of the largest value; the first one wins ties.
pub fn argmax<'a>(values: impl Iterator<Item = &'a f32>) -> usize {
    values
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, max), (i, &v)| if v > max { (i, v) } else { (best, max) })
        .0
}

/// Predicted class per row of a probability matrix.
pub fn predicted_classes(prob: &ndarray::Array2<f32>) -> Vec<usize> {
    prob.axis_iter(Axis(0)).map(|row| argmax(row.iter())).collect()
}
