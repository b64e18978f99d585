use ndarray::Array2;

use crate::error::TrainingError;
use crate::model::layers::Layer;
use crate::model::{CenterLossModel, Gradients};

/// Clips gradients by their global norm.
///
/// Only layers that carry a gradient (trainable layers) count towards the norm.
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut Gradients, max_norm: f32) -> f32 {
    let norm = grads.global_norm();
    if max_norm > 0.0 && norm > max_norm {
        grads.scale(max_norm / norm);
    }
    norm
}

/// Inverse-time decay that shrinks the learning rate by `max_decay` over the
/// whole run.
///
/// A non-positive `max_decay` disables decay. Values in `(0, 1)` would grow the
/// rate and are rejected.
pub fn decay_for_max_decay(
    max_decay: f32,
    num_train: usize,
    batch_size: usize,
    epochs: usize,
) -> Result<f32, TrainingError> {
    if max_decay <= 0.0 {
        return Ok(0.0);
    }
    if max_decay < 1.0 {
        return Err(TrainingError::ConfigError(format!(
            "max_decay must be at least 1 or non-positive, got {}",
            max_decay
        )));
    }
    let steps_per_epoch = (num_train / batch_size.max(1)).max(1);
    let total_steps = (steps_per_epoch * epochs.max(1)) as f32;
    Ok((max_decay - 1.0) / total_steps)
}

/// SGD with momentum, inverse-time decay and gradient-norm clipping.
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f32,
    momentum: f32,
    decay: f32,
    clipnorm: Option<f32>,
    iterations: u64,
    velocities: Vec<Vec<Option<Array2<f32>>>>,
}

impl Sgd {
    pub fn new(lr: f32, momentum: f32) -> Result<Self, TrainingError> {
        if !(lr > 0.0 && lr.is_finite()) {
            return Err(TrainingError::ConfigError(format!("Learning rate must be positive, got {}", lr)));
        }
        if !(0.0..1.0).contains(&momentum) {
            return Err(TrainingError::ConfigError(format!("Momentum must be in [0, 1), got {}", momentum)));
        }
        Ok(Self { lr, momentum, decay: 0.0, clipnorm: None, iterations: 0, velocities: Vec::new() })
    }

    pub fn with_decay(mut self, decay: f32) -> Self {
        self.decay = decay.max(0.0);
        self
    }

    /// Clip gradients whose global norm exceeds `clipnorm`; non-positive disables clipping.
    pub fn with_clipnorm(mut self, clipnorm: f32) -> Self {
        self.clipnorm = (clipnorm > 0.0).then_some(clipnorm);
        self
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Learning rate after inverse-time decay: `lr / (1 + decay * t)`.
    pub fn current_lr(&self) -> f32 {
        self.lr / (1.0 + self.decay * self.iterations as f32)
    }

    /// Applies one update. Layers without a gradient are left untouched.
    ///
    /// Returns the gradient norm before clipping.
    pub fn step(&mut self, model: &mut CenterLossModel, mut grads: Gradients) -> f32 {
        let norm = match self.clipnorm {
            Some(max) => clip_grad_norm(&mut grads, max),
            None => grads.global_norm(),
        };
        let lr = self.current_lr();

        let mut layers = model.layers_mut();
        if self.velocities.len() != layers.len() {
            self.velocities = layers.iter_mut().map(|l| vec![None; l.params_mut().len()]).collect();
        }

        for ((layer, layer_grads), velocities) in
            layers.iter_mut().zip(grads.into_layers()).zip(self.velocities.iter_mut())
        {
            let Some(layer_grads) = layer_grads else { continue };
            if !layer.trainable() {
                continue;
            }
            for ((param, grad), velocity) in layer.params_mut().into_iter().zip(layer_grads).zip(velocities.iter_mut()) {
                let v = match velocity.take() {
                    Some(v) => v * self.momentum - &grad * lr,
                    None => grad * -lr,
                };
                *param += &v;
                *velocity = Some(v);
            }
        }

        self.iterations += 1;
        norm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Architecture, CentroidSource, OutputGrads};
    use approx::assert_abs_diff_eq;
    use ndarray::Array1;

    fn model() -> CenterLossModel {
        CenterLossModel::builder()
            .with_architecture(Architecture::Simple, 3, 2)
            .unwrap()
            .with_hidden_layers(vec![4])
            .with_centroids(CentroidSource::Learned(2))
            .unwrap()
            .with_seed(5)
            .build()
            .unwrap()
    }

    fn gradients(model: &CenterLossModel) -> Gradients {
        let images = ndarray::arr2(&[[1.0, 0.5, -0.5], [0.2, -1.0, 0.3]]);
        let (out, cache) = model.forward_train(&images, &[0, 1]).unwrap();
        let upstream = OutputGrads { logits: Array2::ones(out.prob.raw_dim()) * 5.0, center_loss: Array1::ones(2) };
        model.backward(&cache, &upstream)
    }

    #[test]
    fn test_inverse_time_decay() {
        let mut sgd = Sgd::new(0.1, 0.9).unwrap().with_decay(0.5);
        let mut m = model();
        assert_abs_diff_eq!(sgd.current_lr(), 0.1);
        for _ in 0..2 {
            let g = gradients(&m);
            sgd.step(&mut m, g);
        }
        assert_abs_diff_eq!(sgd.current_lr(), 0.05, epsilon = 1e-7);
    }

    #[test]
    fn test_clipping_bounds_norm() {
        let m = model();
        let mut g = gradients(&m);
        let before = clip_grad_norm(&mut g, 0.01);
        assert!(before > 0.01);
        assert_abs_diff_eq!(g.global_norm(), 0.01, epsilon = 1e-5);
    }

    #[test]
    fn test_frozen_layers_untouched() {
        let mut m = model();
        m.freeze_trunk();
        let before = m.network().layers()[0].clone();
        let mut sgd = Sgd::new(0.5, 0.9).unwrap().with_clipnorm(10.0);
        let g = gradients(&m);
        sgd.step(&mut m, g);
        assert_eq!(m.network().layers()[0].weights(), before.weights());
        assert_ne!(m.network().layers()[1].weights(), model().network().layers()[1].weights());
    }

    #[test]
    fn test_max_decay_reached_at_end_of_training() {
        // 10 steps per epoch for 5 epochs
        let decay = decay_for_max_decay(10.0, 1000, 100, 5).unwrap();
        assert_abs_diff_eq!(decay, 9.0 / 50.0);
        let final_lr = 0.1 / (1.0 + decay * 50.0);
        assert_abs_diff_eq!(final_lr, 0.01, epsilon = 1e-7);

        assert_eq!(decay_for_max_decay(0.0, 1000, 100, 5).unwrap(), 0.0);
        assert!(decay_for_max_decay(0.5, 1000, 100, 5).is_err());
        // fewer examples than one batch still count as one step
        assert_abs_diff_eq!(decay_for_max_decay(3.0, 10, 100, 2).unwrap(), 1.0);
    }

    #[test]
    fn test_invalid_learning_rate() {
        assert!(Sgd::new(0.0, 0.9).is_err());
        assert!(Sgd::new(0.1, 1.5).is_err());
    }
}
