//! Training, evaluation and prediction loops.

use std::sync::Arc;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use ndarray::{concatenate, s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use rayon::ThreadPool;

use super::callbacks::{CallbackAction, CallbackContext, EpochLogs, TrainingCallback};
use super::objective::{JointObjective, LossBreakdown};
use super::optimizer::Sgd;
use crate::data::{BatchQueue, BatchSequence, Targets, TransformedBatch};
use crate::error::TrainingError;
use crate::model::{CenterLossModel, ForwardCache, Gradients};
use crate::runtime::{MergeStrategy, RuntimeConfig};

/// Outputs of a prediction pass, in sequence order.
#[derive(Debug, Clone)]
pub struct Predictions {
    pub prob: Array2<f32>,
    pub center_loss: Array1<f32>,
    pub embedding: Array2<f32>,
}

struct Shard {
    images: Array2<f32>,
    labels: Vec<usize>,
    targets: Targets,
}

struct ShardResult {
    loss: LossBreakdown,
    size: usize,
    grads: Gradients,
    cache: ForwardCache,
}

/// Running, example-weighted mean of batch losses.
#[derive(Default)]
struct LossAccumulator {
    sum: LossBreakdown,
    examples: usize,
}

impl LossAccumulator {
    fn add(&mut self, loss: &LossBreakdown, examples: usize) {
        let w = examples as f32;
        self.sum.total += loss.total * w;
        self.sum.prob += loss.prob * w;
        self.sum.center_loss += loss.center_loss * w;
        self.sum.accuracy += loss.accuracy * w;
        self.examples += examples;
    }

    fn mean(&self) -> LossBreakdown {
        let n = self.examples.max(1) as f32;
        LossBreakdown {
            total: self.sum.total / n,
            prob: self.sum.prob / n,
            center_loss: self.sum.center_loss / n,
            accuracy: self.sum.accuracy / n,
        }
    }
}

fn apply(action: CallbackAction, optimizer: &mut Sgd) {
    if let CallbackAction::SetLr(lr) = action {
        if lr != optimizer.lr() {
            debug!("Learning rate set to {:e}", lr);
        }
        optimizer.set_lr(lr);
    }
}

/// Drives a model through batches of a [`BatchSequence`].
///
/// With more than one device every batch is split into one shard per device.
/// Shards run forward and backward passes concurrently on the replica pool and
/// their gradients are summed before a single optimizer step.
pub struct Trainer {
    objective: JointObjective,
    runtime: RuntimeConfig,
    pool: Option<ThreadPool>,
    show_progress: bool,
}

impl Trainer {
    pub fn new(objective: JointObjective, runtime: RuntimeConfig, show_progress: bool) -> Result<Self, TrainingError> {
        runtime.validate()?;
        let pool = if runtime.devices > 1 { Some(runtime.replica_pool()?) } else { None };
        Ok(Self { objective, runtime, pool, show_progress })
    }

    pub fn objective(&self) -> &JointObjective {
        &self.objective
    }

    fn progress_bar(&self, len: usize, prefix: String) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_prefix(prefix);
        bar
    }

    fn shards(&self, batch: &TransformedBatch) -> Vec<Shard> {
        let n = batch.len();
        let shard_size = n.div_ceil(self.runtime.devices.max(1)).max(1);
        (0..n)
            .step_by(shard_size)
            .map(|start| {
                let end = (start + shard_size).min(n);
                Shard {
                    images: batch.inputs.images.slice(s![start..end, ..]).to_owned(),
                    labels: batch.inputs.labels[start..end].to_vec(),
                    targets: Targets {
                        one_hot: batch.targets.one_hot.slice(s![start..end, ..]).to_owned(),
                        center: batch.targets.center.slice(s![start..end]).to_owned(),
                    },
                }
            })
            .collect()
    }

    fn run_shard(&self, model: &CenterLossModel, shard: &Shard, batch_size: usize) -> Result<ShardResult, TrainingError> {
        let (outputs, cache) = model.forward_train(&shard.images, &shard.labels)?;
        let loss = self.objective.evaluate(&outputs, &shard.targets);
        let upstream = self.objective.gradients(&outputs, &shard.targets, batch_size);
        let grads = model.backward(&cache, &upstream);
        Ok(ShardResult { loss, size: shard.labels.len(), grads, cache })
    }

    /// One optimizer step on a batch. Returns the batch loss.
    pub fn train_step(
        &self,
        model: &mut CenterLossModel,
        optimizer: &mut Sgd,
        batch: &TransformedBatch,
    ) -> Result<LossBreakdown, TrainingError> {
        let n = batch.len();
        if n == 0 {
            return Err(TrainingError::DataError("Cannot train on an empty batch".into()));
        }

        let results: Vec<ShardResult> = match &self.pool {
            Some(pool) => {
                let shards = self.shards(batch);
                let replica: &CenterLossModel = model;
                pool.install(|| {
                    shards
                        .par_iter()
                        .map(|shard| self.run_shard(replica, shard, n))
                        .collect::<Result<Vec<_>, _>>()
                })?
            }
            None => {
                let shard = Shard {
                    images: batch.inputs.images.clone(),
                    labels: batch.inputs.labels.clone(),
                    targets: batch.targets.clone(),
                };
                vec![self.run_shard(model, &shard, n)?]
            }
        };

        let mut loss = LossAccumulator::default();
        let mut caches = Vec::with_capacity(results.len());
        let mut grads = Vec::with_capacity(results.len());
        for result in results {
            loss.add(&result.loss, result.size);
            caches.push(result.cache);
            grads.push(result.grads);
        }

        let merged = match (&self.pool, self.runtime.merge) {
            (Some(pool), MergeStrategy::Device) => {
                pool.install(|| grads.into_par_iter().reduce_with(Gradients::accumulate))
            }
            _ => grads.into_iter().reduce(Gradients::accumulate),
        }
        .ok_or_else(|| TrainingError::DataError("Batch produced no gradients".into()))?;

        for cache in &caches {
            model.update_batch_stats(cache);
        }
        optimizer.step(model, merged);
        Ok(loss.mean())
    }

    /// Trains for `epochs` epochs and returns the per-epoch logs.
    pub fn fit(
        &self,
        model: &mut CenterLossModel,
        optimizer: &mut Sgd,
        train: Arc<dyn BatchSequence>,
        validation: Option<Arc<dyn BatchSequence>>,
        epochs: usize,
        callbacks: &mut [Box<dyn TrainingCallback>],
    ) -> Result<Vec<EpochLogs>, TrainingError> {
        let steps_per_epoch = train.len();
        let mut ctx = CallbackContext {
            num_epochs: epochs,
            steps_per_epoch,
            lr: optimizer.lr(),
            ..Default::default()
        };
        for cb in callbacks.iter_mut() {
            apply(cb.on_train_begin(&ctx), optimizer);
        }
        let started = Instant::now();
        info!(
            "Training {} epochs of {} steps ({} examples) on {} device(s)",
            epochs,
            steps_per_epoch,
            train.num_examples(),
            self.runtime.devices
        );

        let mut history = Vec::with_capacity(epochs);
        for epoch in 0..epochs {
            ctx.epoch = epoch;
            ctx.lr = optimizer.lr();
            for cb in callbacks.iter_mut() {
                apply(cb.on_epoch_begin(&ctx), optimizer);
            }

            let bar = self.progress_bar(steps_per_epoch, format!("Epoch {}/{}", epoch + 1, epochs));
            let queue = BatchQueue::start(Arc::clone(&train), self.runtime.read_workers, self.runtime.queue_size)?;
            let mut running = LossAccumulator::default();

            for (step, batch) in queue.enumerate() {
                let batch = batch?;
                ctx.step = step;
                ctx.lr = optimizer.lr();
                for cb in callbacks.iter_mut() {
                    apply(cb.on_batch_begin(&ctx), optimizer);
                }

                let loss = self.train_step(model, optimizer, &batch)?;
                running.add(&loss, batch.len());

                ctx.loss = loss.total;
                ctx.lr = optimizer.lr();
                for cb in callbacks.iter_mut() {
                    apply(cb.on_batch_end(&ctx), optimizer);
                }
                ctx.global_step += 1;

                let mean = running.mean();
                bar.set_message(format!("loss {:.4} acc {:.4}", mean.total, mean.accuracy));
                bar.inc(1);
            }
            bar.finish_and_clear();
            train.on_epoch_end();

            let epoch_loss = running.mean();
            let val = match &validation {
                Some(seq) => Some(self.evaluate(model, Arc::clone(seq))?),
                None => None,
            };
            let logs = EpochLogs {
                epoch,
                loss: epoch_loss.total,
                prob_loss: epoch_loss.prob,
                center_loss: epoch_loss.center_loss,
                accuracy: epoch_loss.accuracy,
                val_loss: val.map(|v| v.total),
                val_accuracy: val.map(|v| v.accuracy),
                lr: optimizer.current_lr(),
            };
            info!(
                "Epoch {}/{}: loss {:.4} (prob {:.4}, center {:.4}) acc {:.4}{}",
                epoch + 1,
                epochs,
                logs.loss,
                logs.prob_loss,
                logs.center_loss,
                logs.accuracy,
                match (logs.val_loss, logs.val_accuracy) {
                    (Some(l), Some(a)) => format!(" - val loss {:.4} val acc {:.4}", l, a),
                    _ => String::new(),
                }
            );

            ctx.loss = logs.loss;
            ctx.val_loss = logs.val_loss;
            ctx.lr = optimizer.lr();
            for cb in callbacks.iter_mut() {
                apply(cb.on_epoch_end(&ctx, &logs), optimizer);
            }
            history.push(logs);
        }

        for cb in callbacks.iter_mut() {
            cb.on_train_end(&ctx);
        }
        info!("Training finished in {:.1}s", started.elapsed().as_secs_f64());
        Ok(history)
    }

    /// Example-weighted mean loss and accuracy over a sequence.
    pub fn evaluate(&self, model: &CenterLossModel, sequence: Arc<dyn BatchSequence>) -> Result<LossBreakdown, TrainingError> {
        let queue = BatchQueue::start(sequence, self.runtime.read_workers, self.runtime.queue_size)?;
        let mut total = LossAccumulator::default();
        for batch in queue {
            let batch = batch?;
            if batch.is_empty() {
                continue;
            }
            let outputs = model.predict(&batch.inputs.images, &batch.inputs.labels)?;
            total.add(&self.objective.evaluate(&outputs, &batch.targets), batch.len());
        }
        Ok(total.mean())
    }

    /// Runs the model over a sequence in inference mode.
    pub fn predict(&self, model: &CenterLossModel, sequence: Arc<dyn BatchSequence>) -> Result<Predictions, TrainingError> {
        let bar = self.progress_bar(sequence.len(), "Predict".to_string());
        let queue = BatchQueue::start(sequence, self.runtime.read_workers, self.runtime.queue_size)?;
        let mut prob = Vec::new();
        let mut center_loss = Vec::new();
        let mut embedding = Vec::new();
        for batch in queue {
            let batch = batch?;
            if !batch.is_empty() {
                let out = model.predict(&batch.inputs.images, &batch.inputs.labels)?;
                prob.push(out.prob);
                center_loss.push(out.center_loss);
                embedding.push(out.embedding);
            }
            bar.inc(1);
        }
        bar.finish_and_clear();

        let stack2 = |parts: &[Array2<f32>], cols: usize| -> Result<Array2<f32>, TrainingError> {
            if parts.is_empty() {
                return Ok(Array2::zeros((0, cols)));
            }
            let views: Vec<ArrayView2<f32>> = parts.iter().map(|p| p.view()).collect();
            concatenate(Axis(0), &views).map_err(|e| TrainingError::DataError(format!("Ragged predictions: {}", e)))
        };
        let views: Vec<ArrayView1<f32>> = center_loss.iter().map(|c| c.view()).collect();
        let center_loss = if views.is_empty() {
            Array1::zeros(0)
        } else {
            concatenate(Axis(0), &views).map_err(|e| TrainingError::DataError(format!("Ragged predictions: {}", e)))?
        };

        Ok(Predictions {
            prob: stack2(&prob, model.num_classes())?,
            center_loss,
            embedding: stack2(&embedding, model.embed_dim())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{transform_inputs, ArrayDataset, DataGenerator, SyntheticParams};
    use crate::model::{Architecture, CentroidSource};

    fn setup(devices: usize, merge: MergeStrategy) -> (ArrayDataset, CenterLossModel, Trainer) {
        let params = SyntheticParams { num_classes: 3, input_dim: 6, train_per_class: 8, test_per_class: 3, spread: 0.2 };
        let data = ArrayDataset::synthetic(params, 3).unwrap();
        let model = CenterLossModel::builder()
            .with_architecture(Architecture::Simple, 6, 4)
            .unwrap()
            .with_hidden_layers(vec![8])
            .with_centroids(CentroidSource::Learned(3))
            .unwrap()
            .with_seed(3)
            .build()
            .unwrap();
        let runtime = RuntimeConfig { devices, merge, read_workers: 2, queue_size: 4 };
        let trainer = Trainer::new(JointObjective::default(), runtime, false).unwrap();
        (data, model, trainer)
    }

    #[test]
    fn test_fit_records_history() {
        let (data, mut model, trainer) = setup(1, MergeStrategy::Host);
        let mut sgd = Sgd::new(0.05, 0.9).unwrap().with_clipnorm(10.0);
        let train = data.train_sequence(6, transform_inputs).unwrap();
        let test = data.test_sequence(5, transform_inputs).unwrap();
        let history = trainer.fit(&mut model, &mut sgd, train, Some(test), 2, &mut []).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|h| h.loss.is_finite() && h.val_loss.is_some()));
        assert_eq!(sgd.iterations(), 8);
    }

    struct RateRecorder(Arc<std::sync::Mutex<Vec<(usize, f32)>>>);

    impl TrainingCallback for RateRecorder {
        fn on_batch_end(&mut self, ctx: &CallbackContext) -> CallbackAction {
            self.0.lock().unwrap().push((ctx.global_step, ctx.lr));
            CallbackAction::Continue
        }
    }

    #[test]
    fn test_fit_follows_warm_restart_rates() {
        use crate::train::schedule::{WarmRestartParams, WarmRestarts};

        let (data, mut model, trainer) = setup(1, MergeStrategy::Host);
        let params = WarmRestartParams { max_lr: 0.1, min_lr: 0.001, base_len: 1, mul: 2 };
        let rates = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut callbacks: Vec<Box<dyn TrainingCallback>> =
            vec![Box::new(WarmRestarts::new(params, 4)), Box::new(RateRecorder(Arc::clone(&rates)))];
        let mut sgd = Sgd::new(0.5, 0.9).unwrap().with_decay(0.25).with_clipnorm(10.0);
        let train = data.train_sequence(6, transform_inputs).unwrap();

        let history = trainer.fit(&mut model, &mut sgd, train, None, 3, &mut callbacks).unwrap();
        assert_eq!(history.len(), 3);

        // a 4-step cycle followed by an 8-step cycle
        let cosine = |step: usize, len: usize| {
            let progress = step as f32 / len as f32;
            0.001 + 0.5 * (0.1 - 0.001) * (1.0 + (std::f32::consts::PI * progress).cos())
        };
        let expected: Vec<f32> = (0..4).map(|i| cosine(i, 4)).chain((0..8).map(|i| cosine(i, 8))).collect();
        let rates = rates.lock().unwrap();
        assert_eq!(rates.len(), 12);
        for (i, ((step, got), want)) in rates.iter().zip(&expected).enumerate() {
            assert_eq!(*step, i);
            approx::assert_abs_diff_eq!(*got, *want, epsilon = 1e-6);
        }
        assert!(rates[3].1 < rates[1].1);
        approx::assert_abs_diff_eq!(rates[4].1, 0.1, epsilon = 1e-6);

        // epoch logs carry the decayed rate of the last step
        approx::assert_abs_diff_eq!(history[2].lr, expected[11] / (1.0 + 0.25 * 12.0), epsilon = 1e-6);
        assert_eq!(sgd.iterations(), 12);
    }

    #[test]
    fn test_replicas_match_single_device_gradients() {
        let (data, model, single) = setup(1, MergeStrategy::Host);
        let (_, _, multi) = setup(3, MergeStrategy::Device);
        let batch = data.test_sequence(9, transform_inputs).unwrap().get(0).unwrap();

        let mut a = model.clone();
        let mut b = model.clone();
        let mut sgd_a = Sgd::new(0.1, 0.0).unwrap();
        let mut sgd_b = Sgd::new(0.1, 0.0).unwrap();
        let loss_a = single.train_step(&mut a, &mut sgd_a, &batch).unwrap();
        let loss_b = multi.train_step(&mut b, &mut sgd_b, &batch).unwrap();

        // shards normalize with their own batch statistics, so only the
        // center term and the centroid update are expected to agree
        approx::assert_abs_diff_eq!(loss_a.center_loss, loss_b.center_loss, epsilon = 1e-5);
        for (x, y) in a.centroids().iter().zip(b.centroids().iter()) {
            approx::assert_abs_diff_eq!(*x, *y, epsilon = 1e-5);
        }
        assert_ne!(a.centroids(), model.centroids());
    }

    #[test]
    fn test_predict_preserves_order_and_shapes() {
        let (data, model, trainer) = setup(1, MergeStrategy::Host);
        let preds = trainer.predict(&model, data.test_sequence(4, transform_inputs).unwrap()).unwrap();
        assert_eq!(preds.prob.dim(), (9, 3));
        assert_eq!(preds.embedding.dim(), (9, 4));
        assert_eq!(preds.center_loss.len(), 9);

        let direct = model.predict(&data_rows(&data), data.labels_test()).unwrap();
        for (x, y) in preds.prob.iter().zip(direct.prob.iter()) {
            approx::assert_abs_diff_eq!(*x, *y, epsilon = 1e-6);
        }
    }

    fn data_rows(data: &ArrayDataset) -> Array2<f32> {
        let seq = data.test_sequence(100, transform_inputs).unwrap();
        seq.get(0).unwrap().inputs.images
    }
}
