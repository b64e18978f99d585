use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use centerloss::data::SyntheticParams;
use centerloss::{
    Architecture, DatasetKind, ExportTargets, MergeStrategy, RuntimeConfig, ScheduleArgs, ScheduleKind, TrainConfig,
    TrainingRun,
};
use clap::Parser;
use env_logger::Env;
use log::info;

/// Trains an image embedding network with softmax and center loss.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Training dataset (synthetic or archive)
    #[arg(long, default_value = "synthetic", help_heading = "Data")]
    dataset: DatasetKind,

    /// Dataset archive, or the directory containing dataset.bin
    #[arg(long, help_heading = "Data")]
    data_root: Option<PathBuf>,

    /// File listing the IDs of the classes to use, one per line
    #[arg(long, help_heading = "Data")]
    class_list: Option<PathBuf>,

    /// Classes of the synthetic dataset
    #[arg(long, default_value_t = 10, help_heading = "Data")]
    synthetic_classes: usize,

    /// Input dimensionality of the synthetic dataset
    #[arg(long, default_value_t = 32, help_heading = "Data")]
    synthetic_dim: usize,

    /// Dimensionality of the learned embeddings
    #[arg(long, default_value_t = 100, help_heading = "Center loss")]
    embed_dim: usize,

    /// Fixed class centroids; learned jointly when omitted
    #[arg(long, help_heading = "Center loss")]
    centroids: Option<PathBuf>,

    /// Weight of the center loss (the softmax loss has weight 1)
    #[arg(long, default_value_t = 0.1, help_heading = "Center loss")]
    center_loss_weight: f32,

    /// Network architecture (simple or deep)
    #[arg(long, default_value = "simple", help_heading = "Training")]
    architecture: Architecture,

    /// Comma-separated hidden layer widths
    #[arg(long, value_delimiter = ',', help_heading = "Training")]
    hidden_layers: Option<Vec<usize>>,

    /// Learning rate schedule (SGD, SGDR or CLR)
    #[arg(long, default_value = "SGDR", help_heading = "Training")]
    lr_schedule: ScheduleKind,

    /// Gradient norm clipping
    #[arg(long, default_value_t = 10.0, help_heading = "Training")]
    clipgrad: f32,

    /// Learning rate decay factor reached at the end of training
    #[arg(long, default_value_t = 0.0, help_heading = "Training")]
    max_decay: f32,

    #[arg(long, help_heading = "Training")]
    epochs: Option<usize>,

    #[arg(long, default_value_t = 100, help_heading = "Training")]
    batch_size: usize,

    #[arg(long, help_heading = "Training")]
    val_batch_size: Option<usize>,

    /// Pre-trained weights to finetune, loaded by layer name
    #[arg(long, help_heading = "Training")]
    finetune: Option<PathBuf>,

    /// Epochs training only the new layers before finetuning
    #[arg(long, default_value_t = 3, help_heading = "Training")]
    finetune_init: usize,

    /// Number of data-parallel replicas
    #[arg(long, alias = "gpus", default_value_t = 1, help_heading = "Training")]
    devices: usize,

    /// Where replica gradients are merged (host or device)
    #[arg(long, default_value = "host", help_heading = "Training")]
    merge: MergeStrategy,

    /// Parallel batch readers
    #[arg(long, default_value_t = 8, help_heading = "Training")]
    read_workers: usize,

    /// Maximum number of prefetched batches
    #[arg(long, default_value_t = 100, help_heading = "Training")]
    queue_size: usize,

    #[arg(long, help_heading = "Training")]
    seed: Option<u64>,

    /// Model definition and weights
    #[arg(long, help_heading = "Output")]
    model_dump: Option<PathBuf>,

    /// Model weights without the definition
    #[arg(long, help_heading = "Output")]
    weight_dump: Option<PathBuf>,

    /// Embeddings of the test examples
    #[arg(long, help_heading = "Output")]
    feature_dump: Option<PathBuf>,

    /// Directory for epoch metrics and the run configuration
    #[arg(long, help_heading = "Output")]
    log_dir: Option<PathBuf>,

    /// Only show the final performance
    #[arg(long, help_heading = "Output")]
    no_progress: bool,

    /// Patience of learning rate reduction in epochs
    #[arg(long, help_heading = "SGD schedule")]
    sgd_patience: Option<usize>,

    /// Initial learning rate
    #[arg(long, default_value_t = 0.1, help_heading = "SGD schedule")]
    sgd_lr: f32,

    #[arg(long, help_heading = "SGD schedule")]
    sgd_min_lr: Option<f32>,

    /// Length of the first cycle in epochs
    #[arg(long, help_heading = "SGDR schedule")]
    sgdr_base_len: Option<usize>,

    /// Cycle length multiplier after each restart
    #[arg(long, help_heading = "SGDR schedule")]
    sgdr_mul: Option<usize>,

    #[arg(long, help_heading = "SGDR schedule")]
    sgdr_max_lr: Option<f32>,

    #[arg(long, help_heading = "SGDR schedule")]
    sgdr_min_lr: Option<f32>,

    /// Length of each half cycle in epochs
    #[arg(long, help_heading = "CLR schedule")]
    clr_step_len: Option<usize>,

    #[arg(long, help_heading = "CLR schedule")]
    clr_min_lr: Option<f32>,

    #[arg(long, help_heading = "CLR schedule")]
    clr_max_lr: Option<f32>,
}

impl Args {
    fn into_config(self) -> TrainConfig {
        TrainConfig {
            dataset: self.dataset,
            data_root: self.data_root,
            class_list: self.class_list,
            synthetic: SyntheticParams {
                num_classes: self.synthetic_classes,
                input_dim: self.synthetic_dim,
                ..Default::default()
            },
            embed_dim: self.embed_dim,
            centroids: self.centroids,
            center_loss_weight: self.center_loss_weight,
            architecture: self.architecture,
            hidden_layers: self.hidden_layers,
            lr_schedule: self.lr_schedule,
            schedule: ScheduleArgs {
                sgd_patience: self.sgd_patience,
                sgd_min_lr: self.sgd_min_lr,
                sgdr_base_len: self.sgdr_base_len,
                sgdr_mul: self.sgdr_mul,
                sgdr_max_lr: self.sgdr_max_lr,
                sgdr_min_lr: self.sgdr_min_lr,
                clr_step_len: self.clr_step_len,
                clr_min_lr: self.clr_min_lr,
                clr_max_lr: self.clr_max_lr,
            },
            sgd_lr: self.sgd_lr,
            clipgrad: self.clipgrad,
            max_decay: self.max_decay,
            epochs: self.epochs,
            batch_size: self.batch_size,
            val_batch_size: self.val_batch_size,
            finetune: self.finetune,
            finetune_init: self.finetune_init,
            runtime: RuntimeConfig {
                devices: self.devices,
                merge: self.merge,
                read_workers: self.read_workers,
                queue_size: self.queue_size,
            },
            export: ExportTargets {
                weight_dump: self.weight_dump,
                model_dump: self.model_dump,
                feature_dump: self.feature_dump,
            },
            log_dir: self.log_dir,
            show_progress: !self.no_progress,
            seed: self.seed,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let config = Args::parse().into_config();

    info!("=== Starting center loss training ===");
    let start_time = Instant::now();
    let report = TrainingRun::new(config).run().context("Training failed")?;

    let evaluation = report.evaluation;
    println!(
        "Loss: {:.4} - prob loss: {:.4} - center loss: {:.4} - accuracy: {:.4}",
        evaluation.total, evaluation.prob, evaluation.center_loss, evaluation.accuracy
    );
    println!("Average Accuracy: {:.4}", report.average_accuracy);

    info!("=== Done (took {:.2?}) ===", start_time.elapsed());
    Ok(())
}
