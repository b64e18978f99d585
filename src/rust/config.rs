use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::data::{DatasetKind, SyntheticParams};
use crate::error::TrainingError;
use crate::export::ExportTargets;
use crate::model::Architecture;
use crate::runtime::RuntimeConfig;
use crate::train::{ScheduleArgs, ScheduleKind};

pub const CONFIG_FILE_NAME: &str = "config.json";

/// Everything a training run needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub dataset: DatasetKind,
    pub data_root: Option<PathBuf>,
    /// Restricts training to the listed classes
    pub class_list: Option<PathBuf>,
    pub synthetic: SyntheticParams,
    /// Ignored when a centroid file is given
    pub embed_dim: usize,
    /// Fixed centroids; learned when unset
    pub centroids: Option<PathBuf>,
    pub center_loss_weight: f32,
    pub architecture: Architecture,
    pub hidden_layers: Option<Vec<usize>>,
    pub lr_schedule: ScheduleKind,
    pub schedule: ScheduleArgs,
    pub sgd_lr: f32,
    pub clipgrad: f32,
    pub max_decay: f32,
    pub epochs: Option<usize>,
    pub batch_size: usize,
    pub val_batch_size: Option<usize>,
    /// Pre-trained weights to finetune from
    pub finetune: Option<PathBuf>,
    pub finetune_init: usize,
    pub runtime: RuntimeConfig,
    pub export: ExportTargets,
    pub log_dir: Option<PathBuf>,
    pub show_progress: bool,
    pub seed: Option<u64>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetKind::Synthetic,
            data_root: None,
            class_list: None,
            synthetic: SyntheticParams::default(),
            embed_dim: 100,
            centroids: None,
            center_loss_weight: 0.1,
            architecture: Architecture::Simple,
            hidden_layers: None,
            lr_schedule: ScheduleKind::Sgdr,
            schedule: ScheduleArgs::default(),
            sgd_lr: 0.1,
            clipgrad: 10.0,
            max_decay: 0.0,
            epochs: None,
            batch_size: 100,
            val_batch_size: None,
            finetune: None,
            finetune_init: 3,
            runtime: RuntimeConfig::default(),
            export: ExportTargets::default(),
            log_dir: None,
            show_progress: true,
            seed: None,
        }
    }
}

impl TrainConfig {
    /// Checks everything that can be checked without touching the filesystem.
    pub fn validate(&self) -> Result<(), TrainingError> {
        let fail = |msg: String| Err(TrainingError::ConfigError(msg));

        if self.embed_dim == 0 && self.centroids.is_none() {
            return fail("Embedding dimension must be positive".into());
        }
        if self.batch_size == 0 {
            return fail("Batch size must be positive".into());
        }
        if self.val_batch_size == Some(0) {
            return fail("Validation batch size must be positive".into());
        }
        if self.epochs == Some(0) {
            return fail("Epoch count must be positive".into());
        }
        if !(self.center_loss_weight >= 0.0 && self.center_loss_weight.is_finite()) {
            return fail(format!("Center loss weight must be non-negative, got {}", self.center_loss_weight));
        }
        if !(self.sgd_lr > 0.0 && self.sgd_lr.is_finite()) {
            return fail(format!("Learning rate must be positive, got {}", self.sgd_lr));
        }
        if self.max_decay > 0.0 && self.max_decay < 1.0 {
            return fail(format!("max_decay must be at least 1 or non-positive, got {}", self.max_decay));
        }
        if self.finetune.is_some() && self.finetune_init == 0 {
            return fail("Finetuning needs at least one initial epoch".into());
        }
        if self.dataset == DatasetKind::Archive && self.data_root.is_none() {
            return fail("The archive dataset requires a data root".into());
        }
        if let Some(hidden) = &self.hidden_layers {
            if hidden.contains(&0) {
                return fail("Hidden layer widths must be positive".into());
            }
        }
        self.runtime.validate()
    }

    pub fn val_batch_size(&self) -> usize {
        self.val_batch_size.unwrap_or(self.batch_size)
    }

    pub fn seed(&self) -> u64 {
        self.seed.unwrap_or(0)
    }

    /// Writes the config as `config.json` into `dir`.
    pub fn save_json<P: AsRef<Path>>(&self, dir: P) -> Result<PathBuf, TrainingError> {
        let path = dir.as_ref().join(CONFIG_FILE_NAME);
        let file = File::create(&path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TrainConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.val_batch_size(), 100);
        assert_eq!(config.lr_schedule, ScheduleKind::Sgdr);
    }

    #[test]
    fn test_rejects_growing_decay() {
        let config = TrainConfig { max_decay: 0.5, ..Default::default() };
        assert!(matches!(config.validate(), Err(TrainingError::ConfigError(_))));

        let config = TrainConfig { max_decay: -1.0, ..Default::default() };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_archive_needs_root() {
        let config = TrainConfig { dataset: DatasetKind::Archive, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_json() -> Result<(), TrainingError> {
        let dir = tempfile::tempdir()?;
        let config = TrainConfig { epochs: Some(4), ..Default::default() };
        let path = config.save_json(dir.path())?;

        let text = std::fs::read_to_string(path)?;
        let restored: TrainConfig = serde_json::from_str(&text)?;
        assert_eq!(restored, config);
        Ok(())
    }

    #[test]
    fn test_malformed_json_is_a_json_error() {
        let err = serde_json::from_str::<TrainConfig>("{\"epochs\": ").map_err(TrainingError::from).unwrap_err();
        assert!(matches!(err, TrainingError::JsonError(_)));
        assert!(err.to_string().starts_with("JSON error: "));
    }
}
