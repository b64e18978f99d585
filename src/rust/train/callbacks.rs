//! Training callbacks.
//!
//! Callbacks observe the training loop through a [`CallbackContext`] and may
//! ask the trainer to change the learning rate.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::Serialize;

use crate::error::TrainingError;

/// State of the training loop passed to callbacks.
#[derive(Clone, Debug, Default)]
pub struct CallbackContext {
    /// Current epoch (0-indexed)
    pub epoch: usize,
    pub num_epochs: usize,
    /// Step within the current epoch
    pub step: usize,
    pub steps_per_epoch: usize,
    pub global_step: usize,
    /// Loss of the last batch, or the epoch mean at epoch end
    pub loss: f32,
    /// Learning rate before decay
    pub lr: f32,
    pub val_loss: Option<f32>,
}

/// What the trainer should do after a callback ran.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CallbackAction {
    Continue,
    SetLr(f32),
}

/// Metrics of one finished epoch.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EpochLogs {
    pub epoch: usize,
    pub loss: f32,
    pub prob_loss: f32,
    pub center_loss: f32,
    pub accuracy: f32,
    pub val_loss: Option<f32>,
    pub val_accuracy: Option<f32>,
    pub lr: f32,
}

/// Hooks into the training loop. All methods default to no-ops.
pub trait TrainingCallback: Send {
    fn on_train_begin(&mut self, _ctx: &CallbackContext) -> CallbackAction {
        CallbackAction::Continue
    }

    fn on_train_end(&mut self, _ctx: &CallbackContext) {}

    fn on_epoch_begin(&mut self, _ctx: &CallbackContext) -> CallbackAction {
        CallbackAction::Continue
    }

    fn on_epoch_end(&mut self, _ctx: &CallbackContext, _logs: &EpochLogs) -> CallbackAction {
        CallbackAction::Continue
    }

    fn on_batch_begin(&mut self, _ctx: &CallbackContext) -> CallbackAction {
        CallbackAction::Continue
    }

    fn on_batch_end(&mut self, _ctx: &CallbackContext) -> CallbackAction {
        CallbackAction::Continue
    }

    fn name(&self) -> &'static str {
        "TrainingCallback"
    }
}

/// Writes one JSON object per epoch to `<log_dir>/metrics.jsonl`.
///
/// Write failures only produce warnings.
pub struct MetricsLogger {
    path: PathBuf,
    file: Option<File>,
}

impl MetricsLogger {
    pub const FILE_NAME: &'static str = "metrics.jsonl";

    /// Clears `log_dir` and opens a fresh metrics file in it.
    pub fn create<P: AsRef<Path>>(log_dir: P) -> Result<Self, TrainingError> {
        let dir = log_dir.as_ref();
        if dir.is_dir() {
            fs::remove_dir_all(dir)?;
        }
        fs::create_dir_all(dir)?;
        let path = dir.join(Self::FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!("Writing epoch metrics to {:?}", path);
        Ok(Self { path, file: Some(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TrainingCallback for MetricsLogger {
    fn on_epoch_end(&mut self, _ctx: &CallbackContext, logs: &EpochLogs) -> CallbackAction {
        let Some(file) = self.file.as_mut() else {
            return CallbackAction::Continue;
        };
        let written = serde_json::to_string(logs)
            .map_err(TrainingError::from)
            .and_then(|line| writeln!(file, "{}", line).map_err(TrainingError::from));
        if let Err(e) = written {
            warn!("Failed to write metrics to {:?}: {}; disabling metrics log", self.path, e);
            self.file = None;
        }
        CallbackAction::Continue
    }

    fn on_train_end(&mut self, _ctx: &CallbackContext) {
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.flush() {
                warn!("Failed to flush {:?}: {}", self.path, e);
            }
        }
    }

    fn name(&self) -> &'static str {
        "MetricsLogger"
    }
}
