//! Dumps written at the end of a run.
//!
//! Every target is attempted on its own. A failing dump is logged and recorded
//! in the [`ExportReport`]; it never aborts the run or the other dumps.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use log::{error, info};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::TrainingError;
use crate::model::CenterLossModel;

/// Output paths of the dumps; unset targets are skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportTargets {
    /// Weights only, loadable by layer name
    pub weight_dump: Option<PathBuf>,
    /// Model definition plus weights
    pub model_dump: Option<PathBuf>,
    /// Embeddings of the test examples
    pub feature_dump: Option<PathBuf>,
}

impl ExportTargets {
    pub fn is_empty(&self) -> bool {
        self.weight_dump.is_none() && self.model_dump.is_none() && self.feature_dump.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutcome {
    Written(PathBuf),
    Failed { path: PathBuf, error: String },
}

impl ExportOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportReport {
    pub weights: Option<ExportOutcome>,
    pub model: Option<ExportOutcome>,
    pub features: Option<ExportOutcome>,
}

impl ExportReport {
    pub fn outcomes(&self) -> impl Iterator<Item = &ExportOutcome> {
        [&self.weights, &self.model, &self.features].into_iter().flatten()
    }

    pub fn failures(&self) -> usize {
        self.outcomes().filter(|o| !o.is_written()).count()
    }
}

/// Test-example embeddings keyed by example index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureDump {
    pub feat: BTreeMap<usize, Vec<f32>>,
}

impl FeatureDump {
    pub fn from_embeddings(embeddings: &Array2<f32>) -> Self {
        let feat = embeddings
            .rows()
            .into_iter()
            .enumerate()
            .map(|(i, row)| (i, row.to_vec()))
            .collect();
        Self { feat }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), TrainingError> {
        let file = File::create(path.as_ref())?;
        bincode::serialize_into(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, TrainingError> {
        let file = File::open(path.as_ref())?;
        Ok(bincode::deserialize_from(BufReader::new(file))?)
    }
}

fn attempt(what: &str, path: &Path, write: impl FnOnce(&Path) -> Result<(), TrainingError>) -> ExportOutcome {
    match write(path) {
        Ok(()) => {
            info!("Wrote {} to {:?}", what, path);
            ExportOutcome::Written(path.to_path_buf())
        }
        Err(e) => {
            error!("An error occurred while saving the {} to {:?}: {}", what, path, e);
            ExportOutcome::Failed { path: path.to_path_buf(), error: e.to_string() }
        }
    }
}

/// Writes every configured dump.
///
/// `features` holds the test embeddings; a feature dump without them is
/// recorded as failed.
pub fn export(model: &CenterLossModel, targets: &ExportTargets, features: Option<&Array2<f32>>) -> ExportReport {
    ExportReport {
        weights: targets
            .weight_dump
            .as_deref()
            .map(|path| attempt("model weights", path, |p| model.save_weights(p))),
        model: targets
            .model_dump
            .as_deref()
            .map(|path| attempt("model", path, |p| model.save(p))),
        features: targets.feature_dump.as_deref().map(|path| {
            attempt("test features", path, |p| match features {
                Some(embeddings) => FeatureDump::from_embeddings(embeddings).save(p),
                None => Err(TrainingError::ValidationError("No test embeddings available".into())),
            })
        }),
    }
}
