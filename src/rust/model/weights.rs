//! Weight and model files.
//!
//! Both are bincode envelopes carrying the sha256 digest of their payload, so
//! a truncated or tampered file is rejected before any weight is touched.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

use log::{debug, info, warn};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::builder::CentroidSource;
use super::layers::Layer;
use super::network::Architecture;
use super::{CenterLossModel, Placement, CENTROID_LAYER};
use crate::error::TrainingError;

const WEIGHTS_KIND: &str = "centerloss-weights";
const MODEL_KIND: &str = "centerloss-model";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    kind: String,
    digest: String,
    payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredTensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl StoredTensor {
    fn from_array(array: &Array2<f32>) -> Self {
        Self { rows: array.nrows(), cols: array.ncols(), data: array.iter().copied().collect() }
    }

    fn into_array(self) -> Result<Array2<f32>, TrainingError> {
        Array2::from_shape_vec((self.rows, self.cols), self.data)
            .map_err(|e| TrainingError::ValidationError(format!("Malformed tensor: {}", e)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredLayer {
    name: String,
    tensors: Vec<StoredTensor>,
}

/// Everything needed to rebuild a model before loading its weights.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub architecture: Architecture,
    pub input_dim: usize,
    pub embed_dim: usize,
    pub num_classes: usize,
    pub hidden_layers: Vec<usize>,
    pub fixed_centroids: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ModelFile {
    definition: ModelDefinition,
    layers: Vec<StoredLayer>,
}

/// Outcome of loading weights by layer name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub skipped: Vec<String>,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn write_envelope<T: Serialize>(path: &Path, kind: &str, value: &T) -> Result<(), TrainingError> {
    let payload = bincode::serialize(value)?;
    let envelope = Envelope { kind: kind.to_string(), digest: sha256_hex(&payload), payload };
    let file = File::create(path)?;
    bincode::serialize_into(BufWriter::new(file), &envelope)?;
    Ok(())
}

fn read_envelope<T: for<'de> Deserialize<'de>>(path: &Path, kind: &str) -> Result<T, TrainingError> {
    let bytes = fs::read(path)?;
    let envelope: Envelope = bincode::deserialize(&bytes)?;
    if envelope.kind != kind {
        return Err(TrainingError::ValidationError(format!(
            "{:?} holds '{}', expected '{}'",
            path, envelope.kind, kind
        )));
    }
    let actual = sha256_hex(&envelope.payload);
    if actual != envelope.digest {
        return Err(TrainingError::HashMismatch {
            path: path.display().to_string(),
            expected: envelope.digest,
            actual,
        });
    }
    Ok(bincode::deserialize(&envelope.payload)?)
}

impl CenterLossModel {
    pub fn definition(&self) -> ModelDefinition {
        ModelDefinition {
            architecture: self.network().architecture(),
            input_dim: self.input_dim(),
            embed_dim: self.embed_dim(),
            num_classes: self.num_classes(),
            hidden_layers: self.network().hidden_widths(),
            fixed_centroids: self.has_fixed_centroids(),
        }
    }

    fn stored_layers(&self) -> Vec<StoredLayer> {
        self.layers()
            .into_iter()
            .map(|layer| StoredLayer {
                name: layer.name().to_string(),
                tensors: layer.weights().iter().map(StoredTensor::from_array).collect(),
            })
            .collect()
    }

    /// Writes every layer's weights, keyed by layer name.
    pub fn save_weights<P: AsRef<Path>>(&self, path: P) -> Result<(), TrainingError> {
        write_envelope(path.as_ref(), WEIGHTS_KIND, &self.stored_layers())?;
        info!("Saved weights to {:?}", path.as_ref());
        Ok(())
    }

    /// Loads weights by layer name.
    ///
    /// Layers that are missing from the model, have a different shape or hold
    /// fixed centroids are skipped and reported instead of failing the load.
    pub fn load_weights_by_name<P: AsRef<Path>>(&mut self, path: P) -> Result<LoadReport, TrainingError> {
        let stored: Vec<StoredLayer> = read_envelope(path.as_ref(), WEIGHTS_KIND)?;
        let report = self.apply_stored(stored)?;
        info!(
            "Loaded {} layers from {:?} ({} skipped)",
            report.loaded.len(),
            path.as_ref(),
            report.skipped.len()
        );
        Ok(report)
    }

    fn apply_stored(&mut self, stored: Vec<StoredLayer>) -> Result<LoadReport, TrainingError> {
        let mut report = LoadReport::default();
        for entry in stored {
            let tensors = entry
                .tensors
                .into_iter()
                .map(StoredTensor::into_array)
                .collect::<Result<Vec<_>, _>>()?;

            let mut layers = self.layers_mut();
            let Some(layer) = layers.iter_mut().find(|l| l.name() == entry.name) else {
                debug!("No layer named '{}' in model, skipping", entry.name);
                report.skipped.push(entry.name);
                continue;
            };
            if layer.locked() {
                debug!("Layer '{}' holds fixed centroids, keeping them", entry.name);
                report.skipped.push(entry.name);
                continue;
            }
            match layer.set_weights(tensors) {
                Ok(()) => report.loaded.push(entry.name),
                Err(e) => {
                    debug!("Skipping layer '{}': {}", entry.name, e);
                    report.skipped.push(entry.name);
                }
            }
        }
        Ok(report)
    }

    /// Writes the model definition together with all weights.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), TrainingError> {
        let file = ModelFile { definition: self.definition(), layers: self.stored_layers() };
        write_envelope(path.as_ref(), MODEL_KIND, &file)?;
        info!("Saved model to {:?}", path.as_ref());
        Ok(())
    }

    /// Rebuilds a model written by [`CenterLossModel::save`].
    pub fn load<P: AsRef<Path>>(path: P, placement: Placement) -> Result<Self, TrainingError> {
        let file: ModelFile = read_envelope(path.as_ref(), MODEL_KIND)?;
        let def = file.definition;

        let centroids = if def.fixed_centroids {
            let matrix = file
                .layers
                .iter()
                .find(|l| l.name == CENTROID_LAYER)
                .and_then(|l| l.tensors.first().cloned())
                .ok_or_else(|| TrainingError::ValidationError("Model file has no centroid tensor".into()))?
                .into_array()?;
            CentroidSource::Fixed(matrix)
        } else {
            CentroidSource::Learned(def.num_classes)
        };

        let mut model = CenterLossModel::builder()
            .with_architecture(def.architecture, def.input_dim, def.embed_dim)?
            .with_hidden_layers(def.hidden_layers.clone())
            .with_centroids(centroids)?
            .with_placement(placement)
            .build()?;

        let report = model.apply_stored(file.layers)?;
        let expected_skips = usize::from(def.fixed_centroids);
        if report.skipped.len() != expected_skips {
            warn!("Model file {:?}: layers not restored: {:?}", path.as_ref(), report.skipped);
        }
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(seed: u64, centroids: CentroidSource) -> CenterLossModel {
        CenterLossModel::builder()
            .with_architecture(Architecture::Simple, 3, 2)
            .unwrap()
            .with_hidden_layers(vec![4])
            .with_centroids(centroids)
            .unwrap()
            .with_seed(seed)
            .build()
            .unwrap()
    }

    #[test]
    fn test_weights_restore_by_name() -> Result<(), TrainingError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("weights.bin");
        let source = model(1, CentroidSource::Learned(3));
        source.save_weights(&path)?;

        let mut target = model(2, CentroidSource::Learned(3));
        let report = target.load_weights_by_name(&path)?;
        assert_eq!(report.loaded.len(), 5);
        assert!(report.skipped.is_empty());
        assert_eq!(target.centroids(), source.centroids());
        Ok(())
    }

    #[test]
    fn test_shape_mismatch_is_skipped() -> Result<(), TrainingError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("weights.bin");
        model(1, CentroidSource::Learned(3)).save_weights(&path)?;

        let mut target = model(2, CentroidSource::Learned(5));
        let report = target.load_weights_by_name(&path)?;
        assert_eq!(report.skipped, vec!["prob".to_string(), "cls_centroids".to_string()]);
        Ok(())
    }

    #[test]
    fn test_fixed_centroids_are_not_overwritten() -> Result<(), TrainingError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("weights.bin");
        model(1, CentroidSource::Learned(2)).save_weights(&path)?;

        let fixed = ndarray::arr2(&[[1.0, 1.0], [-1.0, -1.0]]);
        let mut target = model(2, CentroidSource::Fixed(fixed.clone()));
        target.load_weights_by_name(&path)?;
        assert_eq!(target.centroids(), &fixed);
        Ok(())
    }

    #[test]
    fn test_corrupted_file_is_rejected() -> Result<(), TrainingError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("weights.bin");
        model(1, CentroidSource::Learned(2)).save_weights(&path)?;

        let mut bytes = fs::read(&path)?;
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes)?;

        let result = model(2, CentroidSource::Learned(2)).load_weights_by_name(&path);
        assert!(matches!(result, Err(TrainingError::HashMismatch { .. })));
        Ok(())
    }

    #[test]
    fn test_model_roundtrip() -> Result<(), TrainingError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.bin");
        let fixed = ndarray::arr2(&[[0.5, 0.0], [0.0, 0.5]]);
        let original = model(3, CentroidSource::Fixed(fixed));
        original.save(&path)?;

        let restored = CenterLossModel::load(&path, Placement::Host)?;
        assert_eq!(restored.definition(), original.definition());
        assert_eq!(restored.centroids(), original.centroids());

        let images = ndarray::Array2::from_elem((2, 3), 0.25);
        let a = original.predict(&images, &[0, 1])?;
        let b = restored.predict(&images, &[0, 1])?;
        assert_eq!(a.prob, b.prob);
        Ok(())
    }
}
