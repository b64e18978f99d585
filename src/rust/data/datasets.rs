//! Built-in data generators.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};

use log::{info, warn};
use ndarray::{Array2, Axis};
use ndarray_rand::rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::{BatchSequence, BatchTransform, DataGenerator, TransformedBatch};
use crate::centroids::{ClassId, ClassList};
use crate::error::TrainingError;

/// File name looked up when the data root is a directory.
pub const ARCHIVE_FILE_NAME: &str = "dataset.bin";

/// Which built-in data generator to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatasetKind {
    /// Gaussian class blobs generated in memory
    Synthetic,
    /// A bincode [`DatasetArchive`] read from the data root
    Archive,
}

impl FromStr for DatasetKind {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "synthetic" => Ok(Self::Synthetic),
            "archive" => Ok(Self::Archive),
            other => Err(TrainingError::ConfigError(format!(
                "Unknown dataset '{}' (expected one of: synthetic, archive)",
                other
            ))),
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Synthetic => write!(f, "synthetic"),
            Self::Archive => write!(f, "archive"),
        }
    }
}

/// Sizes of the synthetic dataset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyntheticParams {
    pub num_classes: usize,
    pub input_dim: usize,
    pub train_per_class: usize,
    pub test_per_class: usize,
    /// Standard deviation of the noise around each class mean
    pub spread: f32,
}

impl Default for SyntheticParams {
    fn default() -> Self {
        Self { num_classes: 10, input_dim: 32, train_per_class: 100, test_per_class: 20, spread: 0.5 }
    }
}

/// On-disk dataset layout. Images are stored row-major, one row per label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetArchive {
    pub input_dim: usize,
    pub train_images: Vec<f32>,
    pub train_labels: Vec<ClassId>,
    pub test_images: Vec<f32>,
    pub test_labels: Vec<ClassId>,
}

impl DatasetArchive {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, TrainingError> {
        let file = File::open(path.as_ref())?;
        Ok(bincode::deserialize_from(BufReader::new(file))?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), TrainingError> {
        let file = File::create(path.as_ref())?;
        bincode::serialize_into(BufWriter::new(file), self)?;
        Ok(())
    }
}

/// In-memory dataset with train and test splits.
#[derive(Debug, Clone)]
pub struct ArrayDataset {
    num_classes: usize,
    train_images: Arc<Array2<f32>>,
    train_labels: Arc<Vec<usize>>,
    test_images: Arc<Array2<f32>>,
    test_labels: Arc<Vec<usize>>,
    seed: u64,
}

impl ArrayDataset {
    pub fn new(
        num_classes: usize,
        train: (Array2<f32>, Vec<usize>),
        test: (Array2<f32>, Vec<usize>),
        seed: u64,
    ) -> Result<Self, TrainingError> {
        if num_classes == 0 {
            return Err(TrainingError::DataError("Dataset has no classes".into()));
        }
        for (split, images, labels) in [("train", &train.0, &train.1), ("test", &test.0, &test.1)] {
            if images.nrows() != labels.len() {
                return Err(TrainingError::DataError(format!(
                    "{} split has {} images but {} labels",
                    split,
                    images.nrows(),
                    labels.len()
                )));
            }
            if let Some(&bad) = labels.iter().find(|&&l| l >= num_classes) {
                return Err(TrainingError::DataError(format!(
                    "{} split has label {} but only {} classes",
                    split, bad, num_classes
                )));
            }
        }
        if train.0.ncols() != test.0.ncols() {
            return Err(TrainingError::DataError(format!(
                "Train rows have {} features, test rows have {}",
                train.0.ncols(),
                test.0.ncols()
            )));
        }
        Ok(Self {
            num_classes,
            train_images: Arc::new(train.0),
            train_labels: Arc::new(train.1),
            test_images: Arc::new(test.0),
            test_labels: Arc::new(test.1),
            seed,
        })
    }

    /// Gaussian blobs around random class means.
    pub fn synthetic(params: SyntheticParams, seed: u64) -> Result<Self, TrainingError> {
        if params.num_classes == 0 || params.input_dim == 0 {
            return Err(TrainingError::ConfigError(
                "Synthetic dataset needs at least one class and one feature".into(),
            ));
        }
        let noise = Normal::new(0.0, params.spread)
            .map_err(|e| TrainingError::ConfigError(format!("Invalid synthetic spread: {}", e)))?;

        let mut rng = StdRng::seed_from_u64(seed);
        let means = Array2::random_using((params.num_classes, params.input_dim), Uniform::new(-2.0, 2.0), &mut rng);

        let mut split = |per_class: usize| {
            let labels: Vec<usize> = (0..params.num_classes)
                .flat_map(|c| std::iter::repeat(c).take(per_class))
                .collect();
            let mut images = Array2::random_using((labels.len(), params.input_dim), noise, &mut rng);
            for (mut row, &label) in images.rows_mut().into_iter().zip(&labels) {
                row += &means.row(label);
            }
            (images, labels)
        };
        let train = split(params.train_per_class);
        let test = split(params.test_per_class);

        info!(
            "Generated synthetic dataset: {} classes, {} train / {} test examples",
            params.num_classes,
            train.1.len(),
            test.1.len()
        );
        Self::new(params.num_classes, train, test, seed)
    }

    /// Reads a dataset archive, keeping only the classes of `classes` when given.
    ///
    /// Class indices follow the order of `classes`, or the first-seen order of
    /// the training labels otherwise.
    pub fn from_archive(
        archive: DatasetArchive,
        classes: Option<&ClassList>,
        seed: u64,
    ) -> Result<Self, TrainingError> {
        if archive.input_dim == 0 {
            return Err(TrainingError::DataError("Dataset archive has zero input dimension".into()));
        }
        let classes = match classes {
            Some(list) => list.clone(),
            None => ClassList::new(archive.train_labels.iter().cloned()),
        };

        let select = |images: Vec<f32>, labels: &[ClassId], split: &str| {
            let rows = Array2::from_shape_vec((labels.len(), archive.input_dim), images).map_err(|e| {
                TrainingError::DataError(format!("Malformed {} images: {}", split, e))
            })?;
            let (keep, mapped): (Vec<usize>, Vec<usize>) = labels
                .iter()
                .enumerate()
                .filter_map(|(row, id)| classes.index_of(id).map(|idx| (row, idx)))
                .unzip();
            if keep.len() < labels.len() {
                info!("Dropped {} {} examples outside the class list", labels.len() - keep.len(), split);
            }
            Ok::<_, TrainingError>((rows.select(Axis(0), &keep), mapped))
        };
        let train = select(archive.train_images, &archive.train_labels, "train")?;
        let test = select(archive.test_images, &archive.test_labels, "test")?;

        if train.1.is_empty() {
            return Err(TrainingError::DataError("No training examples left after class filtering".into()));
        }
        if test.1.is_empty() {
            warn!("Dataset has no test examples");
        }
        Self::new(classes.len(), train, test, seed)
    }

    fn sequence(
        &self,
        images: &Arc<Array2<f32>>,
        labels: &Arc<Vec<usize>>,
        batch_size: usize,
        transform: BatchTransform,
        shuffle: bool,
    ) -> Result<Arc<dyn BatchSequence>, TrainingError> {
        if batch_size == 0 {
            return Err(TrainingError::ConfigError("Batch size must be positive".into()));
        }
        let mut order: Vec<usize> = (0..labels.len()).collect();
        let rng = if shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed);
            order.shuffle(&mut rng);
            Some(Mutex::new(rng))
        } else {
            None
        };
        Ok(Arc::new(ArraySequence {
            images: Arc::clone(images),
            labels: Arc::clone(labels),
            num_classes: self.num_classes,
            batch_size,
            transform,
            order: RwLock::new(order),
            rng,
        }))
    }
}

impl DataGenerator for ArrayDataset {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn num_train(&self) -> usize {
        self.train_labels.len()
    }

    fn num_test(&self) -> usize {
        self.test_labels.len()
    }

    fn labels_test(&self) -> &[usize] {
        &self.test_labels
    }

    fn input_dim(&self) -> usize {
        self.train_images.ncols()
    }

    fn train_sequence(
        &self,
        batch_size: usize,
        transform: BatchTransform,
    ) -> Result<Arc<dyn BatchSequence>, TrainingError> {
        self.sequence(&self.train_images, &self.train_labels, batch_size, transform, true)
    }

    fn test_sequence(
        &self,
        batch_size: usize,
        transform: BatchTransform,
    ) -> Result<Arc<dyn BatchSequence>, TrainingError> {
        self.sequence(&self.test_images, &self.test_labels, batch_size, transform, false)
    }
}

struct ArraySequence {
    images: Arc<Array2<f32>>,
    labels: Arc<Vec<usize>>,
    num_classes: usize,
    batch_size: usize,
    transform: BatchTransform,
    order: RwLock<Vec<usize>>,
    rng: Option<Mutex<StdRng>>,
}

impl BatchSequence for ArraySequence {
    fn len(&self) -> usize {
        self.labels.len().div_ceil(self.batch_size)
    }

    fn num_examples(&self) -> usize {
        self.labels.len()
    }

    fn get(&self, index: usize) -> Result<TransformedBatch, TrainingError> {
        let start = index * self.batch_size;
        if start >= self.labels.len() {
            return Err(TrainingError::DataError(format!(
                "Batch {} out of range ({} batches)",
                index,
                self.len()
            )));
        }
        let end = (start + self.batch_size).min(self.labels.len());
        let rows: Vec<usize> = {
            let order = self
                .order
                .read()
                .map_err(|_| TrainingError::DataError("Shuffle order lock poisoned".into()))?;
            order[start..end].to_vec()
        };
        let images = self.images.select(Axis(0), &rows);
        let labels = rows.iter().map(|&r| self.labels[r]).collect();
        (self.transform)(images, labels, self.num_classes)
    }

    fn on_epoch_end(&self) {
        let Some(rng) = &self.rng else { return };
        if let (Ok(mut rng), Ok(mut order)) = (rng.lock(), self.order.write()) {
            order.shuffle(&mut *rng);
        }
    }
}

/// Creates the data generator of the given kind.
///
/// The archive kind reads `data_root` directly, or `data_root/dataset.bin`
/// when it is a directory.
pub fn get_data_generator(
    kind: DatasetKind,
    data_root: Option<&Path>,
    classes: Option<&ClassList>,
    synthetic: SyntheticParams,
    seed: u64,
) -> Result<Box<dyn DataGenerator>, TrainingError> {
    match kind {
        DatasetKind::Synthetic => {
            let params = match classes {
                Some(list) => SyntheticParams { num_classes: list.len(), ..synthetic },
                None => synthetic,
            };
            Ok(Box::new(ArrayDataset::synthetic(params, seed)?))
        }
        DatasetKind::Archive => {
            let root = data_root
                .ok_or_else(|| TrainingError::ConfigError("The archive dataset requires a data root".into()))?;
            let path: PathBuf = if root.is_dir() { root.join(ARCHIVE_FILE_NAME) } else { root.to_path_buf() };
            info!("Loading dataset archive {:?}", path);
            let archive = DatasetArchive::load(&path)?;
            Ok(Box::new(ArrayDataset::from_archive(archive, classes, seed)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::transform_inputs;

    fn small() -> ArrayDataset {
        let params = SyntheticParams { num_classes: 3, input_dim: 4, train_per_class: 5, test_per_class: 2, spread: 0.1 };
        ArrayDataset::synthetic(params, 42).unwrap()
    }

    #[test]
    fn test_synthetic_sizes() {
        let data = small();
        assert_eq!(data.num_train(), 15);
        assert_eq!(data.num_test(), 6);
        assert_eq!(data.labels_test(), &[0, 0, 1, 1, 2, 2]);
        assert_eq!(data.input_dim(), 4);
    }

    #[test]
    fn test_train_sequence_covers_every_example() {
        let data = small();
        let seq = data.train_sequence(4, transform_inputs).unwrap();
        assert_eq!(seq.len(), 4);
        let mut seen = 0;
        for i in 0..seq.len() {
            seen += seq.get(i).unwrap().len();
        }
        assert_eq!(seen, 15);
        assert!(seq.get(4).is_err());
    }

    #[test]
    fn test_test_sequence_keeps_order() {
        let data = small();
        let seq = data.test_sequence(4, transform_inputs).unwrap();
        seq.on_epoch_end();
        assert_eq!(seq.get(0).unwrap().inputs.labels, vec![0, 0, 1, 1]);
        assert_eq!(seq.get(1).unwrap().inputs.labels, vec![2, 2]);
    }

    #[test]
    fn test_archive_class_filter_reindexes() -> Result<(), TrainingError> {
        let archive = DatasetArchive {
            input_dim: 2,
            train_images: vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0],
            train_labels: vec![ClassId::from("cat"), ClassId::from("dog"), ClassId::from("bird")],
            test_images: vec![3.0, 3.0, 4.0, 4.0],
            test_labels: vec![ClassId::from("bird"), ClassId::from("cat")],
        };
        let dir = tempfile::tempdir()?;
        archive.save(dir.path().join(ARCHIVE_FILE_NAME))?;

        let classes = ClassList::new(vec![ClassId::from("bird"), ClassId::from("cat")]);
        let data = get_data_generator(
            DatasetKind::Archive,
            Some(dir.path()),
            Some(&classes),
            SyntheticParams::default(),
            0,
        )?;
        assert_eq!(data.num_classes(), 2);
        assert_eq!(data.num_train(), 2);
        assert_eq!(data.labels_test(), &[0, 1]);
        Ok(())
    }

    #[test]
    fn test_archive_requires_data_root() {
        let result = get_data_generator(DatasetKind::Archive, None, None, SyntheticParams::default(), 0);
        assert!(matches!(result, Err(TrainingError::ConfigError(_))));
    }
}
