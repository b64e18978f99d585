//! Class lists and precomputed class centroids.
//!
//! A [`ClassList`] fixes the mapping between class identifiers and the
//! contiguous, 0-based indices used by the model. It is derived either from a
//! centroid file (its `ind2label` sequence) or from a plain-text class filter.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;

use log::info;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::TrainingError;

/// Identifier of a class as it appears in class lists and dataset archives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClassId {
    Index(i64),
    Name(String),
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(id) => write!(f, "{}", id),
            Self::Name(name) => write!(f, "{}", name),
        }
    }
}

impl From<i64> for ClassId {
    fn from(id: i64) -> Self {
        ClassId::Index(id)
    }
}

impl From<&str> for ClassId {
    fn from(name: &str) -> Self {
        ClassId::Name(name.to_string())
    }
}

/// Ordered, duplicate-free sequence of class identifiers.
///
/// The position of an identifier is its class index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassList {
    ids: Vec<ClassId>,
    index: HashMap<ClassId, usize>,
}

impl ClassList {
    /// Builds a class list, keeping the first occurrence of repeated ids.
    pub fn new(ids: impl IntoIterator<Item = ClassId>) -> Self {
        let mut list = Self { ids: Vec::new(), index: HashMap::new() };
        for id in ids {
            if !list.index.contains_key(&id) {
                list.index.insert(id.clone(), list.ids.len());
                list.ids.push(id);
            }
        }
        list
    }

    /// Builds a class list that must already be duplicate-free.
    ///
    /// Used for centroid files, where every id is tied to one matrix row.
    pub fn try_unique(ids: Vec<ClassId>) -> Result<Self, TrainingError> {
        let expected = ids.len();
        let list = Self::new(ids);
        if list.len() != expected {
            return Err(TrainingError::ValidationError(format!(
                "Class list contains duplicate identifiers ({} unique of {})",
                list.len(),
                expected
            )));
        }
        Ok(list)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn index_of(&self, id: &ClassId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn get(&self, index: usize) -> Option<&ClassId> {
        self.ids.get(index)
    }

    pub fn ids(&self) -> &[ClassId] {
        &self.ids
    }
}

/// Parses the contents of a class-list file.
///
/// The first whitespace-separated token of every non-blank line is a class id.
/// If every id parses as an integer the list holds integer ids, otherwise the
/// raw strings are kept.
pub fn parse_class_list(text: &str) -> ClassList {
    let tokens: Vec<&str> = text
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .collect();

    let as_ints: Result<Vec<i64>, _> = tokens.iter().map(|t| t.parse::<i64>()).collect();
    match as_ints {
        Ok(ints) => ClassList::new(ints.into_iter().map(ClassId::Index)),
        Err(_) => ClassList::new(tokens.into_iter().map(ClassId::from)),
    }
}

/// Reads a class-list file from disk.
pub fn load_class_list<P: AsRef<Path>>(path: P) -> Result<ClassList, TrainingError> {
    let text = fs::read_to_string(path.as_ref())?;
    let classes = parse_class_list(&text);
    if classes.is_empty() {
        return Err(TrainingError::ValidationError(format!(
            "Class list {:?} does not contain any classes",
            path.as_ref()
        )));
    }
    info!("Loaded {} classes from {:?}", classes.len(), path.as_ref());
    Ok(classes)
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

/// On-disk layout of a centroid file.
#[derive(Debug, Serialize, Deserialize)]
struct CentroidFile {
    ind2label: Vec<ClassId>,
    embedding: StoredMatrix,
}

/// Fixed class centroids together with their class mapping.
#[derive(Debug, Clone)]
pub struct CentroidSet {
    pub classes: ClassList,
    pub embedding: Array2<f32>,
}

impl CentroidSet {
    pub fn new(classes: ClassList, embedding: Array2<f32>) -> Result<Self, TrainingError> {
        if classes.is_empty() {
            return Err(TrainingError::ValidationError("Centroid set has no classes".into()));
        }
        if embedding.nrows() != classes.len() {
            return Err(TrainingError::ValidationError(format!(
                "Centroid matrix has {} rows but {} classes are listed",
                embedding.nrows(),
                classes.len()
            )));
        }
        if embedding.ncols() == 0 {
            return Err(TrainingError::ValidationError("Centroid dimensionality must be positive".into()));
        }
        Ok(Self { classes, embedding })
    }

    pub fn num_classes(&self) -> usize {
        self.embedding.nrows()
    }

    pub fn embed_dim(&self) -> usize {
        self.embedding.ncols()
    }

    /// Reads a centroid file written by [`CentroidSet::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, TrainingError> {
        let file = File::open(path.as_ref())?;
        let stored: CentroidFile = bincode::deserialize_from(BufReader::new(file))?;

        let StoredMatrix { rows, cols, data } = stored.embedding;
        let embedding = Array2::from_shape_vec((rows, cols), data).map_err(|e| {
            TrainingError::ValidationError(format!("Malformed centroid matrix: {}", e))
        })?;
        let classes = ClassList::try_unique(stored.ind2label)?;
        let set = Self::new(classes, embedding)?;

        info!(
            "Loaded {} centroids of dimension {} from {:?}",
            set.num_classes(),
            set.embed_dim(),
            path.as_ref()
        );
        Ok(set)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), TrainingError> {
        let stored = CentroidFile {
            ind2label: self.classes.ids().to_vec(),
            embedding: StoredMatrix {
                rows: self.embedding.nrows(),
                cols: self.embedding.ncols(),
                data: self.embedding.iter().copied().collect(),
            },
        };
        let file = File::create(path.as_ref())?;
        bincode::serialize_into(BufWriter::new(file), &stored)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_class_list_preserves_first_seen_order() {
        let classes = parse_class_list("7 cat\n\n3 dog\n7 again\n  \n12\n");
        assert_eq!(
            classes.ids(),
            &[ClassId::Index(7), ClassId::Index(3), ClassId::Index(12)]
        );
        assert_eq!(classes.index_of(&ClassId::Index(3)), Some(1));
    }

    #[test]
    fn test_class_list_keeps_strings_when_not_all_integers() {
        let classes = parse_class_list("n0144 tench\n42 answer\n");
        assert_eq!(classes.ids(), &[ClassId::from("n0144"), ClassId::from("42")]);
    }

    #[test]
    fn test_try_unique_rejects_duplicates() {
        let ids = vec![ClassId::Index(1), ClassId::Index(1)];
        assert!(matches!(
            ClassList::try_unique(ids),
            Err(TrainingError::ValidationError(_))
        ));
    }

    #[test]
    fn test_centroid_set_shape_validation() {
        let classes = ClassList::new(vec![ClassId::Index(0), ClassId::Index(1)]);
        let result = CentroidSet::new(classes, arr2(&[[1.0, 2.0, 3.0]]));
        assert!(result.is_err());
    }

    #[test]
    fn test_centroid_file_roundtrip() -> Result<(), TrainingError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("centroids.bin");
        let classes = ClassList::new(vec![ClassId::from("a"), ClassId::from("b")]);
        let set = CentroidSet::new(classes, arr2(&[[1.0, 0.0], [0.0, 1.0]]))?;
        set.save(&path)?;

        let loaded = CentroidSet::load(&path)?;
        assert_eq!(loaded.embed_dim(), 2);
        assert_eq!(loaded.embedding, set.embedding);
        assert_eq!(loaded.classes.get(1), Some(&ClassId::from("b")));
        Ok(())
    }
}
