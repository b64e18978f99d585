use std::io;
use thiserror::Error;

/// Represents the different types of errors that can occur while building,
/// training or persisting a center-loss model.
#[derive(Debug, Error)]
pub enum TrainingError {
    /// Invalid or incomplete run configuration, detected before training starts
    #[error("Configuration error: {0}")]
    ConfigError(String),
    /// Error occurred while assembling the model
    #[error("Build error: {0}")]
    BuildError(String),
    /// Error occurred due to invalid input data or parameters
    #[error("Validation error: {0}")]
    ValidationError(String),
    /// Error occurred while producing batches
    #[error("Data error: {0}")]
    DataError(String),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },
}
