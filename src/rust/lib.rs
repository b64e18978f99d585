//! Training of image-embedding networks with a joint softmax and center-loss
//! objective.
//!
//! An embedding trunk feeds two heads: a softmax classifier and a center-loss
//! term pulling each embedding towards the centroid of its class. Centroids are
//! either learned jointly or loaded from a file and kept fixed.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use centerloss::{ScheduleKind, TrainConfig, TrainingRun};
//!
//! let config = TrainConfig {
//!     embed_dim: 16,
//!     lr_schedule: ScheduleKind::Sgd,
//!     epochs: Some(5),
//!     ..Default::default()
//! };
//! let report = TrainingRun::new(config).run()?;
//! println!("Average Accuracy: {:.4}", report.average_accuracy);
//! # Ok(())
//! # }
//! ```
//!
//! # Building a model directly
//!
//! ```rust
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use centerloss::{Architecture, CenterLossModel, CentroidSource};
//! use ndarray::Array2;
//!
//! let model = CenterLossModel::builder()
//!     .with_architecture(Architecture::Simple, 8, 4)?
//!     .with_centroids(CentroidSource::Learned(3))?
//!     .build()?;
//!
//! let output = model.predict(&Array2::zeros((2, 8)), &[0, 2])?;
//! assert_eq!(output.prob.dim(), (2, 3));
//! assert_eq!(output.center_loss.len(), 2);
//! # Ok(())
//! # }
//! ```

pub mod centroids;
pub mod config;
pub mod data;
pub mod error;
pub mod export;
pub mod model;
pub mod orchestrator;
pub mod runtime;
pub mod train;

pub use centroids::{load_class_list, CentroidSet, ClassId, ClassList};
pub use config::TrainConfig;
pub use data::{get_data_generator, transform_inputs, BatchSequence, DataGenerator, DatasetKind, SyntheticParams};
pub use error::TrainingError;
pub use export::{ExportReport, ExportTargets};
pub use model::{Architecture, CenterLossModel, CenterLossModelBuilder, CentroidSource, Placement};
pub use orchestrator::{Phase, RunReport, TrainingRun};
pub use runtime::{MergeStrategy, RuntimeConfig};
pub use train::{get_lr_schedule, JointObjective, ScheduleArgs, ScheduleKind, Sgd, Trainer};

pub fn init_logger() {
    env_logger::init();
}
