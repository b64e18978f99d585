//! Optimization: objective, optimizer, learning-rate schedules and the
//! training loop.

pub mod callbacks;
pub mod metrics;
pub mod objective;
pub mod optimizer;
pub mod schedule;
pub mod trainer;

pub use callbacks::{CallbackAction, CallbackContext, EpochLogs, MetricsLogger, TrainingCallback};
pub use metrics::{accuracy, average_class_accuracy};
pub use objective::{predicted_classes, JointObjective, LossBreakdown};
pub use optimizer::{clip_grad_norm, decay_for_max_decay, Sgd};
pub use schedule::{get_lr_schedule, LrSchedule, ScheduleArgs, ScheduleKind, SchedulePlan};
pub use trainer::{Predictions, Trainer};

/// Momentum of every SGD optimizer built for a run.
pub const SGD_MOMENTUM: f32 = 0.9;
