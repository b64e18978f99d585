//! Learning-rate schedules.
//!
//! A schedule kind plus the parameters the caller set resolve into an
//! [`LrSchedule`], which yields the callbacks adjusting the learning rate and
//! the number of epochs the schedule is meant to run for.

use std::f32::consts::PI;
use std::fmt;
use std::str::FromStr;

use log::info;
use serde::{Deserialize, Serialize};

use super::callbacks::{CallbackAction, CallbackContext, EpochLogs, TrainingCallback};
use crate::error::TrainingError;

/// Number of warm-restart cycles run when no epoch count is requested.
const DEFAULT_WARM_RESTART_CYCLES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleKind {
    /// Reduce on plateau
    Sgd,
    /// Cosine warm restarts
    Sgdr,
    /// Triangular cyclical rate
    Clr,
}

impl FromStr for ScheduleKind {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sgd" | "plateau" => Ok(Self::Sgd),
            "sgdr" | "warm-restarts" | "warm_restarts" => Ok(Self::Sgdr),
            "clr" | "cyclical" => Ok(Self::Clr),
            other => Err(TrainingError::ConfigError(format!(
                "Unknown learning rate schedule '{}' (expected one of: SGD, SGDR, CLR)",
                other
            ))),
        }
    }
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sgd => write!(f, "SGD"),
            Self::Sgdr => write!(f, "SGDR"),
            Self::Clr => write!(f, "CLR"),
        }
    }
}

/// Schedule parameters explicitly set by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleArgs {
    pub sgd_patience: Option<usize>,
    pub sgd_min_lr: Option<f32>,
    pub sgdr_base_len: Option<usize>,
    pub sgdr_mul: Option<usize>,
    pub sgdr_max_lr: Option<f32>,
    pub sgdr_min_lr: Option<f32>,
    pub clr_step_len: Option<usize>,
    pub clr_min_lr: Option<f32>,
    pub clr_max_lr: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlateauParams {
    pub patience: usize,
    pub factor: f32,
    pub min_lr: f32,
    pub min_delta: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WarmRestartParams {
    pub max_lr: f32,
    pub min_lr: f32,
    /// Length of the first cycle, in epochs
    pub base_len: usize,
    pub mul: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CyclicalParams {
    pub min_lr: f32,
    pub max_lr: f32,
    /// Length of a half cycle, in epochs
    pub step_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LrSchedule {
    Plateau(PlateauParams),
    WarmRestarts(WarmRestartParams),
    Cyclical(CyclicalParams),
}

fn required<T>(value: Option<T>, name: &str, kind: ScheduleKind) -> Result<T, TrainingError> {
    value.ok_or_else(|| TrainingError::ConfigError(format!("Schedule {} requires --{}", kind, name)))
}

fn positive(value: usize, name: &str) -> Result<usize, TrainingError> {
    if value == 0 {
        return Err(TrainingError::ConfigError(format!("{} must be positive", name)));
    }
    Ok(value)
}

fn check_bounds(min_lr: f32, max_lr: f32, kind: ScheduleKind) -> Result<(), TrainingError> {
    if !(min_lr >= 0.0 && max_lr > min_lr) {
        return Err(TrainingError::ConfigError(format!(
            "Schedule {} needs 0 <= min_lr < max_lr, got {} and {}",
            kind, min_lr, max_lr
        )));
    }
    Ok(())
}

impl LrSchedule {
    /// Fills in defaults and validates the parameters of a schedule kind.
    pub fn resolve(kind: ScheduleKind, args: &ScheduleArgs) -> Result<Self, TrainingError> {
        match kind {
            ScheduleKind::Sgd => {
                let params = PlateauParams {
                    patience: positive(args.sgd_patience.unwrap_or(10), "sgd_patience")?,
                    factor: 0.1,
                    min_lr: args.sgd_min_lr.unwrap_or(1e-4),
                    min_delta: 1e-4,
                };
                if params.min_lr < 0.0 {
                    return Err(TrainingError::ConfigError("sgd_min_lr must not be negative".into()));
                }
                Ok(Self::Plateau(params))
            }
            ScheduleKind::Sgdr => {
                let params = WarmRestartParams {
                    max_lr: required(args.sgdr_max_lr, "sgdr_max_lr", kind)?,
                    min_lr: args.sgdr_min_lr.unwrap_or(1e-6),
                    base_len: positive(args.sgdr_base_len.unwrap_or(12), "sgdr_base_len")?,
                    mul: positive(args.sgdr_mul.unwrap_or(2), "sgdr_mul")?,
                };
                check_bounds(params.min_lr, params.max_lr, kind)?;
                Ok(Self::WarmRestarts(params))
            }
            ScheduleKind::Clr => {
                let params = CyclicalParams {
                    min_lr: required(args.clr_min_lr, "clr_min_lr", kind)?,
                    max_lr: required(args.clr_max_lr, "clr_max_lr", kind)?,
                    step_len: positive(args.clr_step_len.unwrap_or(12), "clr_step_len")?,
                };
                check_bounds(params.min_lr, params.max_lr, kind)?;
                Ok(Self::Cyclical(params))
            }
        }
    }

    /// Epochs the schedule is meant to run for. An explicit request wins,
    /// except that warm restarts round it up to the end of a cycle. Training
    /// runs fall back to this only when no epoch count was requested.
    pub fn num_epochs(&self, epochs_override: Option<usize>) -> Result<usize, TrainingError> {
        match (self, epochs_override) {
            (Self::WarmRestarts(p), requested) => warm_restart_epochs(p.base_len, p.mul, requested),
            (_, Some(epochs)) => Ok(epochs),
            (Self::Plateau(_), None) => Ok(200),
            (Self::Cyclical(p), None) => p.step_len.checked_mul(8).ok_or_else(|| {
                TrainingError::ConfigError(format!("clr_step_len {} is too large", p.step_len))
            }),
        }
    }

    pub fn callbacks(&self, steps_per_epoch: usize) -> Vec<Box<dyn TrainingCallback>> {
        let steps_per_epoch = steps_per_epoch.max(1);
        match *self {
            Self::Plateau(p) => vec![Box::new(ReduceLrOnPlateau::new(p))],
            Self::WarmRestarts(p) => vec![Box::new(WarmRestarts::new(p, steps_per_epoch))],
            Self::Cyclical(p) => vec![Box::new(CyclicalLr::new(p, steps_per_epoch))],
        }
    }
}

/// Total epochs of whole warm-restart cycles `b, b*m, b*m^2, ...`.
///
/// Without a request this is the length of the first five cycles; otherwise
/// the smallest cycle boundary at or after the requested epoch count.
///
/// # Returns
/// * `ConfigError` when the cycle lengths overflow `usize`
pub fn warm_restart_epochs(base_len: usize, mul: usize, requested: Option<usize>) -> Result<usize, TrainingError> {
    let overflow = || {
        TrainingError::ConfigError(format!(
            "Warm restart cycles of base length {} and multiplier {} overflow the epoch count",
            base_len, mul
        ))
    };
    let mut total: usize = 0;
    let mut cycle = base_len.max(1);
    let mut cycles = 0;
    loop {
        total = total.checked_add(cycle).ok_or_else(overflow)?;
        cycles += 1;
        let done = match requested {
            Some(target) => total >= target,
            None => cycles >= DEFAULT_WARM_RESTART_CYCLES,
        };
        if done {
            return Ok(total);
        }
        cycle = cycle.checked_mul(mul.max(1)).ok_or_else(overflow)?;
    }
}

/// The callbacks and epoch count of a resolved schedule.
pub struct SchedulePlan {
    pub schedule: LrSchedule,
    pub callbacks: Vec<Box<dyn TrainingCallback>>,
    pub num_epochs: usize,
}

/// Resolves a schedule kind for a training set of `num_train` examples.
pub fn get_lr_schedule(
    kind: ScheduleKind,
    num_train: usize,
    batch_size: usize,
    args: &ScheduleArgs,
    epochs_override: Option<usize>,
) -> Result<SchedulePlan, TrainingError> {
    if batch_size == 0 {
        return Err(TrainingError::ConfigError("Batch size must be positive".into()));
    }
    if epochs_override == Some(0) {
        return Err(TrainingError::ConfigError("Epoch count must be positive".into()));
    }
    let schedule = LrSchedule::resolve(kind, args)?;
    let steps_per_epoch = num_train.div_ceil(batch_size);
    let num_epochs = schedule.num_epochs(epochs_override)?;
    info!("LR schedule {:?}: {} epochs of {} steps", schedule, num_epochs, steps_per_epoch);

    Ok(SchedulePlan { callbacks: schedule.callbacks(steps_per_epoch), schedule, num_epochs })
}

/// Multiplies the rate by `factor` when the monitored loss stops improving.
///
/// Monitors the validation loss, or the training loss when there is none.
pub struct ReduceLrOnPlateau {
    params: PlateauParams,
    best: f32,
    wait: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(params: PlateauParams) -> Self {
        Self { params, best: f32::INFINITY, wait: 0 }
    }
}

impl TrainingCallback for ReduceLrOnPlateau {
    fn on_train_begin(&mut self, _ctx: &CallbackContext) -> CallbackAction {
        self.best = f32::INFINITY;
        self.wait = 0;
        CallbackAction::Continue
    }

    fn on_epoch_end(&mut self, ctx: &CallbackContext, logs: &EpochLogs) -> CallbackAction {
        let current = logs.val_loss.unwrap_or(logs.loss);
        if current < self.best - self.params.min_delta {
            self.best = current;
            self.wait = 0;
            return CallbackAction::Continue;
        }
        self.wait += 1;
        if self.wait < self.params.patience || ctx.lr <= self.params.min_lr {
            return CallbackAction::Continue;
        }
        self.wait = 0;
        let lr = (ctx.lr * self.params.factor).max(self.params.min_lr);
        info!("Epoch {}: reducing learning rate to {:e}", ctx.epoch + 1, lr);
        CallbackAction::SetLr(lr)
    }

    fn name(&self) -> &'static str {
        "ReduceLrOnPlateau"
    }
}

/// Per-step cosine annealing with restarts.
pub struct WarmRestarts {
    params: WarmRestartParams,
    steps_per_epoch: usize,
    cycle_len: usize,
    cycle_step: usize,
}

impl WarmRestarts {
    pub fn new(params: WarmRestartParams, steps_per_epoch: usize) -> Self {
        Self { params, steps_per_epoch, cycle_len: params.base_len, cycle_step: 0 }
    }

    pub fn current_lr(&self) -> f32 {
        let cycle_steps = self.cycle_len.saturating_mul(self.steps_per_epoch).max(1);
        let progress = self.cycle_step as f32 / cycle_steps as f32;
        let WarmRestartParams { max_lr, min_lr, .. } = self.params;
        min_lr + 0.5 * (max_lr - min_lr) * (1.0 + (PI * progress).cos())
    }
}

impl TrainingCallback for WarmRestarts {
    fn on_train_begin(&mut self, _ctx: &CallbackContext) -> CallbackAction {
        self.cycle_len = self.params.base_len;
        self.cycle_step = 0;
        CallbackAction::SetLr(self.params.max_lr)
    }

    fn on_batch_begin(&mut self, _ctx: &CallbackContext) -> CallbackAction {
        CallbackAction::SetLr(self.current_lr())
    }

    fn on_batch_end(&mut self, ctx: &CallbackContext) -> CallbackAction {
        self.cycle_step += 1;
        if self.cycle_step >= self.cycle_len.saturating_mul(self.steps_per_epoch) {
            self.cycle_step = 0;
            self.cycle_len = self.cycle_len.saturating_mul(self.params.mul);
            info!("Step {}: warm restart, next cycle {} epochs", ctx.global_step + 1, self.cycle_len);
        }
        CallbackAction::Continue
    }

    fn name(&self) -> &'static str {
        "WarmRestarts"
    }
}

/// Triangular cyclical learning rate.
pub struct CyclicalLr {
    params: CyclicalParams,
    half_cycle_steps: usize,
    step: usize,
}

impl CyclicalLr {
    pub fn new(params: CyclicalParams, steps_per_epoch: usize) -> Self {
        Self { params, half_cycle_steps: params.step_len.saturating_mul(steps_per_epoch).max(1), step: 0 }
    }

    pub fn current_lr(&self) -> f32 {
        let t = self.step as f32 / self.half_cycle_steps as f32;
        let cycle = (1.0 + t / 2.0).floor();
        let x = (t - 2.0 * cycle + 1.0).abs();
        let CyclicalParams { min_lr, max_lr, .. } = self.params;
        min_lr + (max_lr - min_lr) * (1.0 - x).max(0.0)
    }
}

impl TrainingCallback for CyclicalLr {
    fn on_train_begin(&mut self, _ctx: &CallbackContext) -> CallbackAction {
        self.step = 0;
        CallbackAction::SetLr(self.params.min_lr)
    }

    fn on_batch_begin(&mut self, _ctx: &CallbackContext) -> CallbackAction {
        CallbackAction::SetLr(self.current_lr())
    }

    fn on_batch_end(&mut self, _ctx: &CallbackContext) -> CallbackAction {
        self.step += 1;
        CallbackAction::Continue
    }

    fn name(&self) -> &'static str {
        "CyclicalLr"
    }
}
