//! The phases of a training run.
//!
//! ```text
//! Init -> (FinetuneHeadOnly) -> FullTrain -> Evaluate -> (Export) -> Done
//! ```
//!
//! [`TrainingRun::step`] executes exactly one phase, [`TrainingRun::run`]
//! drives the machine to the end and returns the [`RunReport`].

use std::fmt;
use std::sync::Arc;

use log::{info, warn};

use crate::centroids::{load_class_list, CentroidSet, ClassList};
use crate::config::TrainConfig;
use crate::data::{get_data_generator, transform_inputs, BatchSequence, DataGenerator};
use crate::error::TrainingError;
use crate::export::{export, ExportReport};
use crate::model::{CenterLossModel, CentroidSource, LoadReport};
use crate::train::{
    average_class_accuracy, decay_for_max_decay, get_lr_schedule, predicted_classes, EpochLogs, JointObjective,
    LossBreakdown, MetricsLogger, Predictions, SchedulePlan, Sgd, Trainer, TrainingCallback, SGD_MOMENTUM,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    FinetuneHeadOnly,
    FullTrain,
    Evaluate,
    Export,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::FinetuneHeadOnly => "FINETUNE_HEAD_ONLY",
            Self::FullTrain => "FULL_TRAIN",
            Self::Evaluate => "EVALUATE",
            Self::Export => "EXPORT",
            Self::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// Outcome of a finished run.
pub struct RunReport {
    /// Phases in the order they ran, `Done` excluded
    pub phases: Vec<Phase>,
    pub finetune: Option<LoadReport>,
    pub finetune_history: Vec<EpochLogs>,
    pub history: Vec<EpochLogs>,
    pub evaluation: LossBreakdown,
    pub average_accuracy: f32,
    pub predictions: Option<Predictions>,
    pub export: Option<ExportReport>,
    pub model: CenterLossModel,
}

/// State created by `Init` and consumed by the later phases.
struct Session {
    data: Box<dyn DataGenerator>,
    train: Arc<dyn BatchSequence>,
    test: Option<Arc<dyn BatchSequence>>,
    model: CenterLossModel,
    trainer: Trainer,
    plan: SchedulePlan,
}

pub struct TrainingRun {
    config: TrainConfig,
    phase: Phase,
    phases: Vec<Phase>,
    data: Option<Box<dyn DataGenerator>>,
    session: Option<Session>,
    finetune: Option<LoadReport>,
    finetune_history: Vec<EpochLogs>,
    history: Vec<EpochLogs>,
    evaluation: LossBreakdown,
    average_accuracy: f32,
    predictions: Option<Predictions>,
    export: Option<ExportReport>,
}

impl TrainingRun {
    /// A run that builds its data generator from `config.dataset`.
    pub fn new(config: TrainConfig) -> Self {
        Self {
            config,
            phase: Phase::Init,
            phases: Vec::new(),
            data: None,
            session: None,
            finetune: None,
            finetune_history: Vec::new(),
            history: Vec::new(),
            evaluation: LossBreakdown::default(),
            average_accuracy: 0.0,
            predictions: None,
            export: None,
        }
    }

    /// A run over an externally provided data generator.
    pub fn with_data_generator(config: TrainConfig, data: Box<dyn DataGenerator>) -> Self {
        Self { data: Some(data), ..Self::new(config) }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn model(&self) -> Option<&CenterLossModel> {
        self.session.as_ref().map(|s| &s.model)
    }

    /// Executes the current phase and moves to the next one.
    pub fn step(&mut self) -> Result<Phase, TrainingError> {
        if self.phase == Phase::Done {
            return Ok(Phase::Done);
        }
        info!("Entering phase {}", self.phase);
        let next = match self.phase {
            Phase::Init => self.init()?,
            Phase::FinetuneHeadOnly => self.finetune_head_only()?,
            Phase::FullTrain => self.full_train()?,
            Phase::Evaluate => self.evaluate()?,
            Phase::Export => self.export()?,
            Phase::Done => Phase::Done,
        };
        self.phases.push(self.phase);
        self.phase = next;
        Ok(next)
    }

    pub fn run(mut self) -> Result<RunReport, TrainingError> {
        while self.phase != Phase::Done {
            self.step()?;
        }
        let session = self
            .session
            .ok_or_else(|| TrainingError::ValidationError("Run finished without a model".into()))?;
        Ok(RunReport {
            phases: self.phases,
            finetune: self.finetune,
            finetune_history: self.finetune_history,
            history: self.history,
            evaluation: self.evaluation,
            average_accuracy: self.average_accuracy,
            predictions: self.predictions,
            export: self.export,
            model: session.model,
        })
    }

    fn session(&mut self) -> Result<&mut Session, TrainingError> {
        self.session
            .as_mut()
            .ok_or_else(|| TrainingError::ValidationError(format!("Phase {} requires an initialized run", self.phase)))
    }

    fn init(&mut self) -> Result<Phase, TrainingError> {
        let config = &self.config;
        config.validate()?;

        let centroids = config.centroids.as_ref().map(CentroidSet::load).transpose()?;
        let classes: Option<ClassList> = match (&centroids, &config.class_list) {
            (Some(set), list) => {
                if list.is_some() {
                    warn!("Both centroids and a class list were given; using the classes of the centroids");
                }
                Some(set.classes.clone())
            }
            (None, Some(path)) => Some(load_class_list(path)?),
            (None, None) => None,
        };

        let data = match self.data.take() {
            Some(data) => data,
            None => get_data_generator(
                config.dataset,
                config.data_root.as_deref(),
                classes.as_ref(),
                config.synthetic,
                config.seed(),
            )?,
        };
        info!(
            "Dataset: {} classes, {} training and {} test examples of dimension {}",
            data.num_classes(),
            data.num_train(),
            data.num_test(),
            data.input_dim()
        );

        let (source, embed_dim) = match centroids {
            Some(set) => {
                if set.num_classes() != data.num_classes() {
                    return Err(TrainingError::ValidationError(format!(
                        "Centroid file has {} classes but the dataset has {}",
                        set.num_classes(),
                        data.num_classes()
                    )));
                }
                let embed_dim = set.embed_dim();
                if embed_dim != config.embed_dim {
                    info!("Using embedding dimension {} of the centroids", embed_dim);
                }
                (CentroidSource::Fixed(set.embedding), embed_dim)
            }
            None => (CentroidSource::Learned(data.num_classes()), config.embed_dim),
        };

        let plan = get_lr_schedule(
            config.lr_schedule,
            data.num_train(),
            config.batch_size,
            &config.schedule,
            config.epochs,
        )?;

        let mut builder = CenterLossModel::builder()
            .with_architecture(config.architecture, data.input_dim(), embed_dim)?
            .with_centroids(source)?
            .with_placement(config.runtime.placement());
        if let Some(hidden) = &config.hidden_layers {
            builder = builder.with_hidden_layers(hidden.clone());
        }
        if let Some(seed) = config.seed {
            builder = builder.with_seed(seed);
        }
        let model = builder.build()?;
        if config.show_progress {
            println!("{}", model.summary_table());
        }

        let train = data.train_sequence(config.batch_size, transform_inputs)?;
        let test = if data.num_test() > 0 {
            Some(data.test_sequence(config.val_batch_size(), transform_inputs)?)
        } else {
            warn!("The dataset has no test examples; skipping validation");
            None
        };
        let objective = JointObjective::new(config.center_loss_weight)?;
        let trainer = Trainer::new(objective, config.runtime.clone(), config.show_progress)?;

        let next = if config.finetune.is_some() { Phase::FinetuneHeadOnly } else { Phase::FullTrain };
        self.session = Some(Session { data, train, test, model, trainer, plan });
        Ok(next)
    }

    fn finetune_head_only(&mut self) -> Result<Phase, TrainingError> {
        let path = self
            .config
            .finetune
            .clone()
            .ok_or_else(|| TrainingError::ConfigError("No weights to finetune from".into()))?;
        let epochs = self.config.finetune_init;
        let mut optimizer = Sgd::new(self.config.sgd_lr, SGD_MOMENTUM)?.with_clipnorm(self.config.clipgrad);

        let session = self.session()?;
        let report = session.model.load_weights_by_name(&path)?;
        session.model.freeze_trunk();
        info!("Training the heads for {} epochs", epochs);
        let history = session.trainer.fit(
            &mut session.model,
            &mut optimizer,
            Arc::clone(&session.train),
            session.test.clone(),
            epochs,
            &mut [],
        )?;
        session.model.unfreeze_all();

        self.finetune = Some(report);
        self.finetune_history = history;
        Ok(Phase::FullTrain)
    }

    fn full_train(&mut self) -> Result<Phase, TrainingError> {
        let config = self.config.clone();
        let session = self.session()?;
        let epochs = config.epochs.unwrap_or(session.plan.num_epochs);

        let decay = decay_for_max_decay(config.max_decay, session.data.num_train(), config.batch_size, epochs)?;
        let mut optimizer = Sgd::new(config.sgd_lr, SGD_MOMENTUM)?
            .with_decay(decay)
            .with_clipnorm(config.clipgrad);

        let mut callbacks: Vec<Box<dyn TrainingCallback>> = std::mem::take(&mut session.plan.callbacks);
        if let Some(dir) = &config.log_dir {
            callbacks.push(Box::new(MetricsLogger::create(dir)?));
            let path = config.save_json(dir)?;
            info!("Wrote run configuration to {:?}", path);
        }

        let history = session.trainer.fit(
            &mut session.model,
            &mut optimizer,
            Arc::clone(&session.train),
            session.test.clone(),
            epochs,
            &mut callbacks,
        )?;
        self.history = history;
        Ok(Phase::Evaluate)
    }

    fn evaluate(&mut self) -> Result<Phase, TrainingError> {
        let has_targets = !self.config.export.is_empty();
        let session = self.session()?;
        let next = if has_targets { Phase::Export } else { Phase::Done };

        let Some(test) = session.test.clone() else {
            warn!("No test examples to evaluate on");
            return Ok(next);
        };
        let evaluation = session.trainer.evaluate(&session.model, Arc::clone(&test))?;
        let predictions = session.trainer.predict(&session.model, test)?;
        let predicted = predicted_classes(&predictions.prob);
        let average_accuracy = average_class_accuracy(&predicted, session.data.labels_test())?;
        info!(
            "Evaluation: loss {:.4} (prob {:.4}, center {:.4}) accuracy {:.4}, average class accuracy {:.4}",
            evaluation.total, evaluation.prob, evaluation.center_loss, evaluation.accuracy, average_accuracy
        );

        self.evaluation = evaluation;
        self.average_accuracy = average_accuracy;
        self.predictions = Some(predictions);
        Ok(next)
    }

    fn export(&mut self) -> Result<Phase, TrainingError> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| TrainingError::ValidationError("Export requires an initialized run".into()))?;
        let features = self.predictions.as_ref().map(|p| &p.embedding);
        let report = export(&session.model, &self.config.export, features);
        if report.failures() > 0 {
            warn!("{} export(s) failed", report.failures());
        }
        self.export = Some(report);
        Ok(Phase::Done)
    }
}
