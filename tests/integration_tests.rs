use centerloss::data::SyntheticParams;
use centerloss::export::FeatureDump;
use centerloss::train::MetricsLogger;
use centerloss::{
    CentroidSet, ClassId, ClassList, ExportTargets, Phase, ScheduleKind, TrainConfig, TrainingError, TrainingRun,
};
use env_logger::{Builder, Env};
use ndarray::Array2;

// Initialize test logger
fn init() {
    let _ = Builder::from_env(Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
}

fn three_class_config() -> TrainConfig {
    TrainConfig {
        synthetic: SyntheticParams {
            num_classes: 3,
            input_dim: 6,
            train_per_class: 10,
            test_per_class: 3,
            spread: 0.3,
        },
        embed_dim: 8,
        hidden_layers: Some(vec![16]),
        lr_schedule: ScheduleKind::Sgd,
        epochs: Some(1),
        batch_size: 10,
        show_progress: false,
        seed: Some(11),
        ..Default::default()
    }
}

#[test]
fn test_end_to_end_three_classes() -> Result<(), TrainingError> {
    init();
    let report = TrainingRun::new(three_class_config()).run()?;

    assert_eq!(report.phases, vec![Phase::Init, Phase::FullTrain, Phase::Evaluate]);
    assert_eq!(report.history.len(), 1);
    assert!((0.0..=1.0).contains(&report.average_accuracy));

    let predictions = report.predictions.expect("test set is not empty");
    assert_eq!(predictions.prob.dim(), (9, 3));
    assert_eq!(predictions.embedding.dim(), (9, 8));
    for row in predictions.prob.rows() {
        assert!((row.sum() - 1.0).abs() < 1e-5);
    }
    Ok(())
}

#[test]
fn test_export_to_unwritable_path_completes() -> Result<(), TrainingError> {
    init();
    let dir = tempfile::tempdir()?;
    let blocker = dir.path().join("plain_file");
    std::fs::write(&blocker, "not a directory")?;

    let config = TrainConfig {
        export: ExportTargets {
            weight_dump: Some(blocker.join("weights.bin")),
            model_dump: Some(dir.path().join("model.bin")),
            feature_dump: Some(dir.path().join("features.bin")),
        },
        ..three_class_config()
    };
    let report = TrainingRun::new(config).run()?;

    assert_eq!(report.phases.last(), Some(&Phase::Export));
    let export = report.export.expect("export phase ran");
    assert_eq!(export.failures(), 1);
    assert!(dir.path().join("model.bin").exists());

    let features = FeatureDump::load(dir.path().join("features.bin"))?;
    assert_eq!(features.feat.len(), 9);
    assert!(features.feat.values().all(|v| v.len() == 8));
    Ok(())
}

#[test]
fn test_fixed_centroids_from_file() -> Result<(), TrainingError> {
    init();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("centroids.bin");
    let matrix = Array2::from_shape_fn((3, 5), |(i, j)| (i * 5 + j) as f32 / 10.0);
    let classes = ClassList::new((0..3).map(ClassId::Index));
    CentroidSet::new(classes, matrix.clone())?.save(&path)?;

    let config = TrainConfig { centroids: Some(path), ..three_class_config() };
    let report = TrainingRun::new(config).run()?;

    assert_eq!(report.model.embed_dim(), 5);
    assert!(report.model.has_fixed_centroids());
    assert_eq!(report.model.centroids(), &matrix);
    Ok(())
}

#[test]
fn test_log_dir_receives_metrics_and_config() -> Result<(), TrainingError> {
    init();
    let dir = tempfile::tempdir()?;
    let log_dir = dir.path().join("logs");
    let config = TrainConfig { log_dir: Some(log_dir.clone()), epochs: Some(2), ..three_class_config() };
    TrainingRun::new(config).run()?;

    let metrics = std::fs::read_to_string(log_dir.join(MetricsLogger::FILE_NAME))?;
    assert_eq!(metrics.lines().count(), 2);
    assert!(log_dir.join("config.json").exists());
    Ok(())
}

#[test]
fn test_sgdr_requires_max_lr() {
    init();
    let config = TrainConfig { lr_schedule: ScheduleKind::Sgdr, ..three_class_config() };
    let result = TrainingRun::new(config).run();
    assert!(matches!(result, Err(TrainingError::ConfigError(_))));
}
