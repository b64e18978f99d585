use centerloss::{
    load_class_list, transform_inputs, Architecture, CenterLossModel, CentroidSource, ClassId, DatasetKind,
    MergeStrategy, ScheduleKind, TrainConfig, TrainingError, TrainingRun,
};
use ndarray::Array2;

fn builder() -> centerloss::CenterLossModelBuilder {
    CenterLossModel::builder()
}

#[test]
fn test_builder_requires_network_and_centroids() {
    let result = builder().with_centroids(CentroidSource::Learned(3)).and_then(|b| b.build());
    assert!(matches!(result, Err(TrainingError::BuildError(_))));

    let result = builder().with_architecture(Architecture::Simple, 4, 2).and_then(|b| b.build());
    assert!(matches!(result, Err(TrainingError::BuildError(_))));
}

#[test]
fn test_builder_rejects_duplicates() {
    let result = builder()
        .with_architecture(Architecture::Simple, 4, 2)
        .and_then(|b| b.with_architecture(Architecture::Deep, 4, 2));
    assert!(matches!(result, Err(TrainingError::BuildError(_))));

    let result = builder()
        .with_centroids(CentroidSource::Learned(3))
        .and_then(|b| b.with_centroids(CentroidSource::Learned(3)));
    assert!(matches!(result, Err(TrainingError::BuildError(_))));
}

#[test]
fn test_builder_rejects_zero_classes_and_dimension_mismatch() {
    let result = builder().with_centroids(CentroidSource::Learned(0));
    assert!(matches!(result, Err(TrainingError::BuildError(_))));

    let result = builder()
        .with_architecture(Architecture::Simple, 4, 2)
        .and_then(|b| b.with_centroids(CentroidSource::Fixed(Array2::zeros((3, 5)))))
        .and_then(|b| b.build());
    assert!(matches!(result, Err(TrainingError::BuildError(_))));
}

#[test]
fn test_forward_rejects_bad_inputs() -> Result<(), TrainingError> {
    let model = builder()
        .with_architecture(Architecture::Simple, 4, 2)?
        .with_hidden_layers(vec![3])
        .with_centroids(CentroidSource::Learned(3))?
        .build()?;

    let images = Array2::zeros((2, 4));
    assert!(matches!(model.predict(&images, &[0, 3]), Err(TrainingError::ValidationError(_))));
    assert!(matches!(model.predict(&images, &[0]), Err(TrainingError::ValidationError(_))));
    assert!(matches!(
        model.predict(&Array2::zeros((2, 5)), &[0, 1]),
        Err(TrainingError::ValidationError(_))
    ));
    Ok(())
}

#[test]
fn test_transform_validation() {
    let result = transform_inputs(Array2::zeros((2, 3)), vec![0, 4], 3);
    assert!(matches!(result, Err(TrainingError::ValidationError(_))));

    let result = transform_inputs(Array2::zeros((2, 3)), vec![0], 3);
    assert!(matches!(result, Err(TrainingError::ValidationError(_))));
}

#[test]
fn test_transform_targets() -> Result<(), TrainingError> {
    let batch = transform_inputs(Array2::ones((3, 2)), vec![2, 0, 1], 3)?;
    assert_eq!(batch.inputs.labels, vec![2, 0, 1]);
    assert_eq!(batch.targets.one_hot.row(0).to_vec(), vec![0.0, 0.0, 1.0]);
    assert_eq!(batch.targets.one_hot.row(1).to_vec(), vec![1.0, 0.0, 0.0]);
    assert!(batch.targets.center.iter().all(|&v| v == 0.0));
    assert_eq!(batch.targets.center.len(), 3);
    Ok(())
}

#[test]
fn test_unknown_names() {
    assert!(matches!("adam".parse::<ScheduleKind>(), Err(TrainingError::ConfigError(_))));
    assert!(matches!("resnet".parse::<Architecture>(), Err(TrainingError::ConfigError(_))));
    assert!("tpu".parse::<MergeStrategy>().is_err());
    assert!("imagenet".parse::<DatasetKind>().is_err());
    assert_eq!("sgdr".parse::<ScheduleKind>().ok(), Some(ScheduleKind::Sgdr));
}

#[test]
fn test_class_list_file() -> Result<(), TrainingError> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("classes.txt");
    std::fs::write(&path, "n01 first\n\nn02 second\nn01 again\n")?;

    let classes = load_class_list(&path)?;
    assert_eq!(classes.len(), 2);
    assert_eq!(classes.index_of(&ClassId::from("n02")), Some(1));
    Ok(())
}

#[test]
fn test_invalid_run_configs() {
    let bad = [
        TrainConfig { batch_size: 0, ..Default::default() },
        TrainConfig { max_decay: 0.5, ..Default::default() },
        TrainConfig { center_loss_weight: -1.0, ..Default::default() },
        TrainConfig { epochs: Some(0), ..Default::default() },
    ];
    for config in bad {
        let result = TrainingRun::new(config).run();
        assert!(matches!(result, Err(TrainingError::ConfigError(_))));
    }
}

#[test]
fn test_missing_centroid_file_is_fatal() {
    let config = TrainConfig {
        centroids: Some("/nonexistent/centroids.bin".into()),
        show_progress: false,
        ..Default::default()
    };
    let result = TrainingRun::new(config).run();
    assert!(matches!(result, Err(TrainingError::IoError(_))));
}
