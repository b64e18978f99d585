use centerloss::model::Placement;
use centerloss::{
    transform_inputs, Architecture, CenterLossModel, CentroidSource, JointObjective, MergeStrategy, RuntimeConfig,
    Sgd, Trainer, TrainingError,
};
use ndarray::Array2;

fn batch() -> (Array2<f32>, Vec<usize>) {
    let images = Array2::from_shape_fn((8, 5), |(i, j)| ((i * 3 + j) % 7) as f32 / 7.0 - 0.4);
    let labels = vec![0, 1, 2, 0, 1, 2, 0, 1];
    (images, labels)
}

fn model(source: CentroidSource) -> CenterLossModel {
    CenterLossModel::builder()
        .with_architecture(Architecture::Simple, 5, 4)
        .unwrap()
        .with_hidden_layers(vec![6])
        .with_centroids(source)
        .unwrap()
        .with_seed(21)
        .build()
        .unwrap()
}

fn train(model: &mut CenterLossModel, runtime: RuntimeConfig, steps: usize) -> Result<(), TrainingError> {
    let trainer = Trainer::new(JointObjective::default(), runtime, false)?;
    let mut optimizer = Sgd::new(0.1, 0.9)?;
    let (images, labels) = batch();
    let transformed = transform_inputs(images, labels, model.num_classes())?;
    for _ in 0..steps {
        trainer.train_step(model, &mut optimizer, &transformed)?;
    }
    Ok(())
}

#[test]
fn test_output_shapes() -> Result<(), TrainingError> {
    let model = model(CentroidSource::Learned(3));
    let (images, labels) = batch();
    let output = model.predict(&images, &labels)?;
    assert_eq!(output.prob.dim(), (8, 3));
    assert_eq!(output.center_loss.len(), 8);
    assert_eq!(output.embedding.dim(), (8, 4));
    assert!(output.center_loss.iter().all(|&d| d >= 0.0));
    Ok(())
}

#[test]
fn test_fixed_centroids_stay_unchanged() -> Result<(), TrainingError> {
    let fixed = Array2::from_shape_fn((3, 4), |(i, j)| if i == j { 1.0 } else { 0.0 });
    let mut model = model(CentroidSource::Fixed(fixed.clone()));
    train(&mut model, RuntimeConfig::default(), 3)?;
    assert_eq!(model.centroids(), &fixed);

    model.freeze_trunk();
    model.unfreeze_all();
    assert!(model.summary().iter().any(|l| l.name == "cls_centroids" && !l.trainable));
    Ok(())
}

#[test]
fn test_learned_centroids_change() -> Result<(), TrainingError> {
    let mut model = model(CentroidSource::Learned(3));
    let before = model.centroids().clone();
    train(&mut model, RuntimeConfig::default(), 3)?;
    assert_ne!(model.centroids(), &before);
    Ok(())
}

#[test]
fn test_merge_strategies_agree() -> Result<(), TrainingError> {
    let runtime = |merge| RuntimeConfig { devices: 2, merge, ..Default::default() };
    let mut host = model(CentroidSource::Learned(3));
    let mut device = model(CentroidSource::Learned(3));
    assert_eq!(runtime(MergeStrategy::Host).placement(), Placement::Host);

    train(&mut host, runtime(MergeStrategy::Host), 2)?;
    train(&mut device, runtime(MergeStrategy::Device), 2)?;
    for (a, b) in host.centroids().iter().zip(device.centroids().iter()) {
        assert!((a - b).abs() < 1e-6);
    }
    Ok(())
}

#[test]
fn test_model_dump_restores_predictions() -> Result<(), TrainingError> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("model.bin");
    let mut trained = model(CentroidSource::Learned(3));
    train(&mut trained, RuntimeConfig::default(), 2)?;
    trained.save(&path)?;

    let restored = CenterLossModel::load(&path, Placement::Host)?;
    let (images, labels) = batch();
    let expected = trained.predict(&images, &labels)?;
    let actual = restored.predict(&images, &labels)?;
    for (a, b) in expected.prob.iter().zip(actual.prob.iter()) {
        assert!((a - b).abs() < 1e-6);
    }
    assert_eq!(restored.placement(), Placement::Host);
    Ok(())
}
