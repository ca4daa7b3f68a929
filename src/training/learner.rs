use std::path::Path;

use anyhow::Context;
use burn::{
    data::{dataloader::DataLoaderBuilder, dataset::Dataset},
    module::AutodiffModule,
    prelude::*,
    record::CompactRecorder,
    tensor::backend::{AutodiffBackend, Backend},
    train::{metric::LossMetric, LearnerBuilder},
};

use super::config::TrainingConfig;
use super::metrics::BinaryMeasures;
use super::model::GrowthModel;
use crate::dataset::data::{StrokeBatcher, StrokeDataset};

fn create_artifact_dir(artifact_dir: &Path) -> anyhow::Result<()> {
    // Stale checkpoints would be picked up by the learner summary.
    std::fs::remove_dir_all(artifact_dir).ok();
    std::fs::create_dir_all(artifact_dir)
        .with_context(|| format!("creating artifact directory {}", artifact_dir.display()))
}

/// Trains a [`GrowthModel`] and stores the config and final weights in `artifact_dir`.
pub fn train<B: AutodiffBackend>(
    artifact_dir: &Path,
    config: &TrainingConfig,
    train_set: StrokeDataset,
    valid_set: StrokeDataset,
    device: B::Device,
) -> anyhow::Result<GrowthModel<B>> {
    create_artifact_dir(artifact_dir)?;
    B::seed(config.seed);

    let model = config.model.init::<B>(&device);
    let lr_scheduler = config.lr_scheduler(train_set.len());
    tracing::info!(
        parameters = model.num_params(),
        train = train_set.len(),
        valid = valid_set.len(),
        policy = ?config.model.combine,
        lr_step_iterations = lr_scheduler.step_size,
        "starting training"
    );

    let mut batcher_train = StrokeBatcher::<B>::new(device.clone());
    let mut batcher_valid = StrokeBatcher::<B::InnerBackend>::new(device.clone());
    if let Some(size) = config.resize {
        batcher_train = batcher_train.with_resize(size);
        batcher_valid = batcher_valid.with_resize(size);
    }

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(train_set);
    let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(valid_set);

    let learner = LearnerBuilder::new(artifact_dir.to_string_lossy().as_ref())
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .with_file_checkpointer(CompactRecorder::new())
        .devices(vec![device.clone()])
        .num_epochs(config.num_epochs)
        .summary()
        .build(model, config.optimizer.init(), lr_scheduler.init());

    let model_trained = learner.fit(dataloader_train, dataloader_valid);

    config
        .save(artifact_dir.join("config.json"))
        .map_err(|err| anyhow::anyhow!("saving training config: {err:?}"))?;
    model_trained
        .clone()
        .save_file(artifact_dir.join("model"), &CompactRecorder::new())
        .map_err(|err| anyhow::anyhow!("saving trained model: {err:?}"))?;
    tracing::info!(artifact_dir = %artifact_dir.display(), "saved config and model");

    Ok(model_trained)
}

/// Binary measures of the fused lesion reference against the lesion label, one per case.
pub fn evaluate<B: Backend>(
    model: &GrowthModel<B>,
    dataset: StrokeDataset,
    batcher: StrokeBatcher<B>,
) -> anyhow::Result<Vec<BinaryMeasures>> {
    use burn::data::dataloader::batcher::Batcher;

    let mut measures = Vec::with_capacity(dataset.len());
    for index in 0..dataset.len() {
        let Some(item) = dataset.get(index) else {
            continue;
        };
        let output = model.try_forward_growth(batcher.batch(vec![item]))?;
        let [batch_size, _, depth, height, width] = output.labels.dims();
        let lesion_label = output
            .labels
            .slice([0..batch_size, 1..2, 0..depth, 0..height, 0..width]);
        measures.push(BinaryMeasures::compute(output.step.lesion, lesion_label, 0.5));
    }
    Ok(measures)
}

/// Runs [`evaluate`] on the inner backend of a trained model.
pub fn evaluate_trained<B: AutodiffBackend>(
    model: &GrowthModel<B>,
    dataset: StrokeDataset,
    batcher: StrokeBatcher<B::InnerBackend>,
) -> anyhow::Result<BinaryMeasures> {
    let measures = evaluate(&model.valid(), dataset, batcher)?;
    let mean = BinaryMeasures::mean(&measures);
    tracing::info!(
        cases = measures.len(),
        dice = mean.dice,
        precision = mean.precision,
        sensitivity = mean.sensitivity,
        specificity = mean.specificity,
        "lesion reference on validation set"
    );
    Ok(mean)
}
