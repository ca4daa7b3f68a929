use burn::{
    module::Ignored,
    prelude::*,
    tensor::backend::{AutodiffBackend, Backend},
    train::{
        metric::{Adaptor, LossInput},
        TrainOutput, TrainStep, ValidStep,
    },
};

use super::loss::{GrowthCriterion, GrowthLoss, LABEL_CHANNELS};
use crate::dataset::data::StrokeBatch;
use crate::error::TemporalError;
use crate::models::bidirectional::{BidirectionalSequence, SequencePredictor};
use crate::temporal::{
    build_factor, estimate_position, CombinePolicy, FractionalIndex, TemporalStep,
};

/// Bidirectional predictor together with the fusion policy and criterion of a run.
#[derive(Module, Debug)]
pub struct GrowthModel<B: Backend> {
    pub(crate) net: BidirectionalSequence<B>,
    pub(crate) policy: Ignored<CombinePolicy>,
    pub(crate) criterion: Ignored<GrowthCriterion>,
}

#[derive(Debug)]
pub struct GrowthOutput<B: Backend> {
    pub loss: GrowthLoss<B>,
    pub step: TemporalStep<B>,
    /// `[batch, 3, depth, height, width]`.
    pub labels: Tensor<B, 5>,
}

impl<B: Backend> Adaptor<LossInput<B>> for GrowthOutput<B> {
    fn adapt(&self) -> LossInput<B> {
        LossInput::new(self.loss.total.clone())
    }
}

impl<B: Backend> GrowthModel<B> {
    pub fn policy(&self) -> CombinePolicy {
        self.policy.0
    }

    /// Lesion step per sample: the learned position when the head is present
    /// and its distribution is usable, the clinical `t_lesion` otherwise.
    fn lesion_index(
        &self,
        distribution: Option<Tensor<B, 2>>,
        batch: &StrokeBatch<B>,
        device: &B::Device,
    ) -> Result<FractionalIndex<B>, TemporalError> {
        let clinical = || {
            let steps: Vec<usize> = batch.timelines.iter().map(|t| t.t_lesion).collect();
            FractionalIndex::from_steps(&steps, device)
        };
        let Some(distribution) = distribution else {
            return Ok(clinical());
        };

        match estimate_position(distribution) {
            Ok(index) => Ok(index),
            Err(TemporalError::DegenerateDistribution { batch_index }) => {
                tracing::warn!(
                    batch_index,
                    "lesion position distribution is degenerate, using clinical t_lesion"
                );
                Ok(clinical())
            }
            Err(err) => Err(err),
        }
    }

    pub fn try_forward_growth(&self, batch: StrokeBatch<B>) -> Result<GrowthOutput<B>, TemporalError> {
        let device = batch.labels.device();
        let [batch_size, channels, depth, height, width] = batch.labels.dims();
        if batch.timelines.len() != batch_size {
            return Err(TemporalError::shape_mismatch(
                "timelines",
                &[batch_size],
                &[batch.timelines.len()],
            ));
        }
        let sequence_length = self.net.sequence_length();
        if let Some(timeline) = batch
            .timelines
            .iter()
            .find(|t| t.sequence_length() != sequence_length)
        {
            return Err(TemporalError::InvalidTimeline {
                t_core: timeline.t_core,
                t_lesion: timeline.t_lesion,
                sequence_length,
            });
        }

        if channels != LABEL_CHANNELS {
            return Err(TemporalError::shape_mismatch(
                "label channels",
                &[LABEL_CHANNELS],
                &[channels],
            ));
        }
        let channel = |c: usize| {
            batch
                .labels
                .clone()
                .slice([0..batch_size, c..c + 1, 0..depth, 0..height, 0..width])
        };

        let core_steps: Vec<usize> = batch.timelines.iter().map(|t| t.t_core).collect();
        let factor = build_factor::<B>(&core_steps, sequence_length, &device)?;
        let prediction = self.net.predict(
            channel(0),
            channel(2),
            batch.clinical.clone(),
            factor.clone(),
        )?;

        let lesion_index = self.lesion_index(prediction.lesion_position.clone(), &batch, &device)?;
        let step = TemporalStep::assemble(
            &prediction,
            factor,
            &core_steps,
            lesion_index,
            self.policy.0,
        )?;
        let loss = self.criterion.0.forward(&step, batch.labels.clone())?;

        Ok(GrowthOutput {
            loss,
            step,
            labels: batch.labels,
        })
    }

    /// [`Self::try_forward_growth`] for the learner, which cannot recover from a failed step.
    pub fn forward_growth(&self, batch: StrokeBatch<B>) -> GrowthOutput<B> {
        match self.try_forward_growth(batch) {
            Ok(output) => output,
            Err(err) => {
                tracing::error!(%err, "growth step failed");
                panic!("growth step failed: {err}");
            }
        }
    }
}

impl<B: AutodiffBackend> TrainStep<StrokeBatch<B>, GrowthOutput<B>> for GrowthModel<B> {
    fn step(&self, batch: StrokeBatch<B>) -> TrainOutput<GrowthOutput<B>> {
        let item = self.forward_growth(batch);
        TrainOutput::new(self, item.loss.total.backward(), item)
    }
}

impl<B: Backend> ValidStep<StrokeBatch<B>, GrowthOutput<B>> for GrowthModel<B> {
    fn step(&self, batch: StrokeBatch<B>) -> GrowthOutput<B> {
        self.forward_growth(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temporal::ClinicalTimeline;
    use crate::training::GrowthModelConfig;
    use burn::backend::ndarray::{NdArray, NdArrayDevice};
    use burn::backend::Autodiff;
    use burn::tensor::{Distribution, Shape};
    use serial_test::serial;

    fn small_config() -> GrowthModelConfig {
        GrowthModelConfig::new()
            .with_sequence_length(5)
            .with_grunet_channels([2, 3, 3, 3, 2])
    }

    fn batch<B: Backend>(device: &B::Device) -> StrokeBatch<B> {
        StrokeBatch {
            labels: Tensor::random(Shape::new([2, 3, 2, 8, 8]), Distribution::Default, device),
            clinical: Tensor::from_floats([[1.0, 2.0], [0.0, 1.0]], device),
            timelines: vec![
                ClinicalTimeline::new(1, 3, 5).unwrap(),
                ClinicalTimeline::new(0, 1, 5).unwrap(),
            ],
        }
    }

    #[test]
    fn test_forward_growth_produces_finite_loss() {
        let device = NdArrayDevice::default();
        let model: GrowthModel<NdArray> = small_config().init(&device);

        let output = model.try_forward_growth(batch(&device)).unwrap();

        let loss: f32 = output.loss.total.into_scalar();
        assert!(loss.is_finite());
        assert_eq!(output.step.fused.dims(), [2, 5, 2, 8, 8]);
        let lesion_index = output.step.lesion_index.to_host();
        assert!(lesion_index.iter().all(|&i| (-1e-4..=4.0 + 1e-4).contains(&i)));
    }

    #[test]
    fn test_without_head_the_clinical_lesion_step_is_used() {
        let device = NdArrayDevice::default();
        let model: GrowthModel<NdArray> = small_config().with_lesion_head(false).init(&device);

        let output = model.try_forward_growth(batch(&device)).unwrap();

        assert_eq!(output.step.lesion_index.to_host(), vec![3.0, 1.0]);
    }

    #[test]
    fn test_timeline_length_must_match_the_model() {
        let device = NdArrayDevice::default();
        let model: GrowthModel<NdArray> = small_config().with_sequence_length(6).init(&device);

        let err = model.try_forward_growth(batch(&device)).unwrap_err();

        assert!(matches!(err, TemporalError::InvalidTimeline { .. }));
    }

    #[test]
    #[serial]
    fn test_train_step_backward() {
        type MyBackend = Autodiff<NdArray>;
        let device = NdArrayDevice::default();
        let model: GrowthModel<MyBackend> = small_config().init(&device);

        let output = model.forward_growth(batch(&device));
        let grads = output.loss.total.backward();

        let grads = burn::optim::GradientsParams::from_grads(grads, &model);
        assert!(!grads.is_empty());
    }
}
