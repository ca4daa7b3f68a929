use burn::prelude::*;
use burn::tensor::backend::Backend;

use crate::error::TemporalError;
use crate::temporal::TemporalStep;

/// Label channels of a stroke sample: core, follow-up lesion, penumbra.
pub const LABEL_CHANNELS: usize = 3;

/// Soft Dice loss accumulated over the whole batch, one weight per label channel.
#[derive(Clone, Debug)]
pub struct DiceLoss {
    label_weights: Vec<f32>,
    epsilon: f32,
}

impl DiceLoss {
    pub fn new(label_weights: Vec<f32>) -> Self {
        Self {
            label_weights,
            epsilon: 1e-7,
        }
    }

    /// `outputs` and `targets` are `[batch, labels, depth, height, width]`.
    pub fn forward<B: Backend>(
        &self,
        outputs: Tensor<B, 5>,
        targets: Tensor<B, 5>,
    ) -> Result<Tensor<B, 1>, TemporalError> {
        let dims = outputs.dims();
        if targets.dims() != dims {
            return Err(TemporalError::shape_mismatch(
                "dice target",
                &dims,
                &targets.dims(),
            ));
        }
        let [batch_size, labels, depth, height, width] = dims;
        if labels != self.label_weights.len() {
            return Err(TemporalError::shape_mismatch(
                "dice label weights",
                &[labels],
                &[self.label_weights.len()],
            ));
        }

        let mut overlap = Tensor::<B, 1>::zeros([1], &outputs.device());
        for (label, &weight) in self.label_weights.iter().enumerate() {
            let range = [0..batch_size, label..label + 1, 0..depth, 0..height, 0..width];
            let output = outputs.clone().slice(range.clone());
            let target = targets.clone().slice(range);

            let numerator = (output.clone() * target.clone())
                .sum()
                .mul_scalar(2.0)
                .add_scalar(self.epsilon);
            let denominator = (output.clone() * output).sum()
                + (target.clone() * target).sum().add_scalar(self.epsilon);
            overlap = overlap + (numerator / denominator).mul_scalar(weight);
        }
        Ok(overlap.neg().add_scalar(1.0))
    }
}

/// Individual terms of a [`GrowthCriterion`], already weighted.
#[derive(Clone, Debug)]
pub struct GrowthLoss<B: Backend> {
    pub total: Tensor<B, 1>,
    pub core: Tensor<B, 1>,
    pub lesion: Tensor<B, 1>,
    pub penumbra: Tensor<B, 1>,
    pub agreement: Tensor<B, 1>,
    pub monotonicity: Tensor<B, 1>,
}

/// Weighted sum of reference Dice terms, branch agreement and monotonicity.
///
/// Weights are given in percent, in the order core, lesion, penumbra,
/// branch agreement at the lesion step, monotonicity.
#[derive(Clone, Debug)]
pub struct GrowthCriterion {
    weights: [f32; 5],
    dice: DiceLoss,
}

impl GrowthCriterion {
    pub fn new(weights_percent: [f32; 5]) -> Self {
        Self {
            weights: weights_percent.map(|w| w / 100.0),
            dice: DiceLoss::new(vec![1.0]),
        }
    }

    pub fn weights(&self) -> [f32; 5] {
        self.weights
    }

    /// `labels` is `[batch, 3, depth, height, width]`.
    pub fn forward<B: Backend>(
        &self,
        step: &TemporalStep<B>,
        labels: Tensor<B, 5>,
    ) -> Result<GrowthLoss<B>, TemporalError> {
        let [batch_size, channels, depth, height, width] = labels.dims();
        if channels != LABEL_CHANNELS {
            return Err(TemporalError::shape_mismatch(
                "label channels",
                &[LABEL_CHANNELS],
                &[channels],
            ));
        }
        let label = |c: usize| {
            labels
                .clone()
                .slice([0..batch_size, c..c + 1, 0..depth, 0..height, 0..width])
        };
        let [w_core, w_lesion, w_penumbra, w_agreement, w_monotonicity] = self.weights;

        let core = self.dice.forward(step.core.clone(), label(0))?.mul_scalar(w_core);
        let lesion = self
            .dice
            .forward(step.lesion.clone(), label(1))?
            .mul_scalar(w_lesion);
        let penumbra = self
            .dice
            .forward(step.penumbra.clone(), label(2))?
            .mul_scalar(w_penumbra);
        let agreement = self
            .dice
            .forward(step.forward_at_lesion.clone(), step.backward_at_lesion.clone())?
            .mul_scalar(w_agreement);
        let monotonicity = step.monotonicity.clone().mul_scalar(w_monotonicity);

        let total = core.clone()
            + lesion.clone()
            + penumbra.clone()
            + agreement.clone()
            + monotonicity.clone();
        Ok(GrowthLoss {
            total,
            core,
            lesion,
            penumbra,
            agreement,
            monotonicity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temporal::{
        build_factor, CombinePolicy, FractionalIndex, SequencePrediction, VolumeSequence,
    };
    use burn::backend::ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray;

    fn scalar(tensor: Tensor<TestBackend, 1>) -> f32 {
        tensor.into_scalar()
    }

    fn volume(values: [f32; 2], device: &NdArrayDevice) -> Tensor<TestBackend, 5> {
        Tensor::<TestBackend, 1>::from_floats(values, device).reshape([1, 1, 1, 1, 2])
    }

    #[test]
    fn test_dice_of_identical_masks_is_zero() {
        let device = NdArrayDevice::default();
        let mask = Tensor::<TestBackend, 5>::ones([2, 1, 2, 3, 3], &device);

        let loss = DiceLoss::new(vec![1.0]).forward(mask.clone(), mask).unwrap();

        assert!(scalar(loss).abs() < 1e-6);
    }

    #[test]
    fn test_dice_of_disjoint_masks_is_one() {
        let device = NdArrayDevice::default();
        let left = volume([1.0, 0.0], &device);
        let right = volume([0.0, 1.0], &device);

        let loss = DiceLoss::new(vec![1.0]).forward(left, right).unwrap();

        assert!((scalar(loss) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_dice_half_overlap() {
        let device = NdArrayDevice::default();
        let output = volume([1.0, 1.0], &device);
        let target = volume([1.0, 0.0], &device);

        // 1 - 2 * 1 / (2 + 1)
        let loss = DiceLoss::new(vec![1.0]).forward(output, target).unwrap();

        assert!((scalar(loss) - 1.0 / 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_dice_checks_label_weights() {
        let device = NdArrayDevice::default();
        let mask = Tensor::<TestBackend, 5>::ones([1, 2, 1, 2, 2], &device);

        let err = DiceLoss::new(vec![1.0]).forward(mask.clone(), mask).unwrap_err();

        assert!(matches!(err, TemporalError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_perfect_prediction_costs_nothing() {
        let device = NdArrayDevice::default();
        // Constant, fully agreeing branches equal to every label.
        let ones = Tensor::<TestBackend, 5>::ones([1, 4, 1, 2, 2], &device);
        let prediction = SequencePrediction {
            forward: VolumeSequence::new(ones.clone()).unwrap(),
            backward: VolumeSequence::new(ones).unwrap(),
            lesion_position: None,
        };
        let factor = build_factor::<TestBackend>(&[0], 4, &device).unwrap();
        let step = TemporalStep::assemble(
            &prediction,
            factor,
            &[0],
            FractionalIndex::from_values(&[1.5], &device),
            CombinePolicy::Linear,
        )
        .unwrap();
        let labels = Tensor::<TestBackend, 5>::ones([1, 3, 1, 2, 2], &device);

        let loss = GrowthCriterion::new([10.0, 44.0, 10.0, 25.0, 1.0])
            .forward(&step, labels)
            .unwrap();

        assert!(scalar(loss.total).abs() < 1e-5);
    }

    #[test]
    fn test_weights_are_percentages() {
        let criterion = GrowthCriterion::new([10.0, 44.0, 10.0, 25.0, 1.0]);
        let weights = criterion.weights();
        assert!((weights[1] - 0.44).abs() < 1e-7);
        assert!((weights.iter().sum::<f32>() - 0.9).abs() < 1e-6);
    }
}
