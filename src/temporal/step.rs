use burn::prelude::*;
use burn::tensor::backend::Backend;

use super::{combine, CombinePolicy, FractionalIndex, VolumeSequence};
use crate::error::TemporalError;

/// Output of a bidirectional sequence predictor for one batch.
#[derive(Clone, Debug)]
pub struct SequencePrediction<B: Backend> {
    /// Core → penumbra branch.
    pub forward: VolumeSequence<B>,
    /// Penumbra → core branch, already in time order.
    pub backward: VolumeSequence<B>,
    /// Optional learned lesion position distribution, `[batch, time]`.
    pub lesion_position: Option<Tensor<B, 2>>,
}

/// Everything one training or inference step derives from a prediction.
///
/// Reference volumes are `[batch, 1, depth, height, width]`, ready to be
/// compared against the core, lesion and penumbra label channels.
#[derive(Clone, Debug)]
pub struct TemporalStep<B: Backend> {
    pub fused: VolumeSequence<B>,
    pub core: Tensor<B, 5>,
    pub lesion: Tensor<B, 5>,
    pub penumbra: Tensor<B, 5>,
    pub forward_at_lesion: Tensor<B, 5>,
    pub backward_at_lesion: Tensor<B, 5>,
    pub lesion_index: FractionalIndex<B>,
    pub monotonicity: Tensor<B, 1>,
}

impl<B: Backend> TemporalStep<B> {
    /// Fuses both branches and extracts the core, lesion and penumbra references.
    ///
    /// `core_steps` anchors the core reference per sample; `lesion_index` may be
    /// fractional. The penumbra reference is the last step.
    pub fn assemble(
        prediction: &SequencePrediction<B>,
        factor: Tensor<B, 2>,
        core_steps: &[usize],
        lesion_index: FractionalIndex<B>,
        policy: CombinePolicy,
    ) -> Result<Self, TemporalError> {
        let fused = combine(&prediction.forward, &prediction.backward, factor, policy)?;
        let batch_size = fused.batch_size();
        if core_steps.len() != batch_size {
            return Err(TemporalError::shape_mismatch(
                "core steps",
                &[batch_size],
                &[core_steps.len()],
            ));
        }

        let device = fused.device();
        let core = fused.gather(&FractionalIndex::from_steps(core_steps, &device))?;
        let lesion = fused.gather(&lesion_index)?;
        let penumbra = fused.step(fused.sequence_length() - 1)?;
        let forward_at_lesion = prediction.forward.gather(&lesion_index)?;
        let backward_at_lesion = prediction.backward.gather(&lesion_index)?;
        let monotonicity = fused.temporal_penalty();

        Ok(Self {
            fused,
            core,
            lesion,
            penumbra,
            forward_at_lesion,
            backward_at_lesion,
            lesion_index,
            monotonicity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temporal::{build_factor, sequence::host_values};
    use burn::backend::ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray;

    fn ramp(batch: usize, steps: usize, reversed: bool) -> VolumeSequence<TestBackend> {
        let device = NdArrayDevice::default();
        let mut values = Vec::with_capacity(batch * steps);
        for _ in 0..batch {
            for t in 0..steps {
                let t = if reversed { steps - 1 - t } else { t };
                values.push(t as f32 / (steps - 1) as f32);
            }
        }
        let tensor = Tensor::<TestBackend, 1>::from_floats(values.as_slice(), &device)
            .reshape([batch, steps, 1, 1, 1]);
        VolumeSequence::new(tensor).unwrap()
    }

    #[test]
    fn test_references_come_from_their_own_steps() {
        let device = NdArrayDevice::default();
        let prediction = SequencePrediction {
            forward: ramp(2, 5, false),
            backward: ramp(2, 5, false),
            lesion_position: None,
        };
        let factor = build_factor::<TestBackend>(&[1, 2], 5, &device).unwrap();
        let lesion_index = FractionalIndex::from_values(&[2.0, 3.5], &device);

        let step = TemporalStep::assemble(
            &prediction,
            factor,
            &[1, 2],
            lesion_index,
            CombinePolicy::Linear,
        )
        .unwrap();

        assert_eq!(host_values(step.core), vec![0.25, 0.5]);
        let lesion = host_values(step.lesion);
        assert!((lesion[0] - 0.5).abs() < 1e-6);
        assert!((lesion[1] - 0.875).abs() < 1e-6);
        assert_eq!(host_values(step.penumbra), vec![1.0, 1.0]);
        assert_eq!(host_values(step.monotonicity), vec![0.0]);
    }

    #[test]
    fn test_shrinking_fusion_is_penalised() {
        let device = NdArrayDevice::default();
        let prediction = SequencePrediction {
            forward: ramp(1, 5, true),
            backward: ramp(1, 5, true),
            lesion_position: None,
        };
        let factor = build_factor::<TestBackend>(&[0], 5, &device).unwrap();

        let step = TemporalStep::assemble(
            &prediction,
            factor,
            &[0],
            FractionalIndex::from_steps(&[2], &device),
            CombinePolicy::Uniform,
        )
        .unwrap();

        assert!(host_values(step.monotonicity)[0] > 0.0);
        assert_eq!(host_values(step.forward_at_lesion), vec![0.5]);
        assert_eq!(host_values(step.backward_at_lesion), vec![0.5]);
    }

    #[test]
    fn test_disagreeing_branches_are_read_at_the_lesion_step() {
        let device = NdArrayDevice::default();
        let prediction = SequencePrediction {
            forward: ramp(1, 5, false),
            backward: ramp(1, 5, true),
            lesion_position: None,
        };
        let factor = build_factor::<TestBackend>(&[0], 5, &device).unwrap();

        let step = TemporalStep::assemble(
            &prediction,
            factor,
            &[0],
            FractionalIndex::from_steps(&[1], &device),
            CombinePolicy::Uniform,
        )
        .unwrap();

        // Uniform fusion of opposite ramps is flat, so only the branch pair differs.
        assert_eq!(host_values(step.forward_at_lesion), vec![0.25]);
        assert_eq!(host_values(step.backward_at_lesion), vec![0.75]);
        assert_eq!(host_values(step.lesion), vec![0.5]);
        assert_eq!(host_values(step.monotonicity), vec![0.0]);
    }

    #[test]
    fn test_core_steps_must_cover_the_batch() {
        let device = NdArrayDevice::default();
        let prediction = SequencePrediction {
            forward: ramp(2, 4, false),
            backward: ramp(2, 4, false),
            lesion_position: None,
        };
        let factor = build_factor::<TestBackend>(&[0, 0], 4, &device).unwrap();

        let err = TemporalStep::assemble(
            &prediction,
            factor,
            &[0],
            FractionalIndex::from_steps(&[1, 1], &device),
            CombinePolicy::Split,
        )
        .unwrap_err();

        assert!(matches!(err, TemporalError::ShapeMismatch { what: "core steps", .. }));
    }
}
