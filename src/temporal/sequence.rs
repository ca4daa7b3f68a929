use burn::prelude::*;
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

use crate::error::TemporalError;

/// Copies a tensor's values to the host as `f32`, whatever the backend element type.
pub(crate) fn host_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().iter::<f32>().collect()
}

/// Per-sample ordered sequence of soft segmentation volumes.
///
/// Laid out as `[batch, time, depth, height, width]`. A sequence is never
/// mutated: combining or gathering always produces new tensors.
#[derive(Clone, Debug)]
pub struct VolumeSequence<B: Backend> {
    values: Tensor<B, 5>,
}

impl<B: Backend> VolumeSequence<B> {
    pub fn new(values: Tensor<B, 5>) -> Result<Self, TemporalError> {
        let [batch_size, sequence_length, ..] = values.dims();
        if batch_size == 0 {
            return Err(TemporalError::shape_mismatch(
                "volume sequence batch",
                &[1],
                &[batch_size],
            ));
        }
        if sequence_length < 2 {
            return Err(TemporalError::SequenceTooShort { sequence_length });
        }
        Ok(Self { values })
    }

    /// Stacks per-step volumes of shape `[batch, 1, depth, height, width]` along time.
    pub fn from_steps(steps: Vec<Tensor<B, 5>>) -> Result<Self, TemporalError> {
        let Some(first) = steps.first() else {
            return Err(TemporalError::SequenceTooShort { sequence_length: 0 });
        };
        let expected = first.dims();
        for step in steps.iter().skip(1) {
            if step.dims() != expected {
                return Err(TemporalError::shape_mismatch(
                    "sequence step",
                    &expected,
                    &step.dims(),
                ));
            }
        }
        Self::new(Tensor::cat(steps, 1))
    }

    pub fn batch_size(&self) -> usize {
        self.values.dims()[0]
    }

    pub fn sequence_length(&self) -> usize {
        self.values.dims()[1]
    }

    /// Spatial shape `[depth, height, width]`.
    pub fn spatial_dims(&self) -> [usize; 3] {
        let [_, _, depth, height, width] = self.values.dims();
        [depth, height, width]
    }

    pub fn dims(&self) -> [usize; 5] {
        self.values.dims()
    }

    pub fn tensor(&self) -> &Tensor<B, 5> {
        &self.values
    }

    pub fn into_tensor(self) -> Tensor<B, 5> {
        self.values
    }

    pub fn device(&self) -> B::Device {
        self.values.device()
    }

    /// Volumes at a per-sample (possibly fractional) time index, `[batch, 1, depth, height, width]`.
    pub fn gather(&self, index: &FractionalIndex<B>) -> Result<Tensor<B, 5>, TemporalError> {
        super::gather(self.values.clone(), index)
    }

    /// Volumes at one integer step shared by the whole batch (e.g. the penumbra step).
    pub fn step(&self, step: usize) -> Result<Tensor<B, 5>, TemporalError> {
        let [batch_size, sequence_length, ..] = self.values.dims();
        if step >= sequence_length {
            return Err(TemporalError::IndexOutOfRange {
                batch_index: 0,
                index: step as f64,
                sequence_length,
            });
        }
        Ok(self.values.clone().slice([0..batch_size, step..step + 1]))
    }

    /// Monotonicity penalty over the time axis, see [`super::temporal_penalty`].
    pub fn temporal_penalty(&self) -> Tensor<B, 1> {
        super::temporal_penalty(self.values.clone())
    }
}

/// A real-valued time index per batch element, shape `[batch]`.
///
/// Kept as a tensor so gradients flow through interpolation weights.
#[derive(Clone, Debug)]
pub struct FractionalIndex<B: Backend> {
    values: Tensor<B, 1>,
}

impl<B: Backend> FractionalIndex<B> {
    pub fn new(values: Tensor<B, 1>) -> Self {
        Self { values }
    }

    /// Integer time steps, one per batch element.
    pub fn from_steps(steps: &[usize], device: &B::Device) -> Self {
        let values: Vec<f32> = steps.iter().map(|&step| step as f32).collect();
        Self::from_values(&values, device)
    }

    pub fn from_values(values: &[f32], device: &B::Device) -> Self {
        Self::new(Tensor::from_floats(values, device))
    }

    pub fn len(&self) -> usize {
        self.values.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn values(&self) -> &Tensor<B, 1> {
        &self.values
    }

    pub fn into_tensor(self) -> Tensor<B, 1> {
        self.values
    }

    pub fn to_host(&self) -> Vec<f32> {
        host_values(self.values.clone())
    }
}

/// Clinical event times of one sample, expressed in sequence steps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClinicalTimeline {
    /// Step at which the core volume was observed.
    pub t_core: usize,
    /// Step of the follow-up lesion.
    pub t_lesion: usize,
    /// Final step, always `sequence_length - 1`.
    pub t_penumbra: usize,
}

impl ClinicalTimeline {
    pub fn new(
        t_core: usize,
        t_lesion: usize,
        sequence_length: usize,
    ) -> Result<Self, TemporalError> {
        if sequence_length < 2 {
            return Err(TemporalError::SequenceTooShort { sequence_length });
        }
        let t_penumbra = sequence_length - 1;
        if t_core > t_lesion || t_lesion > t_penumbra {
            return Err(TemporalError::InvalidTimeline {
                t_core,
                t_lesion,
                sequence_length,
            });
        }
        Ok(Self {
            t_core,
            t_lesion,
            t_penumbra,
        })
    }

    /// Reads a timeline from a clinical globals vector:
    /// `globals[0]` is `t_core`, `globals[1]` is the core-to-lesion offset.
    pub fn from_globals(globals: &[f32], sequence_length: usize) -> Result<Self, TemporalError> {
        let to_step = |value: f32| -> Option<usize> {
            (value.is_finite() && value >= 0.0).then(|| value.round() as usize)
        };
        let core = globals.first().copied().and_then(to_step);
        let offset = globals.get(1).copied().and_then(to_step);
        match (core, offset) {
            (Some(t_core), Some(offset)) => Self::new(t_core, t_core + offset, sequence_length),
            _ => Err(TemporalError::InvalidTimeline {
                t_core: core.unwrap_or_default(),
                t_lesion: 0,
                sequence_length,
            }),
        }
    }

    pub fn sequence_length(&self) -> usize {
        self.t_penumbra + 1
    }
}
