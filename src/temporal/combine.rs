use burn::prelude::*;
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

use super::sequence::VolumeSequence;
use crate::error::TemporalError;

/// How forward (core → penumbra) and backward (penumbra → core) predictions are fused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CombinePolicy {
    /// Equal halves of both branches, factor ignored.
    #[default]
    #[serde(alias = "add")]
    #[value(alias = "add")]
    Uniform,
    /// `factor * forward + (1 - factor) * backward`.
    Linear,
    /// Forward branch where `factor >= 0.5`, backward branch elsewhere.
    Split,
}

/// Fuses two branch sequences under `policy`.
///
/// `factor` is `[batch, time]` and must match both sequences. For `Split` the
/// gate is the indicator `factor >= 0.5`, so every output voxel is exactly one
/// of the two branch values.
pub fn combine<B: Backend>(
    forward: &VolumeSequence<B>,
    backward: &VolumeSequence<B>,
    factor: Tensor<B, 2>,
    policy: CombinePolicy,
) -> Result<VolumeSequence<B>, TemporalError> {
    let dims = forward.dims();
    if backward.dims() != dims {
        return Err(TemporalError::shape_mismatch(
            "backward sequence",
            &dims,
            &backward.dims(),
        ));
    }
    let [batch_size, steps, ..] = dims;
    if factor.dims() != [batch_size, steps] {
        return Err(TemporalError::shape_mismatch(
            "factor",
            &[batch_size, steps],
            &factor.dims(),
        ));
    }

    let forward = forward.tensor().clone();
    let backward = backward.tensor().clone();
    let fused = match policy {
        CombinePolicy::Uniform => forward.mul_scalar(0.5) + backward.mul_scalar(0.5),
        CombinePolicy::Linear => blend(forward, backward, factor),
        CombinePolicy::Split => blend(forward, backward, factor.greater_equal_elem(0.5).float()),
    };

    VolumeSequence::new(fused)
}

fn blend<B: Backend>(forward: Tensor<B, 5>, backward: Tensor<B, 5>, weight: Tensor<B, 2>) -> Tensor<B, 5> {
    let [batch_size, steps] = weight.dims();
    let weight: Tensor<B, 5> = weight.reshape([batch_size, steps, 1, 1, 1]);
    forward * weight.clone() + backward * weight.neg().add_scalar(1.0)
}
