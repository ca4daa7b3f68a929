use burn::prelude::*;
use burn::tensor::backend::Backend;

use super::sequence::{host_values, FractionalIndex};
use crate::error::TemporalError;

/// Turns a lesion position distribution `[batch, time]` into a fractional
/// time index per batch element: `Σ_t t·w[t] / Σ_t w[t]`.
///
/// Weights need not be normalised, but every row must be non-negative and
/// carry some mass. The result stays attached to the autodiff graph of
/// `distribution`.
pub fn estimate_position<B: Backend>(
    distribution: Tensor<B, 2>,
) -> Result<FractionalIndex<B>, TemporalError> {
    let [batch_size, steps] = distribution.dims();
    if steps == 0 {
        return Err(TemporalError::SequenceTooShort { sequence_length: 0 });
    }

    let weights = host_values(distribution.clone());
    for (batch_index, row) in weights.chunks(steps).enumerate() {
        let mut mass = 0.0f64;
        for (step, &value) in row.iter().enumerate() {
            // NaN fails this comparison as well
            if !(value >= 0.0) {
                return Err(TemporalError::NegativeWeight {
                    batch_index,
                    step,
                    value,
                });
            }
            mass += value as f64;
        }
        if mass <= 0.0 {
            return Err(TemporalError::DegenerateDistribution { batch_index });
        }
    }

    let device = distribution.device();
    let time_steps = Tensor::<B, 1, Int>::arange(0..steps as i64, &device)
        .float()
        .reshape([1, steps]);
    let numerator = (distribution.clone() * time_steps).sum_dim(1);
    let denominator = distribution.sum_dim(1);

    Ok(FractionalIndex::new(
        (numerator / denominator).reshape([batch_size]),
    ))
}
