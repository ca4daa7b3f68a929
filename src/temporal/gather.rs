use burn::prelude::*;
use burn::tensor::backend::Backend;

use super::sequence::FractionalIndex;
use crate::error::TemporalError;

// Indices this close outside [0, T-1] are rounding noise from the weighted mean.
const INDEX_TOLERANCE: f32 = 1e-4;

/// Reads `values` (time on dim 1) at a per-row fractional index.
///
/// For each batch element `b` with `lo = floor(index[b])`, `hi = ceil(index[b])`
/// (both clamped to the last step) and `alpha = index[b] - lo`, the result is
/// `alpha * values[b][lo] + (1 - alpha) * values[b][hi]`. Every row uses its own
/// pair of steps. The time axis is kept with length 1, so a `[batch, time, ...]`
/// input yields `[batch, 1, ...]`.
///
/// `alpha` is taken from the index tensor itself, so gradients flow into
/// whatever produced the index.
pub fn gather<B: Backend, const D: usize>(
    values: Tensor<B, D>,
    index: &FractionalIndex<B>,
) -> Result<Tensor<B, D>, TemporalError> {
    if D < 2 {
        return Err(TemporalError::shape_mismatch(
            "gather rank",
            &[2],
            &[D],
        ));
    }
    let dims = values.dims();
    let (batch_size, steps) = (dims[0], dims[1]);
    if index.len() != batch_size {
        return Err(TemporalError::shape_mismatch(
            "fractional index",
            &[batch_size],
            &[index.len()],
        ));
    }

    let positions = index.to_host();
    let rest: usize = dims[2..].iter().product();
    let mut lower_steps = Vec::with_capacity(batch_size);
    let mut lower_indices = Vec::with_capacity(batch_size * rest);
    let mut upper_indices = Vec::with_capacity(batch_size * rest);
    for (batch_index, &position) in positions.iter().enumerate() {
        let in_range = steps > 0
            && position.is_finite()
            && position >= -INDEX_TOLERANCE
            && position <= (steps - 1) as f32 + INDEX_TOLERANCE;
        if !in_range {
            return Err(TemporalError::IndexOutOfRange {
                batch_index,
                index: position as f64,
                sequence_length: steps,
            });
        }
        let last = steps - 1;
        let lower = (position.floor().max(0.0) as usize).min(last);
        let upper = (position.ceil().max(0.0) as usize).min(last);
        lower_indices.extend(std::iter::repeat(lower as i32).take(rest));
        upper_indices.extend(std::iter::repeat(upper as i32).take(rest));
        lower_steps.push(lower as f32);
    }

    // Only the two selected steps of each row are read.
    let device = values.device();
    let step_indices = |indices: Vec<i32>| {
        Tensor::<B, 1, Int>::from_ints(indices.as_slice(), &device).reshape([batch_size, 1, rest])
    };
    let flat: Tensor<B, 3> = values.reshape([batch_size, steps, rest]);
    let lower_values = flat.clone().gather(1, step_indices(lower_indices));
    let upper_values = flat.gather(1, step_indices(upper_indices));

    let alpha = (index.values().clone()
        - Tensor::<B, 1>::from_floats(lower_steps.as_slice(), &device))
    .reshape([batch_size, 1, 1]);
    let blended = lower_values * alpha.clone() + upper_values * alpha.neg().add_scalar(1.0);

    let mut out_shape = dims;
    out_shape[1] = 1;
    Ok(blended.reshape(Shape::new(out_shape)))
}
