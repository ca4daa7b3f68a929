use burn::prelude::*;
use burn::tensor::backend::Backend;

/// Penalises any voxel whose value decreases between consecutive time steps.
///
/// For each pair `(t, t+1)` the term is `mean(|diff| - diff)` with
/// `diff = x[t+1] - x[t]`, i.e. `2|diff|` where the sequence shrinks and 0
/// where it grows or stays. Terms are summed over the `T - 1` pairs. Time is
/// dim 1. Returns a one-element tensor.
pub fn temporal_penalty<B: Backend, const D: usize>(sequence: Tensor<B, D>) -> Tensor<B, 1> {
    let dims = sequence.dims();
    let device = sequence.device();
    if D < 2 || dims[1] < 2 {
        return Tensor::zeros([1], &device);
    }
    let (batch_size, steps) = (dims[0], dims[1]);

    let next = sequence.clone().slice([0..batch_size, 1..steps]);
    let previous = sequence.slice([0..batch_size, 0..steps - 1]);
    let diff = next - previous;

    (diff.clone().abs() - diff)
        .mean()
        .mul_scalar((steps - 1) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temporal::sequence::host_values;
    use burn::backend::ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray;

    fn penalty_of(rows: &[[f32; 5]]) -> f32 {
        let device = NdArrayDevice::default();
        let values: Vec<f32> = rows.iter().flatten().copied().collect();
        let sequence =
            Tensor::<TestBackend, 1>::from_floats(values.as_slice(), &device).reshape([rows.len(), 5, 1, 1, 1]);
        host_values(temporal_penalty(sequence))[0]
    }

    #[test]
    fn test_non_decreasing_sequence_scores_zero() {
        assert_eq!(penalty_of(&[[0.0, 0.1, 0.1, 0.5, 1.0], [0.2, 0.2, 0.2, 0.2, 0.2]]), 0.0);
    }

    #[test]
    fn test_single_drop_scales_with_its_size() {
        let small = penalty_of(&[[0.0, 0.5, 0.4, 0.6, 0.7]]);
        let large = penalty_of(&[[0.0, 0.5, 0.2, 0.6, 0.7]]);

        assert!(small > 0.0);
        assert!((large / small - 3.0).abs() < 1e-4, "{small} {large}");
    }

    #[test]
    fn test_drop_counts_twice_its_magnitude() {
        // one pair of four drops by 0.25: that pair's mean is 2 * 0.25
        let penalty = penalty_of(&[[1.0, 1.0, 0.75, 0.75, 0.75]]);
        assert!((penalty - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_growth_does_not_offset_shrinkage() {
        let shrink_only = penalty_of(&[[0.5, 0.5, 0.3, 0.3, 0.3]]);
        let shrink_then_grow = penalty_of(&[[0.5, 0.5, 0.3, 1.0, 1.0]]);
        assert!((shrink_only - shrink_then_grow).abs() < 1e-6);
    }

    #[test]
    fn test_short_sequences_score_zero() {
        let device = NdArrayDevice::default();
        let sequence = Tensor::<TestBackend, 3>::ones([2, 1, 4], &device);
        assert_eq!(host_values(temporal_penalty(sequence)), vec![0.0]);
    }
}
