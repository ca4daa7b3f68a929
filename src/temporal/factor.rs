use burn::prelude::*;
use burn::tensor::backend::Backend;

use crate::error::TemporalError;

/// Forward-branch confidence for each step of one sample's sequence.
///
/// Steps before `t_core` get 1. From `t_core` the factor ramps linearly over the
/// remaining `L = sequence_length - t_core` steps, `1 - i / (L - 1)`, reaching
/// exactly 0 on the last step. `L < 2` has no ramp and is an error.
pub fn factor_schedule(t_core: usize, sequence_length: usize) -> Result<Vec<f32>, TemporalError> {
    let remaining = sequence_length.saturating_sub(t_core);
    if remaining < 2 {
        return Err(TemporalError::Schedule {
            t_core,
            sequence_length,
        });
    }

    let span = (remaining - 1) as f64;
    let mut factor = vec![1.0f32; t_core];
    factor.extend((0..remaining - 1).map(|i| (1.0 - i as f64 / span) as f32));
    factor.push(0.0);
    Ok(factor)
}

/// Factor matrix `[batch, sequence_length]` for a batch of core times.
pub fn build_factor<B: Backend>(
    t_core: &[usize],
    sequence_length: usize,
    device: &B::Device,
) -> Result<Tensor<B, 2>, TemporalError> {
    let mut values = Vec::with_capacity(t_core.len() * sequence_length);
    for &core in t_core {
        values.extend(factor_schedule(core, sequence_length)?);
    }
    Ok(Tensor::from_floats(
        TensorData::new(values, Shape::new([t_core.len(), sequence_length])),
        device,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temporal::sequence::host_values;
    use burn::backend::ndarray::{NdArray, NdArrayDevice};

    #[test]
    fn test_ramp_after_core() {
        let factor = factor_schedule(3, 10).unwrap();

        assert_eq!(factor.len(), 10);
        assert_eq!(&factor[..3], &[1.0, 1.0, 1.0]);
        assert_eq!(factor[9], 0.0);
        for pair in factor[3..].windows(2) {
            assert!(pair[1] < pair[0], "{factor:?}");
        }
    }

    #[test]
    fn test_boundaries_for_every_core_time() {
        for sequence_length in 2..16 {
            for t_core in 0..sequence_length - 1 {
                let factor = factor_schedule(t_core, sequence_length).unwrap();
                assert_eq!(factor[t_core], 1.0);
                assert_eq!(factor[sequence_length - 1], 0.0);
                assert!(factor.iter().all(|f| (0.0..=1.0).contains(f)));
                assert!(factor.windows(2).all(|pair| pair[1] <= pair[0]));
            }
        }
    }

    #[test]
    fn test_too_short_ramp_is_an_error() {
        assert_eq!(
            factor_schedule(9, 10).unwrap_err(),
            TemporalError::Schedule {
                t_core: 9,
                sequence_length: 10
            }
        );
        assert!(factor_schedule(12, 10).is_err());
        assert!(factor_schedule(0, 1).is_err());
    }

    #[test]
    fn test_build_factor_rows() {
        let device = NdArrayDevice::default();
        let factor = build_factor::<NdArray>(&[0, 2], 4, &device).unwrap();

        assert_eq!(factor.dims(), [2, 4]);
        let values = host_values(factor);
        let expected = [1.0, 2.0 / 3.0, 1.0 / 3.0, 0.0, 1.0, 1.0, 1.0, 0.0];
        for (value, expected) in values.iter().zip(expected) {
            assert!((value - expected).abs() < 1e-6, "{values:?}");
        }
    }

    #[test]
    fn test_build_factor_reports_bad_sample() {
        let device = NdArrayDevice::default();
        assert!(build_factor::<NdArray>(&[0, 3], 4, &device).is_err());
    }
}
