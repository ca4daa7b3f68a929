use thiserror::Error;

/// Errors raised by the temporal interpolation core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TemporalError {
    /// A lesion position distribution row sums to zero.
    #[error("lesion position distribution of batch element {batch_index} sums to zero")]
    DegenerateDistribution { batch_index: usize },

    /// A lesion position weight is negative or not a number.
    #[error("lesion position weight {value} at batch element {batch_index}, step {step} is not a non-negative number")]
    NegativeWeight {
        batch_index: usize,
        step: usize,
        value: f32,
    },

    /// Fewer than two steps remain between `t_core` and the end of the sequence.
    #[error("factor schedule needs at least 2 steps from t_core = {t_core} to the end of a sequence of length {sequence_length}")]
    Schedule {
        t_core: usize,
        sequence_length: usize,
    },

    /// Two tensors that must agree in shape do not.
    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A time index lies outside `[0, sequence_length - 1]`.
    #[error("time index {index} of batch element {batch_index} is outside a sequence of length {sequence_length}")]
    IndexOutOfRange {
        batch_index: usize,
        index: f64,
        sequence_length: usize,
    },

    /// Sequences must hold at least two time steps.
    #[error("a volume sequence needs at least 2 time steps, got {sequence_length}")]
    SequenceTooShort { sequence_length: usize },

    /// Clinical event times violate `t_core <= t_lesion <= sequence_length - 1`.
    #[error("invalid clinical timeline: t_core = {t_core}, t_lesion = {t_lesion}, sequence length = {sequence_length}")]
    InvalidTimeline {
        t_core: usize,
        t_lesion: usize,
        sequence_length: usize,
    },
}

impl TemporalError {
    pub fn shape_mismatch(what: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            what,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_offending_element() {
        let err = TemporalError::DegenerateDistribution { batch_index: 3 };
        assert!(err.to_string().contains("batch element 3"));

        let err = TemporalError::shape_mismatch("factor", &[2, 10], &[2, 9]);
        assert_eq!(
            err.to_string(),
            "shape mismatch for factor: expected [2, 10], got [2, 9]"
        );
    }
}
