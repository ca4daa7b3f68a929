use burn::prelude::*;
use burn::tensor::backend::Backend;

use crate::temporal::host_values;

/// Overlap measures of a thresholded prediction against a thresholded target.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BinaryMeasures {
    pub dice: f64,
    pub precision: f64,
    pub sensitivity: f64,
    pub specificity: f64,
}

impl BinaryMeasures {
    /// Both tensors are binarised with `value > threshold`. Ratios with an
    /// empty denominator score 0.
    pub fn compute<B: Backend, const D: usize>(
        output: Tensor<B, D>,
        target: Tensor<B, D>,
        threshold: f32,
    ) -> Self {
        let output = host_values(output);
        let target = host_values(target);

        let (mut tp, mut fp, mut fn_, mut tn) = (0usize, 0usize, 0usize, 0usize);
        for (&o, &t) in output.iter().zip(&target) {
            match (o > threshold, t > threshold) {
                (true, true) => tp += 1,
                (true, false) => fp += 1,
                (false, true) => fn_ += 1,
                (false, false) => tn += 1,
            }
        }

        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        Self {
            dice: ratio(2 * tp, 2 * tp + fp + fn_),
            precision: ratio(tp, tp + fp),
            sensitivity: ratio(tp, tp + fn_),
            specificity: ratio(tn, tn + fp),
        }
    }

    /// Element-wise mean over several cases.
    pub fn mean(measures: &[Self]) -> Self {
        if measures.is_empty() {
            return Self::default();
        }
        let n = measures.len() as f64;
        let sum = measures.iter().fold(Self::default(), |acc, m| Self {
            dice: acc.dice + m.dice,
            precision: acc.precision + m.precision,
            sensitivity: acc.sensitivity + m.sensitivity,
            specificity: acc.specificity + m.specificity,
        });
        Self {
            dice: sum.dice / n,
            precision: sum.precision / n,
            sensitivity: sum.sensitivity / n,
            specificity: sum.specificity / n,
        }
    }
}
