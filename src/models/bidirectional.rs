use burn::{
    module::Module,
    nn::{Linear, LinearConfig},
    prelude::*,
    tensor::{activation, backend::Backend},
};

use super::grunet::{GruNet, GruNetConfig, GRUNET_BLOCKS};
use super::model_parts::{fold_depth, unfold_depth};
use crate::error::TemporalError;
use crate::temporal::{SequencePrediction, VolumeSequence};

/// Channels every step input carries besides the clinical planes:
/// start volume, end volume, previous prediction, factor.
const IMAGE_CHANNELS: usize = 4;

/// Something that unrolls a start and an end volume into two directional sequences.
pub trait SequencePredictor<B: Backend> {
    /// `start`/`end` are `[batch, 1, depth, height, width]`, `clinical` is
    /// `[batch, clinical]` and `factor` is `[batch, time]`.
    fn predict(
        &self,
        start: Tensor<B, 5>,
        end: Tensor<B, 5>,
        clinical: Tensor<B, 2>,
        factor: Tensor<B, 2>,
    ) -> Result<SequencePrediction<B>, TemporalError>;
}

/// Scores each forward step as the lesion frame from pooled hidden features.
#[derive(Module, Debug)]
pub struct LesionPositionHead<B: Backend> {
    linear: Linear<B>,
}

impl<B: Backend> LesionPositionHead<B> {
    /// `hidden` is the folded last-block state `[batch * depth, channels, h, w]`;
    /// returns `[batch, 1]` in (0, 1).
    pub fn forward(&self, hidden: Tensor<B, 4>, clinical: Tensor<B, 2>) -> Tensor<B, 2> {
        let [batch_size, _] = clinical.dims();
        let [folded, channels, _, _] = hidden.dims();
        let depth = folded / batch_size;

        let pooled: Tensor<B, 3> = hidden
            .mean_dim(3)
            .mean_dim(2)
            .reshape([batch_size, depth, channels]);
        let pooled: Tensor<B, 2> = pooled.mean_dim(1).reshape([batch_size, channels]);

        activation::sigmoid(self.linear.forward(Tensor::cat(vec![pooled, clinical], 1)))
    }
}

/// Two recurrent U-Nets unrolled in opposite time directions.
#[derive(Module, Debug)]
pub struct BidirectionalSequence<B: Backend> {
    forward_net: GruNet<B>,
    backward_net: GruNet<B>,
    lesion_head: Option<LesionPositionHead<B>>,
    sequence_length: usize,
    num_clinical: usize,
}

impl<B: Backend> BidirectionalSequence<B> {
    pub fn sequence_length(&self) -> usize {
        self.sequence_length
    }

    pub fn num_clinical(&self) -> usize {
        self.num_clinical
    }

    /// Stacks the per-step input `[batch, 4 + clinical, depth, height, width]`.
    fn step_input(
        start: &Tensor<B, 5>,
        end: &Tensor<B, 5>,
        previous: Tensor<B, 5>,
        factor: Tensor<B, 2>,
        clinical: &Tensor<B, 2>,
    ) -> Tensor<B, 5> {
        let [batch_size, _, depth, height, width] = start.dims();
        let [_, num_clinical] = clinical.dims();
        let device = start.device();

        let factor_plane = Tensor::<B, 5>::ones([batch_size, 1, depth, height, width], &device)
            * factor.reshape([batch_size, 1, 1, 1, 1]);
        let mut channels = vec![start.clone(), end.clone(), previous, factor_plane];
        if num_clinical > 0 {
            let clinical_planes =
                Tensor::<B, 5>::ones([batch_size, num_clinical, depth, height, width], &device)
                    * clinical.clone().reshape([batch_size, num_clinical, 1, 1, 1]);
            channels.push(clinical_planes);
        }
        Tensor::cat(channels, 1)
    }

    fn unroll(
        &self,
        net: &GruNet<B>,
        steps: impl Iterator<Item = usize>,
        initial: &Tensor<B, 5>,
        start: &Tensor<B, 5>,
        end: &Tensor<B, 5>,
        clinical: &Tensor<B, 2>,
        factor: &Tensor<B, 2>,
        mut on_step: impl FnMut(&Tensor<B, 4>),
    ) -> Vec<Tensor<B, 5>> {
        let [batch_size, _, depth, _, _] = start.dims();
        let mut hidden: Option<Vec<Tensor<B, 4>>> = None;
        let mut previous = initial.clone();
        let mut outputs = Vec::with_capacity(self.sequence_length);

        for t in steps {
            let factor_t = factor.clone().slice([0..batch_size, t..t + 1]);
            let input = Self::step_input(start, end, previous, factor_t, clinical);
            let (state, output) = net.forward(fold_depth(input), hidden);
            on_step(&state[GRUNET_BLOCKS - 1]);
            hidden = Some(state);

            previous = unfold_depth(output, depth);
            outputs.push(previous.clone());
        }
        outputs
    }
}

impl<B: Backend> SequencePredictor<B> for BidirectionalSequence<B> {
    fn predict(
        &self,
        start: Tensor<B, 5>,
        end: Tensor<B, 5>,
        clinical: Tensor<B, 2>,
        factor: Tensor<B, 2>,
    ) -> Result<SequencePrediction<B>, TemporalError> {
        let [batch_size, start_channels, depth, height, width] = start.dims();
        let expected = [batch_size, 1, depth, height, width];
        if start_channels != 1 {
            return Err(TemporalError::shape_mismatch("start volume", &expected, &start.dims()));
        }
        if end.dims() != expected {
            return Err(TemporalError::shape_mismatch("end volume", &expected, &end.dims()));
        }
        if clinical.dims() != [batch_size, self.num_clinical] {
            return Err(TemporalError::shape_mismatch(
                "clinical vector",
                &[batch_size, self.num_clinical],
                &clinical.dims(),
            ));
        }
        if factor.dims() != [batch_size, self.sequence_length] {
            return Err(TemporalError::shape_mismatch(
                "factor",
                &[batch_size, self.sequence_length],
                &factor.dims(),
            ));
        }

        let mut scores = Vec::with_capacity(self.sequence_length);
        let forward_steps = self.unroll(
            &self.forward_net,
            0..self.sequence_length,
            &start,
            &start,
            &end,
            &clinical,
            &factor,
            |hidden| {
                if let Some(head) = &self.lesion_head {
                    scores.push(head.forward(hidden.clone(), clinical.clone()));
                }
            },
        );

        let mut backward_steps = self.unroll(
            &self.backward_net,
            (0..self.sequence_length).rev(),
            &end,
            &start,
            &end,
            &clinical,
            &factor,
            |_| {},
        );
        backward_steps.reverse();

        let lesion_position = (!scores.is_empty()).then(|| Tensor::cat(scores, 1));

        Ok(SequencePrediction {
            forward: VolumeSequence::from_steps(forward_steps)?,
            backward: VolumeSequence::from_steps(backward_steps)?,
            lesion_position,
        })
    }
}

#[derive(Debug)]
pub struct BidirectionalSequenceConfig {
    hidden_channels: [usize; GRUNET_BLOCKS],
    kernel_size: usize,
    sequence_length: usize,
    num_clinical: usize,
    lesion_head: bool,
}

impl BidirectionalSequenceConfig {
    pub fn new(
        hidden_channels: [usize; GRUNET_BLOCKS],
        kernel_size: usize,
        sequence_length: usize,
        num_clinical: usize,
        lesion_head: bool,
    ) -> Self {
        Self {
            hidden_channels,
            kernel_size,
            sequence_length,
            num_clinical,
            lesion_head,
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> BidirectionalSequence<B> {
        let in_channels = IMAGE_CHANNELS + self.num_clinical;
        let net = GruNetConfig::new(in_channels, self.hidden_channels, self.kernel_size, 1);
        let lesion_head = self.lesion_head.then(|| LesionPositionHead {
            linear: LinearConfig::new(
                self.hidden_channels[GRUNET_BLOCKS - 1] + self.num_clinical,
                1,
            )
            .init(device),
        });

        BidirectionalSequence {
            forward_net: net.init(device),
            backward_net: net.init(device),
            lesion_head,
            sequence_length: self.sequence_length,
            num_clinical: self.num_clinical,
        }
    }
}
