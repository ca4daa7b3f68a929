use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
    },
    prelude::*,
    tensor::{
        activation,
        backend::Backend,
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};

use super::model_parts::*;

/// Number of recurrent blocks: two encoder, bottleneck, two decoder.
pub const GRUNET_BLOCKS: usize = 5;

/// Recurrent U-Net: every stage is a [`ConvGruCell`] carrying its own hidden state.
#[derive(Module, Debug)]
pub struct GruNet<B: Backend> {
    blocks: Vec<ConvGruCell<B>>,
    output: Conv2d<B>,
    max_pool: MaxPool2d,
}

impl<B: Backend> GruNet<B> {
    /// Runs one time step on `[batch, channels, height, width]`.
    ///
    /// Returns the updated hidden state of each block and the sigmoid output.
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        hidden: Option<Vec<Tensor<B, 4>>>,
    ) -> (Vec<Tensor<B, 4>>, Tensor<B, 4>) {
        let mut hidden: Vec<Option<Tensor<B, 4>>> = hidden
            .unwrap_or_default()
            .into_iter()
            .map(Some)
            .chain(std::iter::repeat(None))
            .take(GRUNET_BLOCKS)
            .collect();
        let mut updated = Vec::with_capacity(GRUNET_BLOCKS);
        let mut skips = Vec::with_capacity(2);

        // Encoder
        let mut input = x;
        for i in 0..2 {
            let (state, output) = self.blocks[i].forward(input, hidden[i].take());
            updated.push(state);
            input = self.max_pool.forward(output.clone());
            skips.push(output);
        }

        // Bottleneck
        let (state, mut output) = self.blocks[2].forward(input, hidden[2].take());
        updated.push(state);

        // Decoder
        for (i, skip) in (3..GRUNET_BLOCKS).zip(skips.into_iter().rev()) {
            let [_, _, height, width] = skip.dims();
            let upsampled = interpolate(
                output,
                [height, width],
                InterpolateOptions::new(InterpolateMode::Nearest),
            );
            let (state, block_output) = self.blocks[i]
                .forward(Tensor::cat(vec![upsampled, skip], 1), hidden[i].take());
            updated.push(state);
            output = block_output;
        }

        (updated, activation::sigmoid(self.output.forward(output)))
    }

    /// Hidden channels of the last decoder block.
    pub fn last_hidden_channels(&self) -> usize {
        self.blocks[GRUNET_BLOCKS - 1].hidden_channels()
    }
}

#[derive(Debug)]
pub struct GruNetConfig {
    in_channels: usize,
    hidden_channels: [usize; GRUNET_BLOCKS],
    kernel_size: usize,
    out_channels: usize,
}

impl GruNetConfig {
    pub fn new(
        in_channels: usize,
        hidden_channels: [usize; GRUNET_BLOCKS],
        kernel_size: usize,
        out_channels: usize,
    ) -> Self {
        Self { in_channels, hidden_channels, kernel_size, out_channels }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> GruNet<B> {
        let [h0, h1, h2, h3, h4] = self.hidden_channels;
        let k = self.kernel_size;
        let blocks = vec![
            ConvGruCellConfig::new(self.in_channels, h0, k).init(device),
            ConvGruCellConfig::new(h0, h1, k).init(device),
            ConvGruCellConfig::new(h1, h2, k).init(device),
            ConvGruCellConfig::new(h2 + h1, h3, k).init(device),
            ConvGruCellConfig::new(h3 + h0, h4, k).init(device),
        ];

        let output = Conv2dConfig::new([h4, self.out_channels], [1, 1])
            .with_stride([1, 1])
            .init(device);

        let max_pool = MaxPool2dConfig::new([2, 2])
            .with_strides([2, 2])
            .init();

        GruNet { blocks, output, max_pool }
    }
}
