use burn::{
    module::{Module, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Initializer, PaddingConfig2d,
    },
    prelude::*,
    tensor::{activation, backend::Backend, Distribution},
};

use crate::temporal::host_values;

/// Convolutional GRU cell followed by a plain convolution, as in a recurrent U-Net block.
#[derive(Module, Debug)]
pub struct ConvGruCell<B: Backend> {
    reset_gate: Conv2d<B>,
    update_gate: Conv2d<B>,
    out_gate: Conv2d<B>,
    conv: Conv2d<B>,
    hidden_channels: usize,
}

impl<B: Backend> ConvGruCell<B> {
    /// Returns `(new_state, output)`. A missing state starts from zeros.
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
        state: Option<Tensor<B, 4>>,
    ) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let [batch_size, _, height, width] = input.dims();
        let state = state.unwrap_or_else(|| {
            Tensor::zeros(
                [batch_size, self.hidden_channels, height, width],
                &input.device(),
            )
        });

        let stacked = Tensor::cat(vec![input.clone(), state.clone()], 1);
        let update = activation::sigmoid(self.update_gate.forward(stacked.clone()));
        let reset = activation::sigmoid(self.reset_gate.forward(stacked));
        let candidate = self
            .out_gate
            .forward(Tensor::cat(vec![input, state.clone() * reset], 1))
            .tanh();
        let new_state = state * update.clone().neg().add_scalar(1.0) + candidate * update;

        let output = self.conv.forward(new_state.clone());
        (new_state, output)
    }

    pub fn hidden_channels(&self) -> usize {
        self.hidden_channels
    }
}

#[derive(Debug)]
pub struct ConvGruCellConfig {
    in_channels: usize,
    hidden_channels: usize,
    kernel_size: usize,
}

impl ConvGruCellConfig {
    pub fn new(in_channels: usize, hidden_channels: usize, kernel_size: usize) -> Self {
        Self { in_channels, hidden_channels, kernel_size }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvGruCell<B> {
        let padding = self.kernel_size / 2;
        // Gates: orthogonal kernels, zero bias.
        let gate = || {
            let mut gate = Conv2dConfig::new(
                [self.in_channels + self.hidden_channels, self.hidden_channels],
                [self.kernel_size, self.kernel_size],
            )
            .with_stride([1, 1])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_initializer(Initializer::Zeros)
            .init(device);
            gate.weight = Param::from_tensor(orthogonal(gate.weight.dims(), device));
            gate
        };
        let reset_gate = gate();
        let update_gate = gate();
        let out_gate = gate();
        let conv = Conv2dConfig::new(
            [self.hidden_channels, self.hidden_channels],
            [self.kernel_size, self.kernel_size],
        )
        .with_stride([1, 1])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_initializer(Initializer::XavierNormal { gain: 1.0 })
        .init(device);

        ConvGruCell {
            reset_gate,
            update_gate,
            out_gate,
            conv,
            hidden_channels: self.hidden_channels,
        }
    }
}

/// Random kernel whose `[out, in * k * k]` matrix has orthonormal rows, or
/// orthonormal columns when there are more outputs than inputs.
fn orthogonal<B: Backend>(shape: [usize; 4], device: &B::Device) -> Tensor<B, 4> {
    let rows = shape[0];
    let cols = shape[1] * shape[2] * shape[3];
    let wide = rows < cols;
    // Gram-Schmidt runs over the `m` columns of a tall `n x m` matrix.
    let (n, m) = if wide { (cols, rows) } else { (rows, cols) };
    let sample = Tensor::<B, 2>::random([m, n], Distribution::Normal(0.0, 1.0), device);
    let mut basis: Vec<Vec<f32>> = host_values(sample).chunks(n).map(<[f32]>::to_vec).collect();

    for j in 0..m {
        let (done, rest) = basis.split_at_mut(j);
        let column = &mut rest[0];
        for previous in done.iter() {
            let projection: f32 = previous.iter().zip(column.iter()).map(|(a, b)| a * b).sum();
            for (c, p) in column.iter_mut().zip(previous) {
                *c -= projection * p;
            }
        }
        let norm = column.iter().map(|c| c * c).sum::<f32>().sqrt().max(f32::EPSILON);
        column.iter_mut().for_each(|c| *c /= norm);
    }

    // `basis[j]` is column j of the tall matrix.
    let mut matrix = vec![0.0f32; rows * cols];
    for (j, column) in basis.iter().enumerate() {
        for (i, &value) in column.iter().enumerate() {
            let (row, col) = if wide { (j, i) } else { (i, j) };
            matrix[row * cols + col] = value;
        }
    }
    Tensor::<B, 1>::from_floats(matrix.as_slice(), device).reshape(shape)
}

/// Folds the depth axis of `[batch, channels, depth, height, width]` into the
/// batch so 2D layers run slice by slice.
pub fn fold_depth<B: Backend>(volume: Tensor<B, 5>) -> Tensor<B, 4> {
    let [batch_size, channels, depth, height, width] = volume.dims();
    volume
        .swap_dims(1, 2)
        .reshape([batch_size * depth, channels, height, width])
}

/// Inverse of [`fold_depth`].
pub fn unfold_depth<B: Backend>(slices: Tensor<B, 4>, depth: usize) -> Tensor<B, 5> {
    let [folded, channels, height, width] = slices.dims();
    slices
        .reshape([folded / depth, depth, channels, height, width])
        .swap_dims(1, 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::{NdArray, NdArrayDevice};
    use burn::tensor::{Distribution, Shape};

    type TestBackend = NdArray;

    #[test]
    fn test_cell_keeps_spatial_size() {
        let device = NdArrayDevice::default();
        let cell: ConvGruCell<TestBackend> = ConvGruCellConfig::new(3, 5, 3).init(&device);
        let input = Tensor::random(Shape::new([2, 3, 8, 6]), Distribution::Default, &device);

        let (state, output) = cell.forward(input.clone(), None);
        assert_eq!(state.dims(), [2, 5, 8, 6]);
        assert_eq!(output.dims(), [2, 5, 8, 6]);

        let (state, _) = cell.forward(input, Some(state));
        assert_eq!(state.dims(), [2, 5, 8, 6]);
    }

    #[test]
    fn test_gates_start_orthogonal_with_zero_bias() {
        let device = NdArrayDevice::default();
        let cell: ConvGruCell<TestBackend> = ConvGruCellConfig::new(3, 4, 3).init(&device);

        // Four outputs over 63 inputs: the rows are orthonormal.
        let weight = cell.reset_gate.weight.val().reshape([4, 63]);
        let gram = host_values(weight.clone().matmul(weight.transpose()));
        for i in 0..4 {
            for j in 0..4 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((gram[i * 4 + j] - expected).abs() < 1e-4, "gram[{i}][{j}] = {}", gram[i * 4 + j]);
            }
        }

        let bias = cell.update_gate.bias.as_ref().unwrap().val();
        assert!(host_values(bias).iter().all(|&b| b == 0.0));
    }

    #[test]
    fn test_tall_kernels_have_orthonormal_columns() {
        let device = NdArrayDevice::default();
        let weight = orthogonal::<TestBackend>([6, 2, 1, 1], &device).reshape([6, 2]);

        let gram = host_values(weight.clone().transpose().matmul(weight));

        assert!((gram[0] - 1.0).abs() < 1e-5);
        assert!(gram[1].abs() < 1e-5);
        assert!((gram[3] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_state_stays_bounded() {
        let device = NdArrayDevice::default();
        let cell: ConvGruCell<TestBackend> = ConvGruCellConfig::new(1, 2, 3).init(&device);
        let input = Tensor::random(Shape::new([1, 1, 4, 4]), Distribution::Default, &device);

        let mut state = None;
        for _ in 0..4 {
            let (next, _) = cell.forward(input.clone(), state);
            state = Some(next);
        }
        let values: Vec<f32> = state.unwrap().into_data().iter::<f32>().collect();
        assert!(values.iter().all(|v| v.abs() <= 1.0));
    }

    #[test]
    fn test_fold_round_trip() {
        let device = NdArrayDevice::default();
        let volume: Tensor<TestBackend, 5> =
            Tensor::random(Shape::new([2, 3, 4, 5, 6]), Distribution::Default, &device);

        let slices = fold_depth(volume.clone());
        assert_eq!(slices.dims(), [8, 3, 5, 6]);

        let restored = unfold_depth(slices, 4);
        restored.into_data().assert_eq(&volume.into_data(), true);
    }
}
