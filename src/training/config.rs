use burn::{module::Ignored, optim::AdamConfig, prelude::*};

use super::loss::GrowthCriterion;
use super::model::GrowthModel;
use super::schedule::StepLrSchedulerConfig;
use crate::models::bidirectional::BidirectionalSequenceConfig;
use crate::models::grunet::GRUNET_BLOCKS;
use crate::temporal::CombinePolicy;

#[derive(Config, Debug)]
pub struct GrowthModelConfig {
    #[config(default = 11)]
    pub sequence_length: usize,
    #[config(default = 2)]
    pub num_clinical: usize,
    #[config(default = "[24, 28, 32, 28, 24]")]
    pub grunet_channels: [usize; GRUNET_BLOCKS],
    #[config(default = 3)]
    pub kernel_size: usize,
    #[config(default = true)]
    pub lesion_head: bool,
    #[config(default = "CombinePolicy::Uniform")]
    pub combine: CombinePolicy,
    /// Percent weights: core, lesion, penumbra, branch agreement, monotonicity.
    #[config(default = "[10.0, 44.0, 10.0, 25.0, 1.0]")]
    pub loss_weights: [f32; 5],
}

impl GrowthModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> GrowthModel<B> {
        let net = BidirectionalSequenceConfig::new(
            self.grunet_channels,
            self.kernel_size,
            self.sequence_length,
            self.num_clinical,
            self.lesion_head,
        )
        .init(device);

        GrowthModel {
            net,
            policy: Ignored(self.combine),
            criterion: Ignored(GrowthCriterion::new(self.loss_weights)),
        }
    }
}

#[derive(Config)]
pub struct TrainingConfig {
    pub model: GrowthModelConfig,
    pub optimizer: AdamConfig,
    #[config(default = 200)]
    pub num_epochs: usize,
    #[config(default = 2)]
    pub batch_size: usize,
    #[config(default = 1)]
    pub num_workers: usize,
    #[config(default = 4)]
    pub seed: u64,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
    /// Epochs between two learning rate decays.
    #[config(default = 75)]
    pub lr_step_epochs: usize,
    #[config(default = 0.1)]
    pub lr_gamma: f64,
    #[config(default = 0.275)]
    pub valid_fraction: f64,
    /// In-plane `[height, width]` every slice is resampled to, if set.
    pub resize: Option<[usize; 2]>,
}

impl TrainingConfig {
    /// Step decay for a training set of `train_len` cases; the learner steps it once per batch.
    pub fn lr_scheduler(&self, train_len: usize) -> StepLrSchedulerConfig {
        let iterations_per_epoch = train_len.div_ceil(self.batch_size.max(1)).max(1);
        StepLrSchedulerConfig::new(
            self.learning_rate,
            iterations_per_epoch.saturating_mul(self.lr_step_epochs),
        )
        .with_gamma(self.lr_gamma)
    }
}
