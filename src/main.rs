use std::path::{Path, PathBuf};

use anyhow::Context;
use burn::{optim::AdamConfig, tensor::backend::AutodiffBackend};
use clap::Parser;
use tracing_subscriber::FmtSubscriber;

use lesion_growth::{
    dataset::{
        data::{split_train_valid, StrokeBatcher, StrokeDataset, StrokeRecord},
        toy::ToyGrowth,
    },
    temporal::CombinePolicy,
    training::{evaluate_trained, train, GrowthModelConfig, TrainingConfig},
};

#[cfg(feature = "ndarray")]
use burn::backend::ndarray::{NdArray, NdArrayDevice};
#[cfg(feature = "torch")]
use burn::backend::libtorch::{LibTorch, LibTorchDevice};
#[cfg(feature = "wgpu")]
use burn::backend::wgpu::{Wgpu, WgpuDevice};
#[allow(unused_imports)]
use burn::backend::Autodiff;

#[derive(Parser, Debug)]
#[command(name = "lesion-growth")]
#[command(about = "Train a bidirectional lesion growth interpolator")]
struct Args {
    /// Directory for checkpoints, config and final model.
    #[arg(long, default_value = "artifacts/lesion-growth")]
    artifact_dir: PathBuf,

    /// Folder of `.bin` stroke records. Synthetic growth cases are used when absent.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Also write the synthetic cases as `.bin` records into this folder.
    #[arg(long)]
    export_toy: Option<PathBuf>,

    #[arg(long, default_value_t = 11)]
    sequence_length: usize,

    #[arg(long, default_value_t = 2)]
    batch_size: usize,

    /// Clinical globals fed to the predictor as constant planes.
    #[arg(long, default_value_t = 2)]
    clinical: usize,

    /// Hidden channels of the five recurrent U-Net blocks.
    #[arg(long, value_delimiter = ',', default_value = "24,28,32,28,24")]
    grunet_channels: Vec<usize>,

    #[arg(long, value_enum, default_value_t = CombinePolicy::Uniform)]
    combine: CombinePolicy,

    /// Percent weights: core, lesion, penumbra, agreement, monotonicity.
    #[arg(long, value_delimiter = ',', default_value = "10,44,10,25,1")]
    loss_weights: Vec<f32>,

    #[arg(long, default_value_t = 200)]
    epochs: usize,

    #[arg(long, default_value_t = 0.275)]
    valid_fraction: f64,

    #[arg(long, default_value_t = 4)]
    seed: u64,

    #[arg(long, default_value_t = 1.0e-3)]
    learning_rate: f64,

    /// Epochs between two learning rate decays.
    #[arg(long, default_value_t = 75)]
    lr_step_epochs: usize,

    /// Factor applied to the learning rate at every decay.
    #[arg(long, default_value_t = 0.1)]
    lr_gamma: f64,

    /// Train without the learned lesion position head.
    #[arg(long)]
    no_lesion_head: bool,

    /// Resample slices to HEIGHT,WIDTH before batching.
    #[arg(long, value_delimiter = ',')]
    resize: Option<Vec<usize>>,

    #[arg(long, default_value_t = 16)]
    toy_samples: usize,

    /// Synthetic volume size as DEPTH,HEIGHT,WIDTH.
    #[arg(long, value_delimiter = ',', default_value = "4,32,32")]
    toy_size: Vec<usize>,
}

impl Args {
    fn training_config(&self) -> anyhow::Result<TrainingConfig> {
        let grunet_channels: [usize; 5] = self
            .grunet_channels
            .as_slice()
            .try_into()
            .context("--grunet-channels needs exactly 5 values")?;
        let loss_weights: [f32; 5] = self
            .loss_weights
            .as_slice()
            .try_into()
            .context("--loss-weights needs exactly 5 values")?;
        let resize = match &self.resize {
            Some(size) => Some(
                <[usize; 2]>::try_from(size.as_slice())
                    .context("--resize needs HEIGHT,WIDTH")?,
            ),
            None => None,
        };

        let model = GrowthModelConfig::new()
            .with_sequence_length(self.sequence_length)
            .with_num_clinical(self.clinical)
            .with_grunet_channels(grunet_channels)
            .with_lesion_head(!self.no_lesion_head)
            .with_combine(self.combine)
            .with_loss_weights(loss_weights);

        Ok(TrainingConfig::new(model, AdamConfig::new())
            .with_num_epochs(self.epochs)
            .with_batch_size(self.batch_size)
            .with_seed(self.seed)
            .with_learning_rate(self.learning_rate)
            .with_lr_step_epochs(self.lr_step_epochs)
            .with_lr_gamma(self.lr_gamma)
            .with_valid_fraction(self.valid_fraction)
            .with_resize(resize))
    }

    fn load_records(&self) -> anyhow::Result<Vec<StrokeRecord>> {
        if let Some(data_dir) = &self.data_dir {
            let records = StrokeDataset::load_folder(data_dir, self.sequence_length, self.clinical)?;
            tracing::info!(records = records.len(), data_dir = %data_dir.display(), "loaded stroke records");
            return Ok(records);
        }

        let spatial: [usize; 3] = self
            .toy_size
            .as_slice()
            .try_into()
            .context("--toy-size needs DEPTH,HEIGHT,WIDTH")?;
        let toy = ToyGrowth {
            samples: self.toy_samples,
            spatial,
            sequence_length: self.sequence_length,
            num_globals: self.clinical.max(2),
            seed: self.seed,
        };
        let origin = Path::new("synthetic");
        let raw = toy.generate();
        if let Some(dir) = &self.export_toy {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
            for (i, record) in raw.iter().enumerate() {
                record.write_to(&dir.join(format!("toy_{i:04}.bin")))?;
            }
            tracing::info!(dir = %dir.display(), "exported synthetic records");
        }
        tracing::info!(records = raw.len(), ?spatial, "generated synthetic growth cases");

        raw.into_iter()
            .map(|raw| StrokeRecord::new(raw, self.sequence_length, self.clinical, origin))
            .collect::<Result<_, _>>()
            .map_err(Into::into)
    }
}

fn run<B: AutodiffBackend>(args: &Args, device: B::Device) -> anyhow::Result<()> {
    let config = args.training_config()?;
    let (train_records, valid_records) =
        split_train_valid(args.load_records()?, config.valid_fraction, config.seed);
    anyhow::ensure!(
        !train_records.is_empty() && !valid_records.is_empty(),
        "need at least two records to split into training and validation"
    );

    let num_clinical = config.model.num_clinical;
    let model = train::<B>(
        &args.artifact_dir,
        &config,
        StrokeDataset::from_records(train_records, num_clinical),
        StrokeDataset::from_records(valid_records.clone(), num_clinical),
        device.clone(),
    )?;

    let mut batcher = StrokeBatcher::<B::InnerBackend>::new(device);
    if let Some(size) = config.resize {
        batcher = batcher.with_resize(size);
    }
    evaluate_trained(
        &model,
        StrokeDataset::from_records(valid_records, num_clinical),
        batcher,
    )?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default tracing subscriber")?;

    let args = Args::parse();

    #[cfg(feature = "wgpu")]
    {
        type MyBackend = Autodiff<Wgpu<f32, i32>>;
        return run::<MyBackend>(&args, WgpuDevice::BestAvailable);
    }
    #[cfg(all(feature = "torch", not(feature = "wgpu")))]
    {
        type MyBackend = Autodiff<LibTorch>;
        return run::<MyBackend>(&args, LibTorchDevice::Cpu);
    }
    #[cfg(all(feature = "ndarray", not(any(feature = "wgpu", feature = "torch"))))]
    {
        type MyBackend = Autodiff<NdArray>;
        return run::<MyBackend>(&args, NdArrayDevice::default());
    }
    #[allow(unreachable_code)]
    {
        let _ = args;
        anyhow::bail!("no backend feature enabled, build with `ndarray`, `wgpu` or `torch`")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_arguments_build_the_default_config() {
        let args = Args::parse_from(["lesion-growth"]);
        let config = args.training_config().unwrap();

        assert_eq!(config.model.grunet_channels, [24, 28, 32, 28, 24]);
        assert_eq!(config.model.loss_weights, [10.0, 44.0, 10.0, 25.0, 1.0]);
        assert_eq!(config.model.combine, CombinePolicy::Uniform);
        assert!(config.model.lesion_head);
        assert!(config.resize.is_none());
        assert_eq!(config.lr_step_epochs, 75);
        assert_eq!(config.lr_gamma, 0.1);
    }

    #[test]
    fn test_policy_alias_and_lists() {
        let args = Args::parse_from([
            "lesion-growth",
            "--combine",
            "add",
            "--grunet-channels",
            "2,3,4,3,2",
            "--resize",
            "64,48",
            "--no-lesion-head",
        ]);
        let config = args.training_config().unwrap();

        assert_eq!(config.model.combine, CombinePolicy::Uniform);
        assert_eq!(config.model.grunet_channels, [2, 3, 4, 3, 2]);
        assert_eq!(config.resize, Some([64, 48]));
        assert!(!config.model.lesion_head);
    }

    #[test]
    fn test_synthetic_records_split() {
        let args = Args::parse_from(["lesion-growth", "--toy-samples", "8", "--toy-size", "2,8,8"]);
        let records = args.load_records().unwrap();
        let (train, valid) = split_train_valid(records, 0.275, 4);

        assert_eq!((train.len(), valid.len()), (6, 2));
    }
}
