use burn::{
    data::{
        dataloader::batcher::Batcher,
        dataset::{
            transform::{Mapper, MapperDataset},
            Dataset, InMemDataset,
        },
    },
    prelude::*,
    tensor::{
        backend::Backend,
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use walkdir::WalkDir;

use crate::error::TemporalError;
use crate::temporal::ClinicalTimeline;
use crate::training::LABEL_CHANNELS;

/// Values in front of the globals: depth, height, width, number of globals.
const HEADER_LEN: usize = 4;

/// Largest header value; every integer up to here is exact in `f32`.
const MAX_HEADER_VALUE: f32 = (1u32 << 24) as f32;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed record {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("invalid clinical timeline in {path}: {source}")]
    Timeline {
        path: PathBuf,
        #[source]
        source: TemporalError,
    },

    #[error("record {path} has spatial shape {actual:?}, the folder uses {expected:?}")]
    SpatialMismatch {
        path: PathBuf,
        expected: [usize; 3],
        actual: [usize; 3],
    },

    #[error("no records found under {0}")]
    Empty(PathBuf),
}

/// One sample as stored on disk: clinical globals followed by the three label volumes.
///
/// The file is a flat array of little-endian `f32`:
/// `[depth, height, width, n_globals, globals.., core.., lesion.., penumbra..]`.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct StrokeRecordRaw {
    pub spatial: [usize; 3],
    pub globals: Vec<f32>,
    pub label_values: Vec<f32>,
}

/// A header entry must be a non-negative integer that `f32` holds exactly.
fn header_value(value: f32) -> Option<usize> {
    (value.is_finite() && value >= 0.0 && value.fract() == 0.0 && value <= MAX_HEADER_VALUE)
        .then_some(value as usize)
}

impl StrokeRecordRaw {
    pub fn read_from(path: &Path) -> Result<Self, DatasetError> {
        let io_error = |source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        };
        let malformed = |reason: String| DatasetError::Malformed {
            path: path.to_path_buf(),
            reason,
        };

        let file = File::open(path).map_err(io_error)?;
        let num_bytes = file.metadata().map_err(io_error)?.len() as usize;
        if num_bytes % std::mem::size_of::<f32>() != 0 {
            return Err(malformed(format!("{num_bytes} bytes is not a whole number of f32")));
        }

        let mut words = vec![0u32; num_bytes / std::mem::size_of::<f32>()];
        BufReader::new(file)
            .read_exact(bytemuck::cast_slice_mut(&mut words))
            .map_err(io_error)?;
        let buffer: Vec<f32> = words
            .into_iter()
            .map(|word| f32::from_bits(u32::from_le(word)))
            .collect();

        if buffer.len() < HEADER_LEN {
            return Err(malformed("missing header".to_string()));
        }
        let mut header = [0usize; HEADER_LEN];
        for (slot, &value) in header.iter_mut().zip(&buffer[..HEADER_LEN]) {
            *slot = header_value(value)
                .ok_or_else(|| malformed(format!("invalid header value {value}")))?;
        }
        let spatial = [header[0], header[1], header[2]];
        let num_globals = header[3];
        let expected = spatial
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .filter(|&voxels| voxels > 0)
            .and_then(|voxels| voxels.checked_mul(LABEL_CHANNELS))
            .and_then(|labels| labels.checked_add(HEADER_LEN + num_globals));
        if expected != Some(buffer.len()) {
            return Err(malformed(format!(
                "{} values do not fit {spatial:?} with {num_globals} globals",
                buffer.len()
            )));
        }

        let label_start = HEADER_LEN + num_globals;
        Ok(Self {
            spatial,
            globals: buffer[HEADER_LEN..label_start].to_vec(),
            label_values: buffer[label_start..].to_vec(),
        })
    }

    pub fn write_to(&self, path: &Path) -> Result<(), DatasetError> {
        let io_error = |source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        };
        let [depth, height, width] = self.spatial;
        let mut values = Vec::with_capacity(HEADER_LEN + self.globals.len() + self.label_values.len());
        values.extend([depth as f32, height as f32, width as f32, self.globals.len() as f32]);
        values.extend_from_slice(&self.globals);
        values.extend_from_slice(&self.label_values);
        let words: Vec<u32> = values.iter().map(|v| v.to_bits().to_le()).collect();

        let mut writer = BufWriter::new(File::create(path).map_err(io_error)?);
        writer
            .write_all(bytemuck::cast_slice(&words))
            .and_then(|_| writer.flush())
            .map_err(io_error)
    }
}

/// A validated sample ready for batching.
#[derive(Clone, Debug)]
pub struct StrokeSequenceItem {
    /// `[3, depth, height, width]`: core, lesion, penumbra.
    pub labels: TensorData,
    /// The first `num_clinical` globals.
    pub clinical: Vec<f32>,
    pub timeline: ClinicalTimeline,
}

/// Raw record plus its already validated timeline.
#[derive(Clone, Debug)]
pub struct StrokeRecord {
    raw: StrokeRecordRaw,
    timeline: ClinicalTimeline,
}

impl StrokeRecord {
    /// Validates `raw` for a run with `sequence_length` steps and `num_clinical` channels.
    pub fn new(
        raw: StrokeRecordRaw,
        sequence_length: usize,
        num_clinical: usize,
        origin: &Path,
    ) -> Result<Self, DatasetError> {
        if raw.globals.len() < num_clinical.max(2) {
            return Err(DatasetError::Malformed {
                path: origin.to_path_buf(),
                reason: format!(
                    "{} globals, need at least {}",
                    raw.globals.len(),
                    num_clinical.max(2)
                ),
            });
        }
        let timeline = ClinicalTimeline::from_globals(&raw.globals, sequence_length).map_err(
            |source| DatasetError::Timeline {
                path: origin.to_path_buf(),
                source,
            },
        )?;
        Ok(Self { raw, timeline })
    }
}

struct RecordToItem {
    num_clinical: usize,
}

impl Mapper<StrokeRecord, StrokeSequenceItem> for RecordToItem {
    fn map(&self, item: &StrokeRecord) -> StrokeSequenceItem {
        let [depth, height, width] = item.raw.spatial;
        let labels = TensorData::new(
            item.raw.label_values.clone(),
            Shape::new([LABEL_CHANNELS, depth, height, width]),
        );
        StrokeSequenceItem {
            labels,
            clinical: item.raw.globals[..self.num_clinical].to_vec(),
            timeline: item.timeline,
        }
    }
}

type MappedDataset = MapperDataset<InMemDataset<StrokeRecord>, RecordToItem, StrokeRecord>;

pub struct StrokeDataset {
    dataset: MappedDataset,
}

impl StrokeDataset {
    pub fn from_records(records: Vec<StrokeRecord>, num_clinical: usize) -> Self {
        let dataset = MapperDataset::new(InMemDataset::new(records), RecordToItem { num_clinical });
        Self { dataset }
    }

    /// Loads every `.bin` record below `folder`. All records must share one spatial shape.
    pub fn load_folder(
        folder: &Path,
        sequence_length: usize,
        num_clinical: usize,
    ) -> Result<Vec<StrokeRecord>, DatasetError> {
        let mut paths: Vec<PathBuf> = WalkDir::new(folder)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file() && e.path().extension().unwrap_or_default() == "bin")
            .map(|e| e.into_path())
            .collect();
        paths.sort();
        if paths.is_empty() {
            return Err(DatasetError::Empty(folder.to_path_buf()));
        }

        let mut records: Vec<StrokeRecord> = Vec::with_capacity(paths.len());
        for path in &paths {
            let raw = StrokeRecordRaw::read_from(path)?;
            if let Some(first) = records.first() {
                if raw.spatial != first.raw.spatial {
                    return Err(DatasetError::SpatialMismatch {
                        path: path.clone(),
                        expected: first.raw.spatial,
                        actual: raw.spatial,
                    });
                }
            }
            records.push(StrokeRecord::new(raw, sequence_length, num_clinical, path)?);
        }
        tracing::debug!(records = records.len(), folder = %folder.display(), "read stroke records");
        Ok(records)
    }
}

impl Dataset<StrokeSequenceItem> for StrokeDataset {
    fn get(&self, index: usize) -> Option<StrokeSequenceItem> {
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

/// Shuffles `records` with `seed` and moves `valid_fraction` of them into a validation set.
///
/// Both halves keep at least one record whenever two or more are given.
pub fn split_train_valid<T>(
    mut records: Vec<T>,
    valid_fraction: f64,
    seed: u64,
) -> (Vec<T>, Vec<T>) {
    records.shuffle(&mut StdRng::seed_from_u64(seed));
    let total = records.len();
    let mut num_valid = (total as f64 * valid_fraction.clamp(0.0, 1.0)).round() as usize;
    if total >= 2 {
        num_valid = num_valid.clamp(1, total - 1);
    }
    let valid = records.split_off(total - num_valid.min(total));
    (records, valid)
}

#[derive(Clone, Debug)]
pub struct StrokeBatch<B: Backend> {
    /// `[batch, 3, depth, height, width]`.
    pub labels: Tensor<B, 5>,
    /// `[batch, clinical]`.
    pub clinical: Tensor<B, 2>,
    pub timelines: Vec<ClinicalTimeline>,
}

#[derive(Clone)]
pub struct StrokeBatcher<B: Backend> {
    device: B::Device,
    resize: Option<[usize; 2]>,
}

impl<B: Backend> StrokeBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device, resize: None }
    }

    /// Resamples every slice to `[height, width]` before batching.
    pub fn with_resize(mut self, size: [usize; 2]) -> Self {
        self.resize = Some(size);
        self
    }

    fn resample(&self, labels: Tensor<B, 4>) -> Tensor<B, 4> {
        match self.resize {
            Some(size) => {
                // Depth slices act as the batch of the 2D interpolation.
                let resized = interpolate(
                    labels.swap_dims(0, 1),
                    size,
                    InterpolateOptions::new(InterpolateMode::Bilinear),
                );
                resized.swap_dims(0, 1)
            }
            None => labels,
        }
    }
}

impl<B: Backend> Batcher<StrokeSequenceItem, StrokeBatch<B>> for StrokeBatcher<B> {
    fn batch(&self, items: Vec<StrokeSequenceItem>) -> StrokeBatch<B> {
        let labels = items
            .iter()
            .map(|item| {
                let labels = Tensor::<B, 4>::from_floats(item.labels.clone(), &self.device);
                self.resample(labels).unsqueeze()
            })
            .collect();

        let num_clinical = items.first().map_or(0, |item| item.clinical.len());
        let clinical: Vec<f32> = items.iter().flat_map(|item| item.clinical.clone()).collect();
        let clinical = Tensor::<B, 1>::from_floats(clinical.as_slice(), &self.device)
            .reshape([items.len(), num_clinical]);

        StrokeBatch {
            labels: Tensor::cat(labels, 0),
            clinical,
            timelines: items.iter().map(|item| item.timeline).collect(),
        }
    }
}
