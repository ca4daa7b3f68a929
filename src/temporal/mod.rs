//! Temporal interpolation between a core and a penumbra volume.
//!
//! A bidirectional predictor yields a forward (core → penumbra) and a backward
//! (penumbra → core) sequence. This module fuses the two under a
//! [`CombinePolicy`], reads sequences at per-sample fractional time indices
//! and scores monotonic growth. Everything here is a pure function of its
//! inputs.

mod combine;
mod factor;
mod gather;
mod penalty;
mod position;
mod sequence;
mod step;

pub use combine::{combine, CombinePolicy};
pub use factor::{build_factor, factor_schedule};
pub use gather::gather;
pub use penalty::temporal_penalty;
pub use position::estimate_position;
pub use sequence::{ClinicalTimeline, FractionalIndex, VolumeSequence};
pub use step::{SequencePrediction, TemporalStep};

pub(crate) use sequence::host_values;
