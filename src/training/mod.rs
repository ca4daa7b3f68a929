//! Learner plumbing around the temporal core: the growth model, its
//! criterion, configuration and evaluation.

pub mod config;
pub mod learner;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod schedule;

pub use config::{GrowthModelConfig, TrainingConfig};
pub use learner::{evaluate, evaluate_trained, train};
pub use loss::{DiceLoss, GrowthCriterion, GrowthLoss, LABEL_CHANNELS};
pub use metrics::BinaryMeasures;
pub use model::{GrowthModel, GrowthOutput};
pub use schedule::{StepLrScheduler, StepLrSchedulerConfig};
