pub mod dataset;
pub mod error;
pub mod models;
pub mod temporal;
pub mod training;

pub use error::TemporalError;
