pub mod checkpoint;
pub mod collective;
pub mod compute;
pub mod config;
pub mod context;
pub mod data;
pub mod error;
pub mod metrics;
pub mod state;
pub mod topology;
pub mod trainer;

pub use config::JobConfig;
pub use context::ProcessContext;
pub use error::{ConfigError, CorruptState, Result, TrainError};
pub use state::{TrainState, TrainStateRecord};
pub use topology::{Axis, ParallelDims, ParallelTopology};
pub use trainer::{RunSummary, Trainer, TrainerBuilder};
