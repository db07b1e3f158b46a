//! The training loop.

mod builder;
mod executor;
mod window;

pub use builder::TrainerBuilder;
pub use executor::{Phase, RunSummary, Trainer, TrainerParts};
pub use window::{LogWindow, WindowStats, should_log};
