//! The model side of a step: loss, gradients, the optimizer update and its schedule.

mod adam;
mod bigram;
mod scaler;
mod schedule;

use std::{error::Error, fmt};

pub use adam::Adam;
pub use bigram::BigramModel;
pub use scaler::GradScaler;
pub use schedule::LinearSchedule;

use crate::data::Batch;

/// Result of one forward/backward pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    /// Mean loss over the batch.
    pub loss: f64,
    /// True when the gradients were not finite and the optimizer update was skipped.
    pub skipped: bool,
}

/// Model, optimizer and gradient scaler of one process.
pub trait Compute: Send {
    /// Computes the loss of `batch`, backpropagates and applies the optimizer update unless
    /// the gradients are not finite.
    fn forward_backward(&mut self, batch: &Batch) -> Result<StepOutcome, ComputeError>;

    /// Advances the learning rate schedule by one step.
    fn schedule_step(&mut self);

    fn learning_rate(&self) -> f64;

    fn parameter_count(&self) -> usize;

    fn model_state(&self) -> Vec<u8>;

    fn optimizer_state(&self) -> Vec<u8>;

    /// Replaces model and optimizer state with previously exported bytes.
    fn load_state(&mut self, model: &[u8], optimizer: &[u8]) -> Result<(), ComputeError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ComputeError {
    TokenOutOfRange { token: u32, vocab_size: usize },
    ShapeMismatch { inputs: usize, labels: usize },
    StateSize { artifact: &'static str, found: usize, expected: usize },
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TokenOutOfRange { token, vocab_size } => {
                write!(f, "token {token} is outside the vocabulary of {vocab_size}")
            }
            Self::ShapeMismatch { inputs, labels } => {
                write!(f, "batch has {inputs} inputs but {labels} labels")
            }
            Self::StateSize {
                artifact,
                found,
                expected,
            } => write!(f, "{artifact} state holds {found} bytes, expected {expected}"),
        }
    }
}

impl Error for ComputeError {}
