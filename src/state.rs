use std::{error::Error, fmt};

use serde::{Deserialize, Serialize};

use crate::error::CorruptState;

/// Format version of [`TrainStateRecord`].
pub const TRAIN_STATE_VERSION: u32 = 1;

/// Misuse of the once-per-step advance protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    StaleStep { expected: u64, found: u64 },
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StaleStep { expected, found } => write!(
                f,
                "attempted to complete step {found} while step {expected} is the next one"
            ),
        }
    }
}

impl Error for StateError {}

/// Permission to complete exactly one step.
///
/// Obtained from [`TrainState::begin_step`] and consumed by [`TrainState::advance`], so the same
/// logical step can never be advanced twice.
#[derive(Debug)]
#[must_use = "a pending step does nothing until it is passed to `TrainState::advance`"]
pub struct PendingStep {
    step: u64,
}

impl PendingStep {
    /// The step this token completes.
    pub fn step(&self) -> u64 {
        self.step
    }
}

/// Training progress: the step count and the loss of every completed step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainState {
    step: u64,
    current_loss: Option<f64>,
    losses: Vec<f64>,
}

impl TrainState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn current_loss(&self) -> Option<f64> {
        self.current_loss
    }

    pub fn losses(&self) -> &[f64] {
        &self.losses
    }

    pub fn begin_step(&self) -> PendingStep {
        PendingStep {
            step: self.step + 1,
        }
    }

    /// Completes the pending step with its loss.
    ///
    /// # Returns
    /// The new step count, or `StaleStep` if the token was issued before another advance or a
    /// restore.
    pub fn advance(&mut self, pending: PendingStep, loss: f64) -> Result<u64, StateError> {
        let expected = self.step + 1;
        if pending.step != expected {
            return Err(StateError::StaleStep {
                expected,
                found: pending.step,
            });
        }

        self.step = expected;
        self.current_loss = Some(loss);
        self.losses.push(loss);
        Ok(self.step)
    }

    pub fn snapshot(&self) -> TrainStateRecord {
        TrainStateRecord {
            version: TRAIN_STATE_VERSION,
            step: self.step,
            current_loss: self.current_loss,
            losses: self.losses.clone(),
        }
    }

    /// Replaces the whole state with `record`.
    ///
    /// # Returns
    /// A `CorruptState` error if the record is from another format version or its step, loss
    /// history and current loss disagree. The state is left untouched in that case.
    pub fn restore(&mut self, record: TrainStateRecord) -> Result<(), CorruptState> {
        record.validate()?;

        self.step = record.step;
        self.current_loss = record.current_loss;
        self.losses = record.losses;
        Ok(())
    }
}

/// Persisted form of [`TrainState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainStateRecord {
    pub version: u32,
    pub step: u64,
    #[serde(with = "float_repr::option")]
    pub current_loss: Option<f64>,
    #[serde(with = "float_repr")]
    pub losses: Vec<f64>,
}

impl TrainStateRecord {
    pub fn validate(&self) -> Result<(), CorruptState> {
        if self.version != TRAIN_STATE_VERSION {
            return Err(CorruptState::VersionMismatch {
                artifact: "train_state",
                found: self.version,
                expected: TRAIN_STATE_VERSION,
            });
        }

        if self.losses.len() as u64 != self.step {
            return Err(CorruptState::StepLossMismatch {
                step: self.step,
                losses: self.losses.len(),
            });
        }

        let last = self.losses.last().map(|l| l.to_bits());
        if self.current_loss.map(f64::to_bits) != last {
            return Err(CorruptState::CurrentLossMismatch { step: self.step });
        }

        Ok(())
    }
}

/// JSON has no representation for non-finite floats, so those are written as strings.
mod float_repr {
    use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(f64),
        Text(String),
    }

    impl From<f64> for Repr {
        fn from(value: f64) -> Self {
            if value.is_finite() {
                Self::Num(value)
            } else {
                Self::Text(value.to_string())
            }
        }
    }

    impl Repr {
        fn into_f64<E: de::Error>(self) -> Result<f64, E> {
            match self {
                Self::Num(v) => Ok(v),
                Self::Text(s) => s
                    .parse()
                    .map_err(|_| E::custom(format!("`{s}` is not a float"))),
            }
        }
    }

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(values.iter().map(|&v| Repr::from(v)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        Vec::<Repr>::deserialize(deserializer)?
            .into_iter()
            .map(Repr::into_f64)
            .collect()
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<f64>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            value.map(Repr::from).serialize(serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<f64>, D::Error> {
            Option::<Repr>::deserialize(deserializer)?
                .map(Repr::into_f64)
                .transpose()
        }
    }
}
