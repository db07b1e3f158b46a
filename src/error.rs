use std::{error::Error, fmt, io, path::PathBuf};

use crate::{
    checkpoint::CheckpointError,
    collective::CollectiveError,
    compute::ComputeError,
    data::DataError,
    state::StateError,
    topology::Axis,
};

/// The trainer's result type.
pub type Result<T> = std::result::Result<T, TrainError>;

/// Invalid configuration, always detected before the first step runs.
#[derive(Debug)]
pub enum ConfigError {
    InvalidDegree {
        axis: Axis,
        degree: usize,
    },
    WorldSizeMismatch {
        data: usize,
        sequence: usize,
        pipeline: usize,
        world_size: usize,
    },
    RankOutOfRange {
        rank: usize,
        world_size: usize,
    },
    GroupMismatch {
        what: &'static str,
        group: usize,
        topology: usize,
    },
    InvalidValue {
        field: &'static str,
        reason: String,
    },
    Env {
        var: &'static str,
        reason: String,
    },
    Read {
        path: PathBuf,
        source: io::Error,
    },
    Parse(serde_json::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidDegree { axis, degree } => {
                write!(f, "{axis} parallel degree must be at least 1, got {degree}")
            }
            Self::WorldSizeMismatch {
                data,
                sequence,
                pipeline,
                world_size,
            } => {
                let product = data
                    .checked_mul(*sequence)
                    .and_then(|p| p.checked_mul(*pipeline));
                write!(
                    f,
                    "parallel degrees data={data} x sequence={sequence} x pipeline={pipeline} = "
                )?;
                match product {
                    Some(product) => write!(f, "{product}")?,
                    None => f.write_str("overflow")?,
                }
                write!(f, " does not match world size {world_size}")
            }
            Self::RankOutOfRange { rank, world_size } => {
                write!(f, "rank {rank} is out of range for world size {world_size}")
            }
            Self::GroupMismatch {
                what,
                group,
                topology,
            } => write!(
                f,
                "process group {what} ({group}) does not match the topology ({topology})"
            ),
            Self::InvalidValue { field, reason } => write!(f, "invalid `{field}`: {reason}"),
            Self::Env { var, reason } => write!(f, "environment variable {var}: {reason}"),
            Self::Read { path, source } => {
                write!(f, "cannot read config '{}': {source}", path.display())
            }
            Self::Parse(e) => write!(f, "invalid config: {e}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Read { source, .. } => Some(source),
            Self::Parse(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

/// Persisted state that exists but cannot be trusted.
#[derive(Debug)]
pub enum CorruptState {
    StepLossMismatch {
        step: u64,
        losses: usize,
    },
    CurrentLossMismatch {
        step: u64,
    },
    VersionMismatch {
        artifact: &'static str,
        found: u32,
        expected: u32,
    },
    StepMismatch {
        artifact: &'static str,
        found: u64,
        expected: u64,
    },
    LengthMismatch {
        artifact: &'static str,
        found: u64,
        expected: u64,
    },
    MissingEntry {
        step: u64,
        rank: usize,
    },
    Decode {
        artifact: &'static str,
        reason: String,
    },
    DivergentStep {
        min: u64,
        max: u64,
    },
}

impl fmt::Display for CorruptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StepLossMismatch { step, losses } => write!(
                f,
                "train state claims step {step} but holds {losses} losses"
            ),
            Self::CurrentLossMismatch { step } => write!(
                f,
                "train state at step {step} has a current loss that is not its last loss"
            ),
            Self::VersionMismatch {
                artifact,
                found,
                expected,
            } => write!(
                f,
                "{artifact} has format version {found}, this build reads version {expected}"
            ),
            Self::StepMismatch {
                artifact,
                found,
                expected,
            } => write!(f, "{artifact} is tagged with step {found}, expected {expected}"),
            Self::LengthMismatch {
                artifact,
                found,
                expected,
            } => write!(f, "{artifact} holds {found} bytes, manifest declares {expected}"),
            Self::MissingEntry { step, rank } => {
                write!(f, "checkpoint at step {step} has no complete entry for rank {rank}")
            }
            Self::Decode { artifact, reason } => write!(f, "cannot decode {artifact}: {reason}"),
            Self::DivergentStep { min, max } => write!(
                f,
                "processes disagree on the restored step: min {min}, max {max}"
            ),
        }
    }
}

impl Error for CorruptState {}

/// Every failure the training orchestration can surface.
#[derive(Debug)]
pub enum TrainError {
    Config(ConfigError),
    CorruptState(CorruptState),
    State(StateError),
    Checkpoint(CheckpointError),
    Collective(CollectiveError),
    Compute { step: u64, source: ComputeError },
    Data { step: u64, source: DataError },
    Io(io::Error),
}

impl TrainError {
    /// Returns true when the failure came from the collective transport itself, in which case
    /// announcing an abort over that same transport is pointless.
    pub fn is_collective(&self) -> bool {
        matches!(self, Self::Collective(_))
    }
}

impl fmt::Display for TrainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "configuration error: {e}"),
            Self::CorruptState(e) => write!(f, "corrupt state: {e}"),
            Self::State(e) => write!(f, "train state error: {e}"),
            Self::Checkpoint(e) => write!(f, "checkpoint error: {e}"),
            Self::Collective(e) => write!(f, "collective error: {e}"),
            Self::Compute { step, source } => write!(f, "compute failed at step {step}: {source}"),
            Self::Data { step, source } => write!(f, "batch fetch failed at step {step}: {source}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for TrainError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::CorruptState(e) => Some(e),
            Self::State(e) => Some(e),
            Self::Checkpoint(e) => Some(e),
            Self::Collective(e) => Some(e),
            Self::Compute { source, .. } => Some(source),
            Self::Data { source, .. } => Some(source),
            Self::Io(e) => Some(e),
        }
    }
}

impl From<ConfigError> for TrainError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<CorruptState> for TrainError {
    fn from(value: CorruptState) -> Self {
        Self::CorruptState(value)
    }
}

impl From<StateError> for TrainError {
    fn from(value: StateError) -> Self {
        Self::State(value)
    }
}

impl From<CheckpointError> for TrainError {
    fn from(value: CheckpointError) -> Self {
        match value {
            CheckpointError::Corrupt(e) => Self::CorruptState(e),
            CheckpointError::Collective(e) => Self::Collective(e),
            other => Self::Checkpoint(other),
        }
    }
}

impl From<CollectiveError> for TrainError {
    fn from(value: CollectiveError) -> Self {
        Self::Collective(value)
    }
}

impl From<io::Error> for TrainError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
