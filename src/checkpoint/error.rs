use std::{error::Error, fmt, io, path::PathBuf};

use crate::{collective::CollectiveError, error::CorruptState};

#[derive(Debug)]
pub enum CheckpointError {
    Io { path: PathBuf, source: io::Error },
    Encode(serde_json::Error),
    Corrupt(CorruptState),
    Collective(CollectiveError),
    /// This process succeeded but another one did not.
    PeerFailed { operation: &'static str },
}

impl CheckpointError {
    pub(super) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::Encode(e) => write!(f, "cannot encode checkpoint metadata: {e}"),
            Self::Corrupt(e) => write!(f, "{e}"),
            Self::Collective(e) => write!(f, "{e}"),
            Self::PeerFailed { operation } => {
                write!(f, "checkpoint {operation} failed on another process")
            }
        }
    }
}

impl Error for CheckpointError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Encode(e) => Some(e),
            Self::Corrupt(e) => Some(e),
            Self::Collective(e) => Some(e),
            Self::PeerFailed { .. } => None,
        }
    }
}

impl From<CorruptState> for CheckpointError {
    fn from(value: CorruptState) -> Self {
        Self::Corrupt(value)
    }
}

impl From<CollectiveError> for CheckpointError {
    fn from(value: CollectiveError) -> Self {
        Self::Collective(value)
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(value: serde_json::Error) -> Self {
        Self::Encode(value)
    }
}
