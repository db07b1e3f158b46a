use std::{error::Error, fmt, io};

pub type Result<T> = std::result::Result<T, CollectiveError>;

/// Failure of a collective operation. Always fatal for the run.
#[derive(Debug)]
pub enum CollectiveError {
    Io(io::Error),
    Mismatch(String),
    PeerAborted { rank: usize, reason: String },
    Protocol(String),
}

impl fmt::Display for CollectiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "transport failure: {e}"),
            Self::Mismatch(detail) => write!(f, "asymmetric collective call: {detail}"),
            Self::PeerAborted { rank, reason } => write!(f, "rank {rank} aborted: {reason}"),
            Self::Protocol(detail) => write!(f, "protocol violation: {detail}"),
        }
    }
}

impl Error for CollectiveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CollectiveError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
