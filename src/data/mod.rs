//! Batches for the training loop, sharded across the data parallel axis.

mod corpus;
mod loader;
mod shard;

use std::{error::Error, fmt, io, path::PathBuf};

pub use corpus::TokenCorpus;
pub use loader::ShardedLoader;
pub use shard::{ShardSpec, shard_range};

/// One step's worth of training windows, stored row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub input_ids: Vec<u32>,
    pub labels: Vec<u32>,
    pub rows: usize,
    pub seq_len: usize,
}

impl Batch {
    /// Tokens the model consumes for this batch.
    pub fn words(&self) -> usize {
        self.input_ids.len()
    }
}

/// Produces the batches of one process.
///
/// Batch `n` is a pure function of the dataset, the process's data parallel coordinates
/// and `n`, so restoring the cursor resumes the exact stream.
pub trait BatchSource: Send {
    fn next_batch(&mut self) -> Result<Batch, DataError>;

    /// Batches drawn so far.
    fn cursor(&self) -> u64;

    fn seek(&mut self, cursor: u64);
}

#[derive(Debug)]
pub enum DataError {
    Io { path: PathBuf, source: io::Error },
    EmptyCorpus,
    /// Token ids are `u32`, and a vocabulary needs at least one of them.
    VocabSize(usize),
    ShardTooSmall { dp_rank: usize, tokens: usize, needed: usize },
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "cannot read '{}': {source}", path.display()),
            Self::EmptyCorpus => write!(f, "the corpus holds no tokens"),
            Self::VocabSize(size) => write!(f, "a vocabulary of {size} tokens is not supported"),
            Self::ShardTooSmall {
                dp_rank,
                tokens,
                needed,
            } => write!(
                f,
                "data parallel shard {dp_rank} holds {tokens} tokens, a window needs {needed}"
            ),
        }
    }
}

impl Error for DataError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
