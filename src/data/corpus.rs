use std::path::Path;

use rand::{Rng, SeedableRng, rngs::StdRng};

use super::DataError;
use crate::config::DatasetSpec;

/// Probability that the synthetic stream follows its hidden transition instead of drawing
/// a uniform token.
const SYNTHETIC_SIGNAL: f64 = 0.75;

/// A flat token stream and its vocabulary size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenCorpus {
    tokens: Vec<u32>,
    vocab_size: usize,
}

impl TokenCorpus {
    /// # Returns
    /// `EmptyCorpus` if `tokens` is empty.
    pub fn new(tokens: Vec<u32>, vocab_size: usize) -> Result<Self, DataError> {
        if tokens.is_empty() {
            return Err(DataError::EmptyCorpus);
        }

        Ok(Self { tokens, vocab_size })
    }

    pub fn from_spec(spec: &DatasetSpec) -> Result<Self, DataError> {
        match spec {
            DatasetSpec::Synthetic {
                tokens,
                vocab_size,
                seed,
            } => Self::synthetic(*tokens, *vocab_size, *seed),
            DatasetSpec::Bytes { path } => Self::from_bytes(path),
        }
    }

    /// A seeded stream where each token mostly determines the next, so a bigram model has
    /// something to learn. Identical on every process for the same arguments.
    pub fn synthetic(len: usize, vocab_size: usize, seed: u64) -> Result<Self, DataError> {
        let vocab = u32::try_from(vocab_size)
            .ok()
            .filter(|&v| v > 0)
            .ok_or(DataError::VocabSize(vocab_size))?;
        let mut rng = StdRng::seed_from_u64(seed);
        let successor: Vec<u32> = (0..vocab).map(|_| rng.random_range(0..vocab)).collect();

        let mut tokens = Vec::with_capacity(len);
        let mut current = rng.random_range(0..vocab);
        for _ in 0..len {
            tokens.push(current);
            current = if rng.random_bool(SYNTHETIC_SIGNAL) {
                successor[current as usize]
            } else {
                rng.random_range(0..vocab)
            };
        }

        Self::new(tokens, vocab as usize)
    }

    /// Byte-level corpus: every byte of the file is a token out of 256.
    pub fn from_bytes(path: &Path) -> Result<Self, DataError> {
        let bytes = std::fs::read(path).map_err(|source| DataError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::new(bytes.into_iter().map(u32::from).collect(), 256)
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
