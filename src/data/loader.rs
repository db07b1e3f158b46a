use std::{ops::Range, sync::Arc};

use super::{Batch, BatchSource, DataError, ShardSpec, TokenCorpus};

/// Shard-aware loader yielding `batch_size` windows of `seq_len` tokens per batch.
///
/// Windows advance through the shard contiguously and wrap around at its end.
#[derive(Debug, Clone)]
pub struct ShardedLoader {
    corpus: Arc<TokenCorpus>,
    shard: ShardSpec,
    shard_range: Range<usize>,
    batch_size: usize,
    seq_len: usize,
    cursor: u64,
}

impl ShardedLoader {
    /// # Returns
    /// `ShardTooSmall` if this process's shard cannot hold one window and its label.
    pub fn new(
        corpus: Arc<TokenCorpus>,
        shard: ShardSpec,
        batch_size: usize,
        seq_len: usize,
    ) -> Result<Self, DataError> {
        let shard_range = shard.range(corpus.len());
        let needed = seq_len + 1;

        if shard_range.len() < needed {
            return Err(DataError::ShardTooSmall {
                dp_rank: shard.dp_rank,
                tokens: shard_range.len(),
                needed,
            });
        }

        Ok(Self {
            corpus,
            shard,
            shard_range,
            batch_size: batch_size.max(1),
            seq_len,
            cursor: 0,
        })
    }

    #[inline]
    pub fn shard(&self) -> ShardSpec {
        self.shard
    }

    #[inline]
    pub fn shard_range(&self) -> Range<usize> {
        self.shard_range.clone()
    }

    pub fn vocab_size(&self) -> usize {
        self.corpus.vocab_size()
    }

    fn window_start(&self, row: usize) -> usize {
        let starts = (self.shard_range.len() - self.seq_len) as u128;
        let index = self.cursor as u128 * self.batch_size as u128 + row as u128;
        let offset = (index * self.seq_len as u128) % starts;
        self.shard_range.start + offset as usize
    }
}

impl BatchSource for ShardedLoader {
    fn next_batch(&mut self) -> Result<Batch, DataError> {
        let tokens = self.corpus.tokens();
        let mut input_ids = Vec::with_capacity(self.batch_size * self.seq_len);
        let mut labels = Vec::with_capacity(self.batch_size * self.seq_len);

        for row in 0..self.batch_size {
            let start = self.window_start(row);
            input_ids.extend_from_slice(&tokens[start..start + self.seq_len]);
            labels.extend_from_slice(&tokens[start + 1..start + self.seq_len + 1]);
        }

        self.cursor += 1;
        Ok(Batch {
            input_ids,
            labels,
            rows: self.batch_size,
            seq_len: self.seq_len,
        })
    }

    fn cursor(&self) -> u64 {
        self.cursor
    }

    fn seek(&mut self, cursor: u64) {
        self.cursor = cursor;
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;

    fn counting(len: u32) -> Arc<TokenCorpus> {
        Arc::new(TokenCorpus::new((0..len).collect(), len as usize).unwrap())
    }

    fn spec(rank: usize, size: usize) -> ShardSpec {
        ShardSpec::new(rank, NonZeroUsize::new(size).unwrap())
    }

    #[test]
    fn windows_stay_inside_the_shard_and_labels_shift_by_one() {
        let mut dl = ShardedLoader::new(counting(40), spec(1, 2), 2, 4).unwrap();
        assert_eq!(dl.shard_range(), 20..40);

        for _ in 0..20 {
            let batch = dl.next_batch().unwrap();
            assert_eq!(batch.words(), 8);
            for (x, y) in batch.input_ids.iter().zip(&batch.labels) {
                assert!((20..40).contains(x));
                assert_eq!(*y, x + 1);
            }
        }
    }

    #[test]
    fn consecutive_batches_advance_instead_of_repeating() {
        let mut dl = ShardedLoader::new(counting(100), spec(0, 1), 1, 5).unwrap();
        let first = dl.next_batch().unwrap();
        let second = dl.next_batch().unwrap();

        assert_eq!(first.input_ids, vec![0, 1, 2, 3, 4]);
        assert_eq!(second.input_ids, vec![5, 6, 7, 8, 9]);
        assert_eq!(dl.cursor(), 2);
    }

    #[test]
    fn seek_resumes_the_same_stream() {
        let corpus = counting(64);
        let mut a = ShardedLoader::new(Arc::clone(&corpus), spec(0, 2), 3, 4).unwrap();
        for _ in 0..7 {
            a.next_batch().unwrap();
        }

        let mut b = ShardedLoader::new(corpus, spec(0, 2), 3, 4).unwrap();
        b.seek(a.cursor());
        assert_eq!(a.next_batch().unwrap(), b.next_batch().unwrap());
    }

    #[test]
    fn wraps_at_the_end_of_the_shard() {
        let mut dl = ShardedLoader::new(counting(11), spec(0, 1), 1, 5).unwrap();
        let batches: Vec<_> = (0..3).map(|_| dl.next_batch().unwrap().input_ids).collect();
        assert_eq!(batches[0], vec![0, 1, 2, 3, 4]);
        assert_eq!(batches[1], vec![5, 6, 7, 8, 9]);
        assert_eq!(batches[2], vec![4, 5, 6, 7, 8]);
    }

    #[test]
    fn too_small_shard_is_rejected() {
        let res = ShardedLoader::new(counting(9), spec(2, 3), 1, 3);
        assert!(matches!(
            res,
            Err(DataError::ShardTooSmall {
                dp_rank: 2,
                tokens: 3,
                needed: 4
            })
        ));
    }
}
