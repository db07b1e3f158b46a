use std::{num::NonZeroUsize, ops::Range};

use crate::topology::{Axis, ParallelTopology};

/// Splits `total` tokens among `num_shards` and returns the range of `shard_id`.
///
/// Properties:
/// - Ranges are contiguous, disjoint and cover `[0..total)`.
/// - Sizes differ by at most 1 (balanced partition).
pub fn shard_range(total: usize, shard_id: usize, num_shards: usize) -> Range<usize> {
    assert!(num_shards > 0);
    assert!(shard_id < num_shards);

    let base = total / num_shards;
    let rem = total % num_shards;

    let start = shard_id * base + shard_id.min(rem);
    let extra = if shard_id < rem { 1 } else { 0 };
    let end = start + base + extra;

    start..end
}

/// The data parallel coordinates a shard is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    pub dp_rank: usize,
    pub dp_size: NonZeroUsize,
}

impl ShardSpec {
    pub fn new(dp_rank: usize, dp_size: NonZeroUsize) -> Self {
        assert!(dp_rank < dp_size.get(), "dp_rank out of range");
        Self { dp_rank, dp_size }
    }

    /// Processes that differ only along model parallel axes share a shard.
    pub fn from_topology(topology: &ParallelTopology) -> Self {
        let dp_size = NonZeroUsize::new(topology.size(Axis::Data)).unwrap_or(NonZeroUsize::MIN);
        Self::new(topology.rank(Axis::Data), dp_size)
    }

    #[inline]
    pub fn range(self, total: usize) -> Range<usize> {
        shard_range(total, self.dp_rank, self.dp_size.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::ParallelDims;

    #[test]
    fn shard_range_balanced() {
        // total 10, shards 3 => sizes 4,3,3
        assert_eq!(shard_range(10, 0, 3), 0..4);
        assert_eq!(shard_range(10, 1, 3), 4..7);
        assert_eq!(shard_range(10, 2, 3), 7..10);
    }

    #[test]
    fn shards_cover_everything_once() {
        for total in 0..40 {
            for n in 1..7 {
                let mut next = 0;
                for id in 0..n {
                    let r = shard_range(total, id, n);
                    assert_eq!(r.start, next);
                    assert!(r.len() == total / n || r.len() == total / n + 1);
                    next = r.end;
                }
                assert_eq!(next, total);
            }
        }
    }

    #[test]
    fn sequence_peers_share_a_shard() {
        let dims = ParallelDims::build(2, 2, 1, 4).unwrap();
        let a = ShardSpec::from_topology(&dims.mesh(2).unwrap());
        let b = ShardSpec::from_topology(&dims.mesh(3).unwrap());
        let c = ShardSpec::from_topology(&dims.mesh(0).unwrap());

        assert_eq!(a, b);
        assert_eq!(a.dp_rank, 1);
        assert_eq!(c.dp_rank, 0);
        assert_eq!(a.range(100), 50..100);
    }
}
