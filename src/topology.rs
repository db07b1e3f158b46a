use std::fmt;

use crate::error::ConfigError;

/// A named parallelism axis of the process mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    Pipeline,
    Data,
    Sequence,
}

impl Axis {
    /// Mesh order, outermost to innermost.
    pub const ALL: [Axis; 3] = [Axis::Pipeline, Axis::Data, Axis::Sequence];

    fn index(self) -> usize {
        match self {
            Self::Pipeline => 0,
            Self::Data => 1,
            Self::Sequence => 2,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pipeline => "pipeline",
            Self::Data => "data",
            Self::Sequence => "sequence",
        };
        f.write_str(name)
    }
}

/// Validated parallel degrees, not yet bound to a rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelDims {
    degrees: [usize; 3],
    world_size: usize,
}

impl ParallelDims {
    /// Validates the requested degrees against the world size.
    ///
    /// # Arguments
    /// * `data` - Data parallel degree.
    /// * `sequence` - Sequence parallel degree.
    /// * `pipeline` - Pipeline parallel degree.
    /// * `world_size` - Total amount of processes in the run.
    ///
    /// # Returns
    /// The dims, or a `ConfigError` if a degree is zero or the product differs from `world_size`.
    pub fn build(
        data: usize,
        sequence: usize,
        pipeline: usize,
        world_size: usize,
    ) -> Result<Self, ConfigError> {
        for (axis, degree) in [
            (Axis::Data, data),
            (Axis::Sequence, sequence),
            (Axis::Pipeline, pipeline),
        ] {
            if degree < 1 {
                return Err(ConfigError::InvalidDegree { axis, degree });
            }
        }

        let product = data
            .checked_mul(sequence)
            .and_then(|p| p.checked_mul(pipeline));

        if product != Some(world_size) {
            return Err(ConfigError::WorldSizeMismatch {
                data,
                sequence,
                pipeline,
                world_size,
            });
        }

        Ok(Self {
            degrees: [pipeline, data, sequence],
            world_size,
        })
    }

    pub fn size(&self, axis: Axis) -> usize {
        self.degrees[axis.index()]
    }

    pub fn enabled(&self, axis: Axis) -> bool {
        self.size(axis) > 1
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Product of every axis except the data parallel one.
    pub fn model_parallel_size(&self) -> usize {
        self.world_size / self.size(Axis::Data)
    }

    /// Binds the dims to the process with the given global rank.
    ///
    /// # Returns
    /// The topology, or `RankOutOfRange` if `rank >= world_size`.
    pub fn mesh(self, rank: usize) -> Result<ParallelTopology, ConfigError> {
        if rank >= self.world_size {
            return Err(ConfigError::RankOutOfRange {
                rank,
                world_size: self.world_size,
            });
        }

        let mut coords = [0; 3];
        let mut rest = rank;
        for i in (0..3).rev() {
            coords[i] = rest % self.degrees[i];
            rest /= self.degrees[i];
        }

        Ok(ParallelTopology {
            dims: self,
            rank,
            coords,
        })
    }
}

/// The process mesh as seen by one process. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelTopology {
    dims: ParallelDims,
    rank: usize,
    coords: [usize; 3],
}

impl ParallelTopology {
    pub fn dims(&self) -> &ParallelDims {
        &self.dims
    }

    pub fn world_size(&self) -> usize {
        self.dims.world_size
    }

    pub fn global_rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self, axis: Axis) -> usize {
        self.dims.size(axis)
    }

    /// This process's coordinate along `axis`.
    pub fn rank(&self, axis: Axis) -> usize {
        self.coords[axis.index()]
    }

    pub fn model_parallel_size(&self) -> usize {
        self.dims.model_parallel_size()
    }

    /// Global ranks that share every coordinate with this process except the one along
    /// `axis`, ordered by their coordinate on `axis`.
    pub fn peers(&self, axis: Axis) -> Vec<usize> {
        let i = axis.index();
        (0..self.dims.degrees[i])
            .map(|c| {
                let mut coords = self.coords;
                coords[i] = c;
                self.linear(&coords)
            })
            .collect()
    }

    fn linear(&self, coords: &[usize; 3]) -> usize {
        coords
            .iter()
            .zip(self.dims.degrees)
            .fold(0, |acc, (&c, d)| acc * d + c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_accepts_every_exact_factorisation() {
        for w in 1..=12 {
            for d in 1..=w {
                for s in 1..=w {
                    for p in 1..=w {
                        let res = ParallelDims::build(d, s, p, w);
                        if d * s * p == w {
                            let dims = res.unwrap();
                            assert_eq!(dims.size(Axis::Data), d);
                            assert_eq!(dims.size(Axis::Sequence), s);
                            assert_eq!(dims.size(Axis::Pipeline), p);
                            assert_eq!(dims.model_parallel_size(), s * p);
                        } else {
                            assert!(matches!(res, Err(ConfigError::WorldSizeMismatch { .. })));
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn zero_degree_is_rejected() {
        let res = ParallelDims::build(0, 1, 1, 0);
        assert!(matches!(
            res,
            Err(ConfigError::InvalidDegree {
                axis: Axis::Data,
                degree: 0
            })
        ));

        let res = ParallelDims::build(2, 1, 0, 2);
        assert!(matches!(
            res,
            Err(ConfigError::InvalidDegree {
                axis: Axis::Pipeline,
                ..
            })
        ));
    }

    #[test]
    fn overflowing_product_is_a_mismatch() {
        let err = ParallelDims::build(usize::MAX, 2, 1, 2).unwrap_err();
        assert!(matches!(err, ConfigError::WorldSizeMismatch { .. }));
        assert!(err.to_string().contains("= overflow does not match world size 2"));

        let err = ParallelDims::build(2, 2, 1, 8).unwrap_err();
        assert!(err.to_string().contains("= 4 does not match world size 8"));
    }

    #[test]
    fn mesh_rejects_out_of_range_rank() {
        let dims = ParallelDims::build(2, 2, 1, 4).unwrap();
        assert!(matches!(
            dims.mesh(4),
            Err(ConfigError::RankOutOfRange {
                rank: 4,
                world_size: 4
            })
        ));
    }

    #[test]
    fn sequence_is_the_innermost_axis() {
        // pipeline=2, data=2, sequence=2
        let dims = ParallelDims::build(2, 2, 2, 8).unwrap();

        let t = dims.mesh(5).unwrap();
        assert_eq!(t.rank(Axis::Pipeline), 1);
        assert_eq!(t.rank(Axis::Data), 0);
        assert_eq!(t.rank(Axis::Sequence), 1);

        assert_eq!(t.peers(Axis::Sequence), vec![4, 5]);
        assert_eq!(t.peers(Axis::Data), vec![5, 7]);
        assert_eq!(t.peers(Axis::Pipeline), vec![1, 5]);
    }

    #[test]
    fn every_rank_gets_distinct_coordinates() {
        let dims = ParallelDims::build(3, 2, 2, 12).unwrap();
        let mut seen = std::collections::HashSet::new();
        for r in 0..12 {
            let t = dims.mesh(r).unwrap();
            let c = (
                t.rank(Axis::Pipeline),
                t.rank(Axis::Data),
                t.rank(Axis::Sequence),
            );
            assert!(seen.insert(c));
            assert!(t.peers(Axis::Data).contains(&r));
        }
    }

    #[test]
    fn pure_data_parallel_has_unit_model_parallel_size() {
        let dims = ParallelDims::build(4, 1, 1, 4).unwrap();
        assert_eq!(dims.model_parallel_size(), 1);
        assert!(dims.enabled(Axis::Data));
        assert!(!dims.enabled(Axis::Sequence));

        let t = dims.mesh(3).unwrap();
        assert_eq!(t.rank(Axis::Data), 3);
        assert_eq!(t.peers(Axis::Data), vec![0, 1, 2, 3]);
    }
}
