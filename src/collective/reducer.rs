use super::{ProcessGroup, ReduceOp, Result};
use crate::{error::ConfigError, topology::ParallelTopology};

/// The globally reduced loss of one log window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalLoss {
    pub avg: f64,
    pub max: f64,
}

/// Folds per-process scalars into global values over the whole process group.
pub struct DistributedReducer<G> {
    group: G,
}

impl<G: ProcessGroup> DistributedReducer<G> {
    /// Wraps `group`, checking it is the process group `topology` describes.
    ///
    /// # Returns
    /// A `GroupMismatch` config error if the group's size or rank differ from the topology's.
    pub fn new(group: G, topology: &ParallelTopology) -> std::result::Result<Self, ConfigError> {
        if group.size() != topology.world_size() {
            return Err(ConfigError::GroupMismatch {
                what: "size",
                group: group.size(),
                topology: topology.world_size(),
            });
        }

        if group.rank() != topology.global_rank() {
            return Err(ConfigError::GroupMismatch {
                what: "rank",
                group: group.rank(),
                topology: topology.global_rank(),
            });
        }

        Ok(Self { group })
    }

    pub fn rank(&self) -> usize {
        self.group.rank()
    }

    pub fn size(&self) -> usize {
        self.group.size()
    }

    /// Arithmetic mean of `value` over every process.
    pub async fn reduce_mean(&mut self, value: f64) -> Result<f64> {
        self.reduce_scalar(value, ReduceOp::Mean).await
    }

    /// Maximum of `value` over every process.
    pub async fn reduce_max(&mut self, value: f64) -> Result<f64> {
        self.reduce_scalar(value, ReduceOp::Max).await
    }

    /// Minimum of `value` over every process.
    pub async fn reduce_min(&mut self, value: f64) -> Result<f64> {
        self.reduce_scalar(value, ReduceOp::Min).await
    }

    /// Every reduction one log event needs, in a fixed order. Call sites that log go
    /// through here so no process can issue a different sequence of collectives.
    pub async fn reduce_log_window(&mut self, avg: f64, max: f64) -> Result<GlobalLoss> {
        let avg = self.reduce_mean(avg).await?;
        let max = self.reduce_max(max).await?;
        Ok(GlobalLoss { avg, max })
    }

    /// Elementwise reduction of several values in one collective.
    pub async fn reduce_many(&mut self, values: &mut [f64], op: ReduceOp) -> Result<()> {
        self.group.all_reduce(values, op).await
    }

    /// Leaves the group after the last collective of the run.
    pub async fn leave(&mut self) -> Result<()> {
        self.group.leave().await
    }

    pub async fn abort(&mut self, reason: &str) {
        self.group.abort(reason).await
    }

    async fn reduce_scalar(&mut self, value: f64, op: ReduceOp) -> Result<f64> {
        let mut buf = [value];
        self.group.all_reduce(&mut buf, op).await?;
        Ok(buf[0])
    }
}
