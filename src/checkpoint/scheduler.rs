use std::{
    fmt,
    num::NonZeroU64,
    path::Path,
    time::{Duration, Instant},
};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::{CheckpointError, CheckpointStore, Restored, Snapshot};
use crate::{
    collective::{CollectiveError, DistributedReducer, ProcessGroup},
    config::CheckpointConfig,
};

/// What the checkpoint interval is measured in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalType {
    #[default]
    Steps,
    Seconds,
}

impl fmt::Display for IntervalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Steps => "steps",
            Self::Seconds => "seconds",
        })
    }
}

/// Whether a checkpoint is due.
///
/// # Arguments
/// * `interval_type` - Whether `interval` counts steps or seconds.
/// * `interval` - The cadence.
/// * `step` - The step that just completed.
/// * `elapsed` - Time since the last save attempt.
/// * `force` - Save regardless of cadence.
pub fn should_save(
    interval_type: IntervalType,
    interval: NonZeroU64,
    step: u64,
    elapsed: Duration,
    force: bool,
) -> bool {
    force
        || match interval_type {
            IntervalType::Steps => step % interval.get() == 0,
            IntervalType::Seconds => elapsed.as_secs_f64() >= interval.get() as f64,
        }
}

/// Outcome of one collective save attempt.
#[derive(Debug)]
pub struct SaveReport {
    pub step: u64,
    /// True only if every process wrote its entry.
    pub committed: bool,
    /// Why this process's own write failed, if it did.
    pub local_error: Option<CheckpointError>,
    pub elapsed: Duration,
}

/// Decides when to checkpoint and runs saves and loads as collective operations.
///
/// Saving and loading take `&mut self`, so they never overlap.
pub struct CheckpointScheduler {
    store: Option<CheckpointStore>,
    interval_type: IntervalType,
    interval: NonZeroU64,
    keep_latest: usize,
    last_save: Instant,
}

impl CheckpointScheduler {
    /// Creates the scheduler for one process.
    ///
    /// # Arguments
    /// * `config` - A validated checkpoint configuration. An empty folder disables checkpointing.
    /// * `dump_folder` - Base directory a relative checkpoint folder is resolved against.
    /// * `rank` - This process's global rank.
    /// * `world_size` - The amount of processes in the run.
    pub fn new(config: &CheckpointConfig, dump_folder: &Path, rank: usize, world_size: usize) -> Self {
        let store = (!config.folder.is_empty())
            .then(|| CheckpointStore::new(dump_folder.join(&config.folder), rank, world_size));

        Self {
            store,
            interval_type: config.interval_type,
            interval: NonZeroU64::new(config.interval).unwrap_or(NonZeroU64::MIN),
            keep_latest: config.keep_latest,
            last_save: Instant::now(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn store(&self) -> Option<&CheckpointStore> {
        self.store.as_ref()
    }

    pub fn interval_type(&self) -> IntervalType {
        self.interval_type
    }

    pub fn interval(&self) -> NonZeroU64 {
        self.interval
    }

    pub fn should_save(&self, step: u64, elapsed: Duration, force: bool) -> bool {
        should_save(self.interval_type, self.interval, step, elapsed, force)
    }

    /// This process's own view of whether a save is due after `step`, measured against the
    /// scheduler's clock.
    ///
    /// A step cadence gives the same answer on every process. A seconds cadence does not,
    /// so callers must agree on it collectively before saving.
    pub fn due(&self, step: u64, force: bool) -> bool {
        self.enabled() && self.should_save(step, self.last_save.elapsed(), force)
    }

    /// Restarts the interval clock. Persisted data is untouched.
    pub fn reset(&mut self) {
        self.last_save = Instant::now();
    }

    /// Persists `snapshot` for `step` on every process.
    ///
    /// Each process writes its own entry, then the group agrees on whether all of them
    /// succeeded. Only a committed save prunes old checkpoints. An uncommitted one is removed
    /// again so it can never be loaded.
    ///
    /// # Returns
    /// The report of the attempt, or an error if the agreement itself failed.
    pub async fn save<G: ProcessGroup>(
        &mut self,
        reducer: &mut DistributedReducer<G>,
        step: u64,
        snapshot: &Snapshot<'_>,
    ) -> Result<SaveReport, CollectiveError> {
        let start = Instant::now();
        let Some(store) = &self.store else {
            return Ok(SaveReport {
                step,
                committed: false,
                local_error: None,
                elapsed: Duration::ZERO,
            });
        };

        let local_error = store.write(step, snapshot).await.err();
        let flag = if local_error.is_none() { 1.0 } else { 0.0 };
        let committed = reducer.reduce_min(flag).await? >= 1.0;

        if committed {
            match store.prune(self.keep_latest).await {
                Ok(removed) if !removed.is_empty() => {
                    info!(rank = reducer.rank(), step = step; "pruned checkpoints {removed:?}");
                }
                Ok(_) => {}
                Err(e) => warn!(rank = reducer.rank(), step = step; "pruning checkpoints failed: {e}"),
            }
        } else if local_error.is_none()
            && let Err(e) = store.discard(step).await
        {
            warn!(rank = reducer.rank(), step = step; "removing uncommitted checkpoint failed: {e}");
        }

        self.reset();
        Ok(SaveReport {
            step,
            committed,
            local_error,
            elapsed: start.elapsed(),
        })
    }

    /// Restores the newest checkpoint every process holds completely.
    ///
    /// # Returns
    /// `None` on a fresh run, the restored entry otherwise. Any failure to read an entry the
    /// group agreed on is an error, on every process.
    pub async fn load<G: ProcessGroup>(
        &mut self,
        reducer: &mut DistributedReducer<G>,
    ) -> Result<Option<Restored>, CheckpointError> {
        let Some(store) = &self.store else {
            return Ok(None);
        };

        // A process that cannot even scan its folder poisons the agreement with NaN.
        let (latest, scan_error) = match store.latest_complete_step().await {
            Ok(latest) => (latest.unwrap_or(0) as f64, None),
            Err(e) => (f64::NAN, Some(e)),
        };

        let agreed = reducer.reduce_min(latest).await?;
        if let Some(e) = scan_error {
            return Err(e);
        }
        if agreed.is_nan() {
            return Err(CheckpointError::PeerFailed { operation: "scan" });
        }

        let step = agreed as u64;
        if step == 0 {
            info!(rank = reducer.rank(); "no checkpoint found in {}, starting fresh", store.root().display());
            return Ok(None);
        }

        let read = store.read(step).await;
        let flag = if read.is_ok() { 1.0 } else { 0.0 };
        let all_read = reducer.reduce_min(flag).await? >= 1.0;

        let restored = read?;
        if !all_read {
            return Err(CheckpointError::PeerFailed { operation: "load" });
        }

        info!(rank = reducer.rank(), step = step; "loaded checkpoint from {}", store.entry_dir(step).display());
        Ok(Some(restored))
    }
}
