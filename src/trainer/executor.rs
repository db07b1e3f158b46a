use std::{fmt, num::NonZeroU64};

use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::window::{LogWindow, should_log};
use crate::{
    checkpoint::{CheckpointScheduler, Restored, Snapshot},
    collective::{DistributedReducer, ProcessGroup, ReduceOp},
    compute::Compute,
    config::TotalSteps,
    context::ProcessContext,
    data::BatchSource,
    error::{CorruptState, Result, TrainError},
    metrics::{GLOBAL_AVG_LOSS, GLOBAL_MAX_LOSS, MemoryMonitor, MetricsRecord, MetricsSink, WPS},
    state::{TrainState, TrainStateRecord},
    topology::{Axis, ParallelTopology},
};

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Restoring,
    Running,
    Stopping,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::Restoring => "restoring",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What a finished run did.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub final_state: TrainStateRecord,
    /// Step the run resumed from, 0 on a fresh start.
    pub resumed_from: u64,
    pub skipped_steps: u64,
    pub checkpoints_written: u64,
    pub checkpoint_failures: u64,
    pub log_events: u64,
    /// True if a stop request ended the run before its configured last step.
    pub stopped_early: bool,
    /// Every phase the run went through, in order.
    pub phases: Vec<Phase>,
}

impl RunSummary {
    pub fn final_step(&self) -> u64 {
        self.final_state.step
    }
}

/// What every process agreed on at a step boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Boundary {
    stop: bool,
    save: bool,
}

/// Everything a [`Trainer`] drives.
pub struct TrainerParts<G> {
    pub ctx: ProcessContext,
    pub topology: ParallelTopology,
    pub reducer: DistributedReducer<G>,
    pub scheduler: CheckpointScheduler,
    pub source: Box<dyn BatchSource>,
    pub compute: Box<dyn Compute>,
    pub sink: Box<dyn MetricsSink>,
    pub monitor: Box<dyn MemoryMonitor>,
    pub total_steps: TotalSteps,
    pub log_freq: NonZeroU64,
}

/// The training loop of one process.
///
/// Owns the train state exclusively: it is advanced once per iteration, after that step's
/// compute finished and before any checkpoint of it is taken.
pub struct Trainer<G> {
    ctx: ProcessContext,
    topology: ParallelTopology,
    state: TrainState,
    reducer: DistributedReducer<G>,
    scheduler: CheckpointScheduler,
    source: Box<dyn BatchSource>,
    compute: Box<dyn Compute>,
    sink: Box<dyn MetricsSink>,
    monitor: Box<dyn MemoryMonitor>,
    total_steps: TotalSteps,
    log_freq: NonZeroU64,
    window: LogWindow,
    phase: watch::Sender<Phase>,
    phases: Vec<Phase>,
    resumed_from: u64,
    skipped_steps: u64,
    checkpoints_written: u64,
    checkpoint_failures: u64,
    log_events: u64,
}

impl<G: ProcessGroup> Trainer<G> {
    pub fn new(parts: TrainerParts<G>) -> Self {
        let TrainerParts {
            ctx,
            topology,
            reducer,
            scheduler,
            source,
            compute,
            sink,
            monitor,
            total_steps,
            log_freq,
        } = parts;

        Self {
            ctx,
            topology,
            state: TrainState::new(),
            reducer,
            scheduler,
            source,
            compute,
            sink,
            monitor,
            total_steps,
            log_freq,
            window: LogWindow::new(),
            phase: watch::Sender::new(Phase::Initializing),
            phases: vec![Phase::Initializing],
            resumed_from: 0,
            skipped_steps: 0,
            checkpoints_written: 0,
            checkpoint_failures: 0,
            log_events: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Follows the phase while [`Trainer::run`] owns the trainer, and after it returned.
    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    pub fn state(&self) -> &TrainState {
        &self.state
    }

    /// Runs the loop until the configured last step or an agreed stop request.
    ///
    /// # Arguments
    /// * `cancel` - Requests a stop. Honoured at the next step boundary, once every process
    ///   has seen it.
    ///
    /// # Returns
    /// The run summary, or the fatal error that ended the run. Before returning an error the
    /// rest of the group is told to abort, so they do not stall on this process.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<RunSummary> {
        match self.drive(&cancel).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                self.enter(Phase::Failed);
                error!(rank = self.ctx.rank, step = self.state.step(); "training failed: {e}");

                if !e.is_collective() {
                    self.reducer.abort(&e.to_string()).await;
                }

                if let Err(close) = self.sink.close() {
                    warn!(rank = self.ctx.rank; "closing the metrics sink failed: {close}");
                }
                Err(e)
            }
        }
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> Result<RunSummary> {
        self.initialize().await?;

        self.enter(Phase::Running);
        let stopped_early = self.train(cancel).await?;

        self.enter(Phase::Stopping);
        self.reducer.leave().await?;
        Ok(self.stop(stopped_early))
    }

    fn enter(&mut self, next: Phase) {
        let previous = self.phase.send_replace(next);
        self.phases.push(next);
        debug!(rank = self.ctx.rank, step = self.state.step(); "{previous} -> {next}");
    }

    async fn initialize(&mut self) -> Result<()> {
        if self.ctx.is_primary() {
            let dims = self.topology.dims();
            info!(
                world_size = dims.world_size(),
                model_parallel_size = dims.model_parallel_size();
                "topology data={} sequence={} pipeline={}",
                dims.size(Axis::Data),
                dims.size(Axis::Sequence),
                dims.size(Axis::Pipeline)
            );
            info!("model size: {} total parameters", self.compute.parameter_count());

            let memory = self.monitor.sample();
            info!(
                "memory at startup: active {:.2}% allocated {:.2}% reserved {:.2}%",
                memory.current.active, memory.current.allocated, memory.current.reserved
            );

            match self.scheduler.store() {
                Some(store) => info!(
                    "checkpointing every {} {} into {}",
                    self.scheduler.interval(),
                    self.scheduler.interval_type(),
                    store.root().display()
                ),
                None => info!("checkpointing disabled"),
            }
        }
        debug!(
            rank = self.ctx.rank;
            "data parallel replicas at ranks {:?}", self.topology.peers(Axis::Data)
        );

        if let Some(restored) = self.scheduler.load(&mut self.reducer).await? {
            self.enter(Phase::Restoring);
            self.resume(restored).await?;
        }

        // Records past the resumed step are about to be logged again.
        if let Err(e) = self.sink.resume(self.resumed_from) {
            warn!(rank = self.ctx.rank; "metrics sink could not drop replayed records: {e}");
        }
        Ok(())
    }

    async fn resume(&mut self, restored: Restored) -> Result<()> {
        self.restore(restored)?;

        let step = self.state.step() as f64;
        let min = self.reducer.reduce_min(step).await?;
        let max = self.reducer.reduce_max(step).await?;
        if min != max {
            return Err(CorruptState::DivergentStep {
                min: min as u64,
                max: max as u64,
            }
            .into());
        }

        self.resumed_from = self.state.step();
        if self.ctx.is_primary() {
            info!(step = self.resumed_from; "resuming training");
        }
        Ok(())
    }

    fn restore(&mut self, restored: Restored) -> Result<()> {
        let Restored {
            step,
            model,
            optimizer,
            train_state,
            data_cursor,
        } = restored;

        self.compute
            .load_state(&model, &optimizer)
            .map_err(|source| TrainError::Compute { step, source })?;
        self.state.restore(train_state)?;
        self.source.seek(data_cursor);
        Ok(())
    }

    /// # Returns
    /// True if the loop ended on a stop request rather than on the last step.
    async fn train(&mut self, cancel: &CancellationToken) -> Result<bool> {
        // Setup time does not count against the checkpoint interval.
        self.scheduler.reset();
        self.window = LogWindow::new();
        self.monitor.reset_peak();

        while !self.total_steps.reached(self.state.step()) {
            let pending = self.state.begin_step();
            let step = pending.step();

            // 1) Batch.
            let batch = self
                .source
                .next_batch()
                .map_err(|source| TrainError::Data { step, source })?;

            // 2) Loss, gradients and, if they are finite, the optimizer update.
            let outcome = self
                .compute
                .forward_backward(&batch)
                .map_err(|source| TrainError::Compute { step, source })?;

            if outcome.skipped {
                self.skipped_steps += 1;
                warn!(
                    rank = self.ctx.rank, step = step;
                    "non-finite gradients, optimizer step skipped (loss {})", outcome.loss
                );
            }

            // 3) Progress.
            self.state.advance(pending, outcome.loss)?;
            if self.ctx.is_primary() {
                debug!(
                    step = step;
                    "current loss: {:.4}, lr: {:.3e}", outcome.loss, self.compute.learning_rate()
                );
            }
            self.window.push(outcome.loss, batch.words());

            if should_log(step, self.log_freq.get()) {
                self.log_metrics(step).await?;
            }

            // 4) Schedule, whether or not the update was applied.
            self.compute.schedule_step();

            // 5) Boundary: checkpoint, then stop.
            let force = self.total_steps.is_final(step);
            let boundary = self
                .agree_boundary(self.scheduler.due(step, force), cancel.is_cancelled())
                .await?;

            if boundary.save {
                self.checkpoint(step).await?;
            }

            if boundary.stop {
                if self.ctx.is_primary() {
                    info!(step = step; "stop requested, leaving the loop");
                }
                return Ok(!self.total_steps.reached(step));
            }
        }

        Ok(false)
    }

    /// One collective per step boundary so that every process saves and stops at the
    /// same step, even when wall-clock cadence or a stop request is only seen locally.
    async fn agree_boundary(&mut self, save: bool, stop: bool) -> Result<Boundary> {
        let mut flags = [f64::from(u8::from(stop)), f64::from(u8::from(save))];
        self.reducer.reduce_many(&mut flags, ReduceOp::Max).await?;

        Ok(Boundary {
            stop: flags[0] > 0.0,
            save: flags[1] > 0.0,
        })
    }

    async fn log_metrics(&mut self, step: u64) -> Result<()> {
        let stats = self.window.take();
        let loss = self
            .reducer
            .reduce_log_window(stats.avg_loss, stats.max_loss)
            .await?;

        let wps = stats.wps(self.topology.model_parallel_size());
        let memory = self.monitor.sample();

        let mut record = MetricsRecord::new();
        record.insert(GLOBAL_AVG_LOSS, loss.avg);
        record.insert(GLOBAL_MAX_LOSS, loss.max);
        record.insert(WPS, wps);
        memory.write_into(&mut record);

        if let Err(e) = self.sink.log(&record, step) {
            warn!(rank = self.ctx.rank, step = step; "metrics sink rejected a record: {e}");
        }
        self.log_events += 1;

        if self.ctx.is_primary() {
            info!(
                "step: {step:>4}  loss: {:7.4}  memory: {:5.2}%  wps: {wps:.0}  lr: {:.3e}",
                loss.avg,
                memory.current.active,
                self.compute.learning_rate()
            );
        }
        Ok(())
    }

    async fn checkpoint(&mut self, step: u64) -> Result<()> {
        let model = self.compute.model_state();
        let optimizer = self.compute.optimizer_state();
        let train_state = self.state.snapshot();
        let snapshot = Snapshot {
            model: &model,
            optimizer: &optimizer,
            train_state: &train_state,
            data_cursor: self.source.cursor(),
        };

        let report = self
            .scheduler
            .save(&mut self.reducer, step, &snapshot)
            .await?;

        if report.committed {
            self.checkpoints_written += 1;
            if self.ctx.is_primary() {
                info!(
                    step = step;
                    "saved checkpoint in {:.2} seconds", report.elapsed.as_secs_f64()
                );
            }
            return Ok(());
        }

        self.checkpoint_failures += 1;
        match &report.local_error {
            Some(e) => warn!(rank = self.ctx.rank, step = step; "checkpoint save failed: {e}"),
            None => warn!(
                rank = self.ctx.rank, step = step;
                "checkpoint save failed on another process, discarded"
            ),
        }
        Ok(())
    }

    fn stop(&mut self, stopped_early: bool) -> RunSummary {
        if let Err(e) = self.sink.close() {
            warn!(rank = self.ctx.rank; "closing the metrics sink failed: {e}");
        }

        let memory = self.monitor.sample();
        debug!(rank = self.ctx.rank; "peak memory {:?}", memory.peak);
        if self.ctx.is_primary() {
            info!(
                step = self.state.step(),
                skipped = self.skipped_steps,
                checkpoints = self.checkpoints_written;
                "training completed, peak memory active {:.2}% allocated {:.2}% reserved {:.2}%",
                memory.peak.active,
                memory.peak.allocated,
                memory.peak.reserved
            );
        }

        RunSummary {
            final_state: self.state.snapshot(),
            resumed_from: self.resumed_from,
            skipped_steps: self.skipped_steps,
            checkpoints_written: self.checkpoints_written,
            checkpoint_failures: self.checkpoint_failures,
            log_events: self.log_events,
            stopped_early,
            phases: self.phases.clone(),
        }
    }
}
