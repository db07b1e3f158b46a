use std::{num::NonZeroU64, sync::Arc};

use super::{Trainer, TrainerParts};
use crate::{
    checkpoint::CheckpointScheduler,
    collective::{DistributedReducer, ProcessGroup},
    compute::{BigramModel, Compute},
    config::JobConfig,
    context::ProcessContext,
    data::{BatchSource, ShardSpec, ShardedLoader, TokenCorpus},
    error::{ConfigError, Result, TrainError},
    metrics::{MemoryMonitor, MetricsSink, ProcessMemoryMonitor, build_sink},
    topology::ParallelDims,
};

/// Assembles a [`Trainer`] from a job configuration.
///
/// Every collaborator comes from the configuration unless replaced with one of the `with_*`
/// methods.
pub struct TrainerBuilder<'a> {
    config: &'a JobConfig,
    ctx: &'a ProcessContext,
    source: Option<Box<dyn BatchSource>>,
    compute: Option<Box<dyn Compute>>,
    sink: Option<Box<dyn MetricsSink>>,
    monitor: Option<Box<dyn MemoryMonitor>>,
}

impl<'a> TrainerBuilder<'a> {
    pub fn new(config: &'a JobConfig, ctx: &'a ProcessContext) -> Self {
        Self {
            config,
            ctx,
            source: None,
            compute: None,
            sink: None,
            monitor: None,
        }
    }

    pub fn with_source(mut self, source: Box<dyn BatchSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_compute(mut self, compute: Box<dyn Compute>) -> Self {
        self.compute = Some(compute);
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_monitor(mut self, monitor: Box<dyn MemoryMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Builds the trainer over `group`.
    ///
    /// # Returns
    /// A `ConfigError` if the parallel degrees do not factor the world size or the group
    /// does not match the topology, or the error of the collaborator that failed to build.
    pub fn build<G: ProcessGroup>(self, group: G) -> Result<Trainer<G>> {
        let Self {
            config,
            ctx,
            source,
            compute,
            sink,
            monitor,
        } = self;
        let training = &config.training;

        let dims = ParallelDims::build(
            training.data_parallel_degree,
            training.sequence_parallel_degree,
            training.pipeline_parallel_degree,
            ctx.world_size,
        )?;
        let topology = dims.mesh(ctx.rank)?;
        let reducer = DistributedReducer::new(group, &topology)?;

        let (source, vocab_size) = match source {
            Some(source) => (source, None),
            None => {
                let corpus = TokenCorpus::from_spec(&training.dataset)
                    .map_err(|source| TrainError::Data { step: 0, source })?;
                let vocab_size = corpus.vocab_size();
                let loader = ShardedLoader::new(
                    Arc::new(corpus),
                    ShardSpec::from_topology(&topology),
                    training.batch_size,
                    training.seq_len,
                )
                .map_err(|source| TrainError::Data { step: 0, source })?;

                (Box::new(loader) as Box<dyn BatchSource>, Some(vocab_size))
            }
        };

        let compute: Box<dyn Compute> = match (compute, vocab_size) {
            (Some(compute), _) => compute,
            (None, Some(vocab_size)) => Box::new(BigramModel::from_config(
                &config.model,
                &config.optimizer,
                training,
                vocab_size,
            )),
            (None, None) => {
                return Err(ConfigError::InvalidValue {
                    field: "model",
                    reason: "a custom batch source needs a custom compute".into(),
                }
                .into());
            }
        };

        let dump_folder = &config.job.dump_folder;
        let sink = match sink {
            Some(sink) => sink,
            None => build_sink(config.metrics.sink, dump_folder, ctx.rank)?,
        };

        let monitor = monitor.unwrap_or_else(|| Box::new(ProcessMemoryMonitor::new()));
        let scheduler =
            CheckpointScheduler::new(&config.checkpoint, dump_folder, ctx.rank, ctx.world_size);

        Ok(Trainer::new(TrainerParts {
            ctx: ctx.clone(),
            topology,
            reducer,
            scheduler,
            source,
            compute,
            sink,
            monitor,
            total_steps: training.steps,
            log_freq: NonZeroU64::new(config.metrics.log_freq).unwrap_or(NonZeroU64::MIN),
        }))
    }
}
