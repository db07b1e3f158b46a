use std::{path::PathBuf, process::ExitCode};

use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};
use mesh_train::{
    JobConfig, ProcessContext, RunSummary, TrainerBuilder,
    collective::{LocalGroup, ProcessGroup, TcpGroup},
    config::TotalSteps,
};
use tokio_util::sync::CancellationToken;

/// Runs one process of a distributed training job.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Job configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Overrides `training.steps`; -1 runs until stopped.
    #[arg(long, allow_negative_numbers = true)]
    steps: Option<i64>,

    /// Overrides `checkpoint.folder`; an empty string disables checkpointing.
    #[arg(long)]
    checkpoint_folder: Option<String>,

    /// Overrides `job.dump_folder`.
    #[arg(long)]
    dump_folder: Option<PathBuf>,
}

impl Cli {
    fn job_config(&self) -> anyhow::Result<JobConfig> {
        let mut config = JobConfig::load(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;

        if let Some(steps) = self.steps {
            config.training.steps = TotalSteps::try_from(steps).map_err(anyhow::Error::msg)?;
        }
        if let Some(folder) = &self.checkpoint_folder {
            config.checkpoint.folder = folder.clone();
        }
        if let Some(dump) = &self.dump_folder {
            config.job.dump_folder = dump.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

async fn launch<G: ProcessGroup>(
    config: &JobConfig,
    ctx: &ProcessContext,
    group: G,
    cancel: CancellationToken,
) -> anyhow::Result<RunSummary> {
    let trainer = TrainerBuilder::new(config, ctx).build(group)?;
    Ok(trainer.run(cancel).await?)
}

async fn run(cli: Cli) -> anyhow::Result<RunSummary> {
    let config = cli.job_config()?;
    let ctx = ProcessContext::from_env()?;

    if ctx.is_primary() {
        info!("starting job: {}", config.job.description);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("stop requested, finishing the current step");
            on_signal.cancel();
        }
    });

    if ctx.world_size == 1 {
        launch(&config, &ctx, LocalGroup::single(), cancel).await
    } else {
        let group = TcpGroup::connect(&ctx)
            .await
            .context("joining the process group")?;
        launch(&config, &ctx, group, cancel).await
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    match run(Cli::parse()).await {
        Ok(summary) => {
            info!(
                step = summary.final_step(),
                skipped = summary.skipped_steps,
                checkpoints = summary.checkpoints_written;
                "run finished"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
