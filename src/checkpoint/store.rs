use std::{
    io,
    path::{Path, PathBuf},
};

use log::debug;
use tokio::{fs, io::AsyncWriteExt};

use super::{CheckpointError, MANIFEST_VERSION, Manifest, Restored, Snapshot};
use crate::{error::CorruptState, state::TrainStateRecord};

const MODEL_FILE: &str = "model.bin";
const OPTIMIZER_FILE: &str = "optimizer.bin";
const TRAIN_STATE_FILE: &str = "train_state.json";
const MANIFEST_FILE: &str = "manifest.json";

type Result<T> = std::result::Result<T, CheckpointError>;

/// One process's view of the checkpoint folder.
///
/// Layout: `{root}/step-{N}/rank-{R}/` holding the model, optimizer, train state and manifest.
/// An entry is staged under `rank-{R}.tmp` and renamed into place once every file is synced,
/// so a `rank-{R}` directory is always complete.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
    rank: usize,
    world_size: usize,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>, rank: usize, world_size: usize) -> Self {
        Self {
            root: root.into(),
            rank,
            world_size,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn step_dir(&self, step: u64) -> PathBuf {
        self.root.join(format!("step-{step}"))
    }

    pub fn entry_dir(&self, step: u64) -> PathBuf {
        self.step_dir(step).join(format!("rank-{}", self.rank))
    }

    fn staging_dir(&self, step: u64) -> PathBuf {
        self.step_dir(step).join(format!("rank-{}.tmp", self.rank))
    }

    /// Writes this rank's entry for `step`.
    ///
    /// # Returns
    /// An error if any file could not be written. A failed write leaves at most a staging
    /// directory behind, which is never considered loadable.
    pub async fn write(&self, step: u64, snapshot: &Snapshot<'_>) -> Result<PathBuf> {
        let staging = self.staging_dir(step);
        let entry = self.entry_dir(step);

        remove_dir_if_exists(&staging).await?;
        fs::create_dir_all(&staging)
            .await
            .map_err(CheckpointError::io(&staging))?;

        let train_state = serde_json::to_vec_pretty(snapshot.train_state)?;
        let manifest = Manifest {
            version: MANIFEST_VERSION,
            step,
            rank: self.rank,
            world_size: self.world_size,
            data_cursor: snapshot.data_cursor,
            model_bytes: snapshot.model.len() as u64,
            optimizer_bytes: snapshot.optimizer.len() as u64,
            train_state_bytes: train_state.len() as u64,
        };

        write_synced(&staging.join(MODEL_FILE), snapshot.model).await?;
        write_synced(&staging.join(OPTIMIZER_FILE), snapshot.optimizer).await?;
        write_synced(&staging.join(TRAIN_STATE_FILE), &train_state).await?;
        write_synced(
            &staging.join(MANIFEST_FILE),
            &serde_json::to_vec_pretty(&manifest)?,
        )
        .await?;

        remove_dir_if_exists(&entry).await?;
        fs::rename(&staging, &entry)
            .await
            .map_err(CheckpointError::io(&entry))?;

        debug!(rank = self.rank, step = step; "checkpoint entry written");
        Ok(entry)
    }

    /// Steps for which this rank holds a complete entry, newest first.
    pub async fn complete_steps(&self) -> Result<Vec<u64>> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CheckpointError::io(&self.root)(e)),
        };

        let mut steps = Vec::new();
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(CheckpointError::io(&self.root))?
        {
            let name = item.file_name();
            let Some(step) = name
                .to_str()
                .and_then(|n| n.strip_prefix("step-"))
                .and_then(|n| n.parse::<u64>().ok())
            else {
                continue;
            };

            if step > 0 && fs::try_exists(self.entry_dir(step)).await.unwrap_or(false) {
                steps.push(step);
            }
        }

        steps.sort_unstable_by(|a, b| b.cmp(a));
        Ok(steps)
    }

    pub async fn latest_complete_step(&self) -> Result<Option<u64>> {
        Ok(self.complete_steps().await?.first().copied())
    }

    /// Reads and cross-checks this rank's entry for `step`.
    ///
    /// # Returns
    /// A `CorruptState` error if the entry is missing or its artifacts disagree with each
    /// other or with this process.
    pub async fn read(&self, step: u64) -> Result<Restored> {
        let entry = self.entry_dir(step);
        if !fs::try_exists(&entry)
            .await
            .map_err(CheckpointError::io(&entry))?
        {
            return Err(CorruptState::MissingEntry {
                step,
                rank: self.rank,
            }
            .into());
        }

        let manifest: Manifest = decode("manifest", &read(&entry.join(MANIFEST_FILE)).await?)?;
        self.check_manifest(&manifest, step)?;

        let model = read(&entry.join(MODEL_FILE)).await?;
        check_len("model", model.len(), manifest.model_bytes)?;

        let optimizer = read(&entry.join(OPTIMIZER_FILE)).await?;
        check_len("optimizer", optimizer.len(), manifest.optimizer_bytes)?;

        let raw_state = read(&entry.join(TRAIN_STATE_FILE)).await?;
        check_len("train_state", raw_state.len(), manifest.train_state_bytes)?;

        let train_state: TrainStateRecord = decode("train_state", &raw_state)?;
        if train_state.step != step {
            return Err(CorruptState::StepMismatch {
                artifact: "train_state",
                found: train_state.step,
                expected: step,
            }
            .into());
        }
        train_state.validate()?;

        Ok(Restored {
            step,
            model,
            optimizer,
            train_state,
            data_cursor: manifest.data_cursor,
        })
    }

    fn check_manifest(&self, manifest: &Manifest, step: u64) -> Result<()> {
        if manifest.version != MANIFEST_VERSION {
            return Err(CorruptState::VersionMismatch {
                artifact: "manifest",
                found: manifest.version,
                expected: MANIFEST_VERSION,
            }
            .into());
        }

        if manifest.step != step {
            return Err(CorruptState::StepMismatch {
                artifact: "manifest",
                found: manifest.step,
                expected: step,
            }
            .into());
        }

        if manifest.rank != self.rank || manifest.world_size != self.world_size {
            return Err(CorruptState::Decode {
                artifact: "manifest",
                reason: format!(
                    "written by rank {} of {}, read by rank {} of {}",
                    manifest.rank, manifest.world_size, self.rank, self.world_size
                ),
            }
            .into());
        }

        Ok(())
    }

    /// Deletes this rank's entries older than the newest `keep`.
    ///
    /// # Returns
    /// The steps removed.
    pub async fn prune(&self, keep: usize) -> Result<Vec<u64>> {
        let stale: Vec<u64> = self.complete_steps().await?.into_iter().skip(keep).collect();
        for &step in &stale {
            self.discard(step).await?;
        }
        Ok(stale)
    }

    /// Deletes this rank's entry for `step`, and the step directory once no rank uses it.
    pub async fn discard(&self, step: u64) -> Result<()> {
        remove_dir_if_exists(&self.entry_dir(step)).await?;
        remove_dir_if_exists(&self.staging_dir(step)).await?;

        // Fails while other ranks still have entries there.
        let _ = fs::remove_dir(self.step_dir(step)).await;
        Ok(())
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let map = CheckpointError::io(path);
    let res: io::Result<()> = async {
        let mut file = fs::File::create(path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await
    }
    .await;

    res.map_err(map)
}

async fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).await.map_err(CheckpointError::io(path))
}

async fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CheckpointError::io(path)(e)),
    }
}

fn decode<T: serde::de::DeserializeOwned>(artifact: &'static str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| {
        CorruptState::Decode {
            artifact,
            reason: e.to_string(),
        }
        .into()
    })
}

fn check_len(artifact: &'static str, found: usize, expected: u64) -> Result<()> {
    if found as u64 != expected {
        return Err(CorruptState::LengthMismatch {
            artifact,
            found: found as u64,
            expected,
        }
        .into());
    }

    Ok(())
}
