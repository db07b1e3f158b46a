use std::{
    fs,
    num::NonZeroU64,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{checkpoint::IntervalType, error::ConfigError};

/// Largest synthetic vocabulary. The bigram table holds its square in `f64`s.
pub const MAX_VOCAB_SIZE: usize = 1 << 16;

/// A whole training job, as read from its JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    #[serde(default)]
    pub job: JobSection,
    pub model: ModelSpec,
    pub optimizer: OptimizerSpec,
    pub training: TrainingConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSection {
    #[serde(default = "defaults::description")]
    pub description: String,
    #[serde(default = "defaults::dump_folder")]
    pub dump_folder: PathBuf,
}

impl Default for JobSection {
    fn default() -> Self {
        Self {
            description: defaults::description(),
            dump_folder: defaults::dump_folder(),
        }
    }
}

/// The supported models. The set is closed: an unknown `kind` fails deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSpec {
    /// Next-token logit table over the corpus vocabulary.
    Bigram {
        #[serde(default = "defaults::init_scale")]
        init_scale: f64,
        #[serde(default)]
        seed: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerSpec {
    Adam {
        lr: f64,
    },
    #[serde(rename = "adamw")]
    AdamW {
        lr: f64,
        #[serde(default = "defaults::weight_decay")]
        weight_decay: f64,
    },
}

impl OptimizerSpec {
    pub fn lr(&self) -> f64 {
        match *self {
            Self::Adam { lr } | Self::AdamW { lr, .. } => lr,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatasetSpec {
    /// A seeded, learnable token stream.
    Synthetic {
        tokens: usize,
        vocab_size: usize,
        #[serde(default)]
        seed: u64,
    },
    /// The bytes of a file, one token per byte.
    Bytes { path: PathBuf },
}

/// Total steps of the run; `-1` in the file means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum TotalSteps {
    Bounded(NonZeroU64),
    Unbounded,
}

impl TotalSteps {
    pub fn is_final(&self, step: u64) -> bool {
        matches!(self, Self::Bounded(total) if total.get() == step)
    }

    pub fn reached(&self, step: u64) -> bool {
        matches!(self, Self::Bounded(total) if step >= total.get())
    }
}

impl TryFrom<i64> for TotalSteps {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::Unbounded),
            v => u64::try_from(v)
                .ok()
                .and_then(NonZeroU64::new)
                .map(Self::Bounded)
                .ok_or_else(|| format!("steps must be positive or -1, got {v}")),
        }
    }
}

impl From<TotalSteps> for i64 {
    fn from(value: TotalSteps) -> Self {
        match value {
            TotalSteps::Bounded(n) => i64::try_from(n.get()).unwrap_or(i64::MAX),
            TotalSteps::Unbounded => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingConfig {
    pub dataset: DatasetSpec,
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,
    #[serde(default = "defaults::seq_len")]
    pub seq_len: usize,
    pub steps: TotalSteps,
    #[serde(default = "defaults::warmup_steps")]
    pub warmup_steps: u64,
    #[serde(default = "defaults::max_grad_norm")]
    pub max_grad_norm: f64,
    #[serde(default = "defaults::degree")]
    pub data_parallel_degree: usize,
    #[serde(default = "defaults::degree")]
    pub sequence_parallel_degree: usize,
    #[serde(default = "defaults::degree")]
    pub pipeline_parallel_degree: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointConfig {
    /// Resolved against the dump folder. Empty disables checkpointing.
    #[serde(default)]
    pub folder: String,
    #[serde(default)]
    pub interval_type: IntervalType,
    #[serde(default = "defaults::checkpoint_interval")]
    pub interval: u64,
    #[serde(default = "defaults::keep_latest")]
    pub keep_latest: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            folder: String::new(),
            interval_type: IntervalType::Steps,
            interval: defaults::checkpoint_interval(),
            keep_latest: defaults::keep_latest(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    #[default]
    Jsonl,
    Log,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default = "defaults::log_freq")]
    pub log_freq: u64,
    #[serde(default)]
    pub sink: SinkKind,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            log_freq: defaults::log_freq(),
            sink: SinkKind::default(),
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    pub fn description() -> String {
        "training job".into()
    }

    pub fn dump_folder() -> PathBuf {
        PathBuf::from("./outputs")
    }

    pub fn init_scale() -> f64 {
        0.02
    }

    pub fn weight_decay() -> f64 {
        0.01
    }

    pub fn batch_size() -> usize {
        8
    }

    pub fn seq_len() -> usize {
        64
    }

    pub fn warmup_steps() -> u64 {
        200
    }

    pub fn max_grad_norm() -> f64 {
        1.0
    }

    pub fn degree() -> usize {
        1
    }

    pub fn checkpoint_interval() -> u64 {
        500
    }

    pub fn keep_latest() -> usize {
        3
    }

    pub fn log_freq() -> u64 {
        10
    }
}

impl JobConfig {
    /// Reads and validates the job file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_json(&raw)?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every bound that deserialization alone cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.training;

        positive("training.batch_size", t.batch_size as f64)?;
        positive("training.seq_len", t.seq_len as f64)?;
        positive("training.max_grad_norm", t.max_grad_norm)?;
        positive("optimizer.lr", self.optimizer.lr())?;
        positive("metrics.log_freq", self.metrics.log_freq as f64)?;

        if let OptimizerSpec::AdamW { weight_decay, .. } = self.optimizer
            && !(weight_decay.is_finite() && weight_decay >= 0.0)
        {
            return Err(invalid("optimizer.weight_decay", "must be finite and non-negative"));
        }

        match &t.dataset {
            DatasetSpec::Synthetic {
                tokens, vocab_size, ..
            } => {
                if *vocab_size < 2 {
                    return Err(invalid("training.dataset.vocab_size", "must be at least 2"));
                }
                if *vocab_size > MAX_VOCAB_SIZE {
                    return Err(ConfigError::InvalidValue {
                        field: "training.dataset.vocab_size",
                        reason: format!("must be at most {MAX_VOCAB_SIZE}, got {vocab_size}"),
                    });
                }
                if *tokens <= t.seq_len {
                    return Err(invalid(
                        "training.dataset.tokens",
                        "must be longer than training.seq_len",
                    ));
                }
            }
            DatasetSpec::Bytes { path } if path.as_os_str().is_empty() => {
                return Err(invalid("training.dataset.path", "must not be empty"));
            }
            DatasetSpec::Bytes { .. } => {}
        }

        let c = &self.checkpoint;
        if !c.folder.is_empty() {
            positive("checkpoint.interval", c.interval as f64)?;
            if c.keep_latest < 2 {
                return Err(invalid(
                    "checkpoint.keep_latest",
                    "must keep at least 2 checkpoints",
                ));
            }
        }

        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field,
            reason: format!("must be positive, got {value}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "model": { "kind": "bigram" },
        "optimizer": { "kind": "adamw", "lr": 0.001 },
        "training": {
            "dataset": { "kind": "synthetic", "tokens": 4096, "vocab_size": 16 },
            "steps": 100
        }
    }"#;

    #[test]
    fn minimal_job_uses_defaults() {
        let config = JobConfig::from_json(MINIMAL).unwrap();

        assert_eq!(
            config.training.steps,
            TotalSteps::Bounded(NonZeroU64::new(100).unwrap())
        );
        assert_eq!(config.training.data_parallel_degree, 1);
        assert_eq!(config.metrics.log_freq, 10);
        assert_eq!(config.checkpoint.folder, "");
        assert_eq!(config.checkpoint.keep_latest, 3);
        assert_eq!(config.job.dump_folder, PathBuf::from("./outputs"));
        assert_eq!(
            config.optimizer,
            OptimizerSpec::AdamW {
                lr: 0.001,
                weight_decay: 0.01
            }
        );
    }

    #[test]
    fn minus_one_steps_is_unbounded() {
        let raw = MINIMAL.replace(r#""steps": 100"#, r#""steps": -1"#);
        let config = JobConfig::from_json(&raw).unwrap();
        assert_eq!(config.training.steps, TotalSteps::Unbounded);
        assert!(!config.training.steps.reached(u64::MAX));

        let back = serde_json::to_value(config.training.steps).unwrap();
        assert_eq!(back, serde_json::json!(-1));
    }

    #[test]
    fn zero_or_negative_steps_are_rejected() {
        for steps in ["0", "-2"] {
            let raw = MINIMAL.replace("100", steps);
            assert!(matches!(
                JobConfig::from_json(&raw),
                Err(ConfigError::Parse(_))
            ));
        }
    }

    #[test]
    fn unknown_kinds_and_fields_are_rejected() {
        let raw = MINIMAL.replace(r#""kind": "bigram""#, r#""kind": "llama3""#);
        assert!(JobConfig::from_json(&raw).is_err());

        let raw = MINIMAL.replace(r#""kind": "adamw""#, r#""kind": "sgd""#);
        assert!(JobConfig::from_json(&raw).is_err());

        let raw = MINIMAL.replace(r#""steps": 100"#, r#""steps": 100, "compile": true"#);
        assert!(JobConfig::from_json(&raw).is_err());
    }

    #[test]
    fn checkpoint_section_parses_interval_type() {
        let raw = MINIMAL.replacen(
            "\"model\"",
            r#""checkpoint": { "folder": "ckpt", "interval_type": "seconds", "interval": 300 },
            "model""#,
            1,
        );
        let config = JobConfig::from_json(&raw).unwrap();
        assert_eq!(config.checkpoint.interval_type, IntervalType::Seconds);
        assert_eq!(config.checkpoint.interval, 300);
    }

    #[test]
    fn validate_reports_the_offending_field() {
        let raw = MINIMAL.replace(r#""lr": 0.001"#, r#""lr": 0.0"#);
        assert!(matches!(
            JobConfig::from_json(&raw),
            Err(ConfigError::InvalidValue {
                field: "optimizer.lr",
                ..
            })
        ));

        let raw = MINIMAL.replace(r#""steps": 100"#, r#""steps": 100, "max_grad_norm": -1.0"#);
        assert!(matches!(
            JobConfig::from_json(&raw),
            Err(ConfigError::InvalidValue {
                field: "training.max_grad_norm",
                ..
            })
        ));

        let raw = MINIMAL.replace(r#""vocab_size": 16"#, r#""vocab_size": 4294967297"#);
        assert!(matches!(
            JobConfig::from_json(&raw),
            Err(ConfigError::InvalidValue {
                field: "training.dataset.vocab_size",
                ..
            })
        ));

        let raw = MINIMAL.replacen(
            "\"model\"",
            r#""checkpoint": { "folder": "ckpt", "keep_latest": 1 }, "model""#,
            1,
        );
        assert!(matches!(
            JobConfig::from_json(&raw),
            Err(ConfigError::InvalidValue {
                field: "checkpoint.keep_latest",
                ..
            })
        ));
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        fs::write(&path, MINIMAL).unwrap();
        JobConfig::load(&path).unwrap();

        assert!(matches!(
            JobConfig::load(dir.path().join("missing.json")),
            Err(ConfigError::Read { .. })
        ));
    }
}
