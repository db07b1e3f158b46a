#![allow(dead_code)]

use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use mesh_train::{
    JobConfig,
    compute::{Compute, ComputeError, StepOutcome},
    data::Batch,
    metrics::{MemoryMonitor, MemorySample, MemoryUsage, MetricsRecord, MetricsSink},
};
use parking_lot::Mutex;

pub fn job(dump_folder: &Path, steps: i64, dp: usize) -> JobConfig {
    let raw = format!(
        r#"{{
            "model": {{ "kind": "bigram", "seed": 3 }},
            "optimizer": {{ "kind": "adamw", "lr": 0.01 }},
            "training": {{
                "dataset": {{ "kind": "synthetic", "tokens": 8192, "vocab_size": 24, "seed": 11 }},
                "batch_size": 4,
                "seq_len": 16,
                "steps": {steps},
                "warmup_steps": 2,
                "data_parallel_degree": {dp}
            }},
            "metrics": {{ "log_freq": 5 }}
        }}"#
    );

    let mut config = JobConfig::from_json(&raw).unwrap();
    config.job.dump_folder = dump_folder.to_path_buf();
    config
}

/// Records every metric record it receives, shared with the test.
#[derive(Clone, Default)]
pub struct RecordingSink {
    pub records: Arc<Mutex<Vec<(u64, MetricsRecord)>>>,
    pub resumed_at: Arc<Mutex<Option<u64>>>,
    pub closed: Arc<Mutex<bool>>,
}

impl RecordingSink {
    pub fn steps(&self) -> Vec<u64> {
        self.records.lock().iter().map(|(s, _)| *s).collect()
    }
}

impl MetricsSink for RecordingSink {
    fn log(&mut self, record: &MetricsRecord, step: u64) -> std::io::Result<()> {
        self.records.lock().push((step, record.clone()));
        Ok(())
    }

    fn resume(&mut self, step: u64) -> std::io::Result<()> {
        *self.resumed_at.lock() = Some(step);
        self.records.lock().retain(|(s, _)| *s <= step);
        Ok(())
    }

    fn close(&mut self) -> std::io::Result<()> {
        *self.closed.lock() = true;
        Ok(())
    }
}

pub struct FixedMemory;

impl MemoryMonitor for FixedMemory {
    fn sample(&mut self) -> MemorySample {
        let usage = MemoryUsage {
            active: 1.0,
            allocated: 0.5,
            reserved: 2.0,
        };
        MemorySample {
            current: usage,
            peak: usage,
        }
    }

    fn reset_peak(&mut self) {}
}

/// A compute whose loss, skips and failures are scripted by step.
pub struct ScriptedCompute {
    pub step: u64,
    pub skip_at: Vec<u64>,
    pub fail_at: Option<u64>,
    /// Holds the process up for a while during one step, like a slow kernel would.
    pub stall_at: Option<(u64, Duration)>,
    pub schedule_steps: Arc<AtomicU64>,
}

impl ScriptedCompute {
    pub fn new() -> Self {
        Self {
            step: 0,
            skip_at: Vec::new(),
            fail_at: None,
            stall_at: None,
            schedule_steps: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl Compute for ScriptedCompute {
    fn forward_backward(&mut self, batch: &Batch) -> Result<StepOutcome, ComputeError> {
        self.step += 1;
        if let Some((step, stall)) = self.stall_at
            && step == self.step
        {
            std::thread::sleep(stall);
        }
        if self.fail_at == Some(self.step) {
            return Err(ComputeError::ShapeMismatch {
                inputs: batch.input_ids.len(),
                labels: 0,
            });
        }

        Ok(StepOutcome {
            loss: 10.0 / self.step as f64,
            skipped: self.skip_at.contains(&self.step),
        })
    }

    fn schedule_step(&mut self) {
        self.schedule_steps.fetch_add(1, Ordering::SeqCst);
    }

    fn learning_rate(&self) -> f64 {
        0.1
    }

    fn parameter_count(&self) -> usize {
        1
    }

    fn model_state(&self) -> Vec<u8> {
        self.step.to_le_bytes().to_vec()
    }

    fn optimizer_state(&self) -> Vec<u8> {
        Vec::new()
    }

    fn load_state(&mut self, model: &[u8], _optimizer: &[u8]) -> Result<(), ComputeError> {
        let bytes: [u8; 8] = model.try_into().map_err(|_| ComputeError::StateSize {
            artifact: "model",
            found: model.len(),
            expected: 8,
        })?;
        self.step = u64::from_le_bytes(bytes);
        Ok(())
    }
}
