use rand::{Rng, SeedableRng, rngs::StdRng};

use super::{Adam, Compute, ComputeError, GradScaler, LinearSchedule, StepOutcome};
use crate::{
    config::{ModelSpec, OptimizerSpec, TrainingConfig},
    data::Batch,
};

/// Optimizer state layout: scheduler step, scaler state, then the Adam state.
const OPTIMIZER_HEADER: usize = 3;

/// A next-token logit table: row `x` holds the logits of the token that follows `x`.
#[derive(Debug, Clone)]
pub struct BigramModel {
    vocab_size: usize,
    logits: Vec<f64>,
    grads: Vec<f64>,
    optimizer: Adam,
    scaler: GradScaler,
    schedule: LinearSchedule,
    max_grad_norm: f64,
}

impl BigramModel {
    /// Creates a model with weights drawn uniformly from `[-init_scale, init_scale]`.
    pub fn new(
        vocab_size: usize,
        init_scale: f64,
        seed: u64,
        optimizer: Adam,
        schedule: LinearSchedule,
        max_grad_norm: f64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let len = vocab_size * vocab_size;
        let logits = (0..len)
            .map(|_| rng.random_range(-1.0..=1.0) * init_scale)
            .collect();

        Self {
            vocab_size,
            logits,
            grads: vec![0.0; len],
            optimizer,
            scaler: GradScaler::default(),
            schedule,
            max_grad_norm,
        }
    }

    /// Builds the model a job configuration describes for a corpus of `vocab_size` tokens.
    pub fn from_config(
        model: &ModelSpec,
        optimizer: &OptimizerSpec,
        training: &TrainingConfig,
        vocab_size: usize,
    ) -> Self {
        let len = vocab_size * vocab_size;
        let adam = match *optimizer {
            OptimizerSpec::Adam { .. } => Adam::new(len, 0.0),
            OptimizerSpec::AdamW { weight_decay, .. } => Adam::new(len, weight_decay),
        };

        let total = match training.steps {
            crate::config::TotalSteps::Bounded(n) => Some(n.get()),
            crate::config::TotalSteps::Unbounded => None,
        };
        let schedule = LinearSchedule::new(optimizer.lr(), training.warmup_steps, total);

        match *model {
            ModelSpec::Bigram { init_scale, seed } => Self::new(
                vocab_size,
                init_scale,
                seed,
                adam,
                schedule,
                training.max_grad_norm,
            ),
        }
    }

    pub fn with_scaler(mut self, scaler: GradScaler) -> Self {
        self.scaler = scaler;
        self
    }

    pub fn scaler(&self) -> &GradScaler {
        &self.scaler
    }

    pub fn logits(&self) -> &[f64] {
        &self.logits
    }

    /// Accumulates `scale * d(mean cross entropy)/d(logits)` into `self.grads`.
    fn backward(&mut self, batch: &Batch) -> Result<f64, ComputeError> {
        let v = self.vocab_size;
        let n = batch.input_ids.len();
        let scale = self.scaler.scale();
        let mut total = 0.0;
        let mut probs = vec![0.0; v];

        self.grads.iter_mut().for_each(|g| *g = 0.0);

        for (&x, &y) in batch.input_ids.iter().zip(&batch.labels) {
            let (x, y) = (self.index(x)?, self.index(y)?);
            let row = &self.logits[x * v..(x + 1) * v];

            let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let mut sum = 0.0;
            for (p, &l) in probs.iter_mut().zip(row) {
                *p = (l - max).exp();
                sum += *p;
            }
            probs.iter_mut().for_each(|p| *p /= sum);

            total -= probs[y].ln();

            let grad_row = &mut self.grads[x * v..(x + 1) * v];
            for (j, (g, &p)) in grad_row.iter_mut().zip(&probs).enumerate() {
                let target = if j == y { 1.0 } else { 0.0 };
                *g += scale * (p - target) / n as f64;
            }
        }

        Ok(total / n as f64)
    }

    fn index(&self, token: u32) -> Result<usize, ComputeError> {
        let t = token as usize;
        if t >= self.vocab_size {
            return Err(ComputeError::TokenOutOfRange {
                token,
                vocab_size: self.vocab_size,
            });
        }
        Ok(t)
    }

    fn clip_grads(&mut self) {
        let norm = self.grads.iter().map(|g| g * g).sum::<f64>().sqrt();
        if norm > self.max_grad_norm {
            let coef = self.max_grad_norm / (norm + 1e-6);
            self.grads.iter_mut().for_each(|g| *g *= coef);
        }
    }
}

impl Compute for BigramModel {
    fn forward_backward(&mut self, batch: &Batch) -> Result<StepOutcome, ComputeError> {
        if batch.input_ids.len() != batch.labels.len() {
            return Err(ComputeError::ShapeMismatch {
                inputs: batch.input_ids.len(),
                labels: batch.labels.len(),
            });
        }

        let loss = self.backward(batch)?;
        let finite = self.scaler.unscale(&mut self.grads);

        if finite {
            self.clip_grads();
            let lr = self.schedule.lr();
            self.optimizer
                .update_params(&self.grads, &mut self.logits, lr);
        }
        self.scaler.update(!finite);

        Ok(StepOutcome {
            loss,
            skipped: !finite,
        })
    }

    fn schedule_step(&mut self) {
        self.schedule.step();
    }

    fn learning_rate(&self) -> f64 {
        self.schedule.lr()
    }

    fn parameter_count(&self) -> usize {
        self.logits.len()
    }

    fn model_state(&self) -> Vec<u8> {
        bytemuck::cast_slice(self.logits.as_slice()).to_vec()
    }

    fn optimizer_state(&self) -> Vec<u8> {
        let [scale, clean] = self.scaler.export();
        let mut state = vec![self.schedule.current() as f64, scale, clean];
        state.extend(self.optimizer.export());
        bytemuck::cast_slice(state.as_slice()).to_vec()
    }

    fn load_state(&mut self, model: &[u8], optimizer: &[u8]) -> Result<(), ComputeError> {
        let expected = self.logits.len() * size_of::<f64>();
        if model.len() != expected {
            return Err(ComputeError::StateSize {
                artifact: "model",
                found: model.len(),
                expected,
            });
        }

        let expected = (OPTIMIZER_HEADER + self.optimizer.export().len()) * size_of::<f64>();
        if optimizer.len() != expected {
            return Err(ComputeError::StateSize {
                artifact: "optimizer",
                found: optimizer.len(),
                expected,
            });
        }

        let state: Vec<f64> = bytemuck::pod_collect_to_vec(optimizer);
        self.optimizer.import(&state[OPTIMIZER_HEADER..]);
        self.schedule.set_current(state[0] as u64);
        self.scaler.import([state[1], state[2]]);
        self.logits = bytemuck::pod_collect_to_vec(model);
        Ok(())
    }
}
