use std::time::{Duration, Instant};

/// True on the steps that emit a metric record: 1, 1 + freq, 1 + 2 * freq, ...
#[inline]
pub fn should_log(step: u64, log_freq: u64) -> bool {
    step >= 1 && log_freq > 0 && (step - 1) % log_freq == 0
}

/// Local loss and throughput accumulated since the last log event.
#[derive(Debug, Clone)]
pub struct LogWindow {
    loss_sum: f64,
    loss_max: f64,
    count: u64,
    words: u64,
    started: Instant,
}

/// A closed window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub avg_loss: f64,
    pub max_loss: f64,
    pub steps: u64,
    pub words: u64,
    pub elapsed: Duration,
}

impl WindowStats {
    /// Words per second per model replica.
    pub fn wps(&self, model_parallel_size: usize) -> f64 {
        let secs = self.elapsed.as_secs_f64() * model_parallel_size.max(1) as f64;
        if secs > 0.0 {
            self.words as f64 / secs
        } else {
            0.0
        }
    }
}

impl LogWindow {
    pub fn new() -> Self {
        Self {
            loss_sum: 0.0,
            loss_max: f64::NEG_INFINITY,
            count: 0,
            words: 0,
            started: Instant::now(),
        }
    }

    pub fn push(&mut self, loss: f64, words: usize) {
        self.loss_sum += loss;
        self.loss_max = if loss.is_nan() || self.loss_max.is_nan() {
            f64::NAN
        } else {
            self.loss_max.max(loss)
        };
        self.count += 1;
        self.words += words as u64;
    }

    /// Closes the window and starts the next one.
    pub fn take(&mut self) -> WindowStats {
        let stats = WindowStats {
            avg_loss: if self.count > 0 {
                self.loss_sum / self.count as f64
            } else {
                f64::NAN
            },
            max_loss: self.loss_max,
            steps: self.count,
            words: self.words,
            elapsed: self.started.elapsed(),
        };

        *self = Self::new();
        stats
    }
}

impl Default for LogWindow {
    fn default() -> Self {
        Self::new()
    }
}
