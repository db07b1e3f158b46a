/// Linear warmup to the peak learning rate, then linear decay to zero at the last step.
///
/// Without a last step the rate stays at its peak after warmup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearSchedule {
    peak_lr: f64,
    warmup_steps: u64,
    total_steps: Option<u64>,
    current: u64,
}

impl LinearSchedule {
    pub fn new(peak_lr: f64, warmup_steps: u64, total_steps: Option<u64>) -> Self {
        Self {
            peak_lr,
            warmup_steps,
            total_steps,
            current: 0,
        }
    }

    pub fn step(&mut self) {
        self.current += 1;
    }

    /// Schedule steps taken so far.
    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn set_current(&mut self, current: u64) {
        self.current = current;
    }

    pub fn lr(&self) -> f64 {
        self.peak_lr * self.factor()
    }

    fn factor(&self) -> f64 {
        let s = self.current;
        if s < self.warmup_steps {
            return (s + 1) as f64 / (self.warmup_steps + 1) as f64;
        }

        match self.total_steps {
            Some(total) if total > self.warmup_steps => {
                let decay_steps = (total - self.warmup_steps) as f64;
                let progress = (s - self.warmup_steps) as f64 / decay_steps;
                (1.0 - progress).max(0.0)
            }
            _ => 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warms_up_then_decays() {
        let mut s = LinearSchedule::new(1.0, 3, Some(7));
        let mut lrs = Vec::new();
        for _ in 0..8 {
            lrs.push(s.lr());
            s.step();
        }

        assert_eq!(lrs[..3], [0.25, 0.5, 0.75]);
        assert_eq!(lrs[3], 1.0);
        assert_eq!(lrs[5], 0.5);
        assert_eq!(lrs[7], 0.0);
    }

    #[test]
    fn unbounded_run_holds_the_peak() {
        let mut s = LinearSchedule::new(0.1, 0, None);
        for _ in 0..100 {
            s.step();
        }
        assert_eq!(s.lr(), 0.1);
    }
}
