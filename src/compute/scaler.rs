/// Dynamic loss scaling.
///
/// Gradients are computed on `loss * scale` and unscaled before the update. A step whose
/// unscaled gradients are not finite is skipped and the scale backs off; after
/// `growth_interval` consecutive clean steps the scale grows again.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradScaler {
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: u64,
    clean_steps: u64,
}

impl GradScaler {
    pub fn new(init_scale: f64, growth_interval: u64) -> Self {
        Self {
            scale: init_scale,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: growth_interval.max(1),
            clean_steps: 0,
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Divides the scaled gradients by the scale in place.
    ///
    /// # Returns
    /// True if every unscaled value is finite.
    pub fn unscale(&self, grads: &mut [f64]) -> bool {
        let inv = 1.0 / self.scale;
        let mut finite = true;
        for g in grads.iter_mut() {
            *g *= inv;
            finite &= g.is_finite();
        }
        finite
    }

    /// Records the outcome of a step and adjusts the scale.
    pub fn update(&mut self, found_non_finite: bool) {
        if found_non_finite {
            self.scale *= self.backoff_factor;
            self.clean_steps = 0;
            return;
        }

        self.clean_steps += 1;
        if self.clean_steps == self.growth_interval {
            self.scale *= self.growth_factor;
            self.clean_steps = 0;
        }
    }

    pub fn export(&self) -> [f64; 2] {
        [self.scale, self.clean_steps as f64]
    }

    pub fn import(&mut self, state: [f64; 2]) {
        self.scale = state[0];
        self.clean_steps = state[1] as u64;
    }
}

impl Default for GradScaler {
    fn default() -> Self {
        Self::new(65536.0, 2000)
    }
}
