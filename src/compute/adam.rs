/// Adam with optional decoupled weight decay (AdamW when `weight_decay > 0`).
#[derive(Debug, Clone, PartialEq)]
pub struct Adam {
    beta1: f64,
    beta2: f64,
    beta1_t: f64,
    beta2_t: f64,
    epsilon: f64,
    weight_decay: f64,
    v: Box<[f64]>,
    s: Box<[f64]>,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `weight_decay` - Decoupled decay coefficient, `0` for plain Adam.
    pub fn new(len: usize, weight_decay: f64) -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.95,
            beta1_t: 1.,
            beta2_t: 1.,
            epsilon: 1e-8,
            weight_decay,
            v: vec![0.; len].into_boxed_slice(),
            s: vec![0.; len].into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.v.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v.is_empty()
    }

    /// Applies one update with learning rate `lr`. `grad` and `params` must be `len` long.
    pub fn update_params(&mut self, grad: &[f64], params: &mut [f64], lr: f64) {
        let Self {
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            weight_decay: wd,
            ..
        } = *self;

        self.beta1_t *= b1;
        self.beta2_t *= b2;

        let bc1 = 1. - self.beta1_t;
        let bc2 = 1. - self.beta2_t;
        let step_size = lr * (bc2.sqrt() / bc1);

        params
            .iter_mut()
            .zip(grad)
            .zip(self.v.iter_mut())
            .zip(self.s.iter_mut())
            .for_each(|(((p, g), v), s)| {
                *p -= lr * wd * *p;
                *v = b1 * *v + (1. - b1) * g;
                *s = b2 * *s + (1. - b2) * g.powi(2);
                *p -= step_size * *v / (s.sqrt() + eps);
            });
    }

    /// Flattened moments and bias correction terms.
    pub fn export(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(2 + 2 * self.len());
        out.push(self.beta1_t);
        out.push(self.beta2_t);
        out.extend_from_slice(&self.v);
        out.extend_from_slice(&self.s);
        out
    }

    /// Inverse of [`Adam::export`]. Returns false if `state` has the wrong length.
    pub fn import(&mut self, state: &[f64]) -> bool {
        let len = self.len();
        if state.len() != 2 + 2 * len {
            return false;
        }

        self.beta1_t = state[0];
        self.beta2_t = state[1];
        self.v.copy_from_slice(&state[2..2 + len]);
        self.s.copy_from_slice(&state[2 + len..]);
        true
    }
}
