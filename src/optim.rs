//! Adam optimizer over ndarray parameters

use ndarray::Array2;

/// Adam optimizer (Adaptive Moment Estimation)
///
/// Moments are kept per parameter slot, so one instance must always be
/// stepped with the same parameter list in the same order.
pub struct Adam {
  lr: f32,
  beta1: f32,
  beta2: f32,
  epsilon: f32,
  t: i32,
  m: Vec<Array2<f32>>, // First moment
  v: Vec<Array2<f32>>, // Second moment
}

impl Adam {
  pub fn new(lr: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
    Self {
      lr,
      beta1,
      beta2,
      epsilon,
      t: 0,
      m: Vec::new(),
      v: Vec::new(),
    }
  }

  /// Adam with beta1 = 0.9, beta2 = 0.999, eps = 1e-8
  pub fn default_params(lr: f32) -> Self {
    Self::new(lr, 0.9, 0.999, 1e-8)
  }

  pub fn lr(&self) -> f32 {
    self.lr
  }

  pub fn steps(&self) -> i32 {
    self.t
  }

  fn ensure_moments(&mut self, grads: &[Array2<f32>]) {
    if self.m.len() != grads.len() {
      self.m = grads.iter().map(|g| Array2::zeros(g.dim())).collect();
      self.v = grads.iter().map(|g| Array2::zeros(g.dim())).collect();
    }
  }

  pub fn step(&mut self, params: &mut [&mut Array2<f32>], grads: &[Array2<f32>]) {
    debug_assert_eq!(params.len(), grads.len());
    self.ensure_moments(grads);
    self.t += 1;

    // Bias correction folded into the step size
    let lr_t =
      self.lr * (1.0 - self.beta2.powi(self.t)).sqrt() / (1.0 - self.beta1.powi(self.t));

    for (i, (param, grad)) in params.iter_mut().zip(grads).enumerate() {
      // m_t = β1 * m_{t-1} + (1 - β1) * g
      self.m[i] = &self.m[i] * self.beta1 + grad * (1.0 - self.beta1);
      // v_t = β2 * v_{t-1} + (1 - β2) * g²
      self.v[i] = &self.v[i] * self.beta2 + &grad.mapv(|g| g * g) * (1.0 - self.beta2);

      // θ_t = θ_{t-1} - lr_t * m_t / (√v_t + ε)
      let update = &self.m[i] / &self.v[i].mapv(|v| v.sqrt() + self.epsilon) * lr_t;
      **param -= &update;
    }
  }
}
