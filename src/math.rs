use ndarray::{Array1, Array2};

/// Predictions are clamped into this band before taking logs.
pub const EPSILON: f32 = 1e-7;

// sigmoid "clamps" values (in a fairly scaled way) to 0..1
pub fn sigmoid(x: &Array2<f32>) -> Array2<f32> {
  x.mapv(|v| 1.0 / (1.0 + (-v).exp()))
}

// derivative is taken on the activated values, not the logits
pub fn sigmoid_derivative(a: &Array2<f32>) -> Array2<f32> {
  a.mapv(|v| v * (1.0 - v))
}

pub fn relu(x: &Array2<f32>) -> Array2<f32> {
  x.mapv(|v| v.max(0.0))
}

pub fn relu_derivative(a: &Array2<f32>) -> Array2<f32> {
  a.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 })
}

/// Mean binary cross-entropy between probabilities and 0/1 targets.
///
/// Both inputs are column vectors (n x 1), one row per sample.
pub fn binary_cross_entropy(pred: &Array2<f32>, target: &Array2<f32>) -> f32 {
  let n = pred.len();
  if n == 0 {
    return 0.0;
  }
  let total: f32 = pred
    .iter()
    .zip(target.iter())
    .map(|(&p, &t)| {
      let p = p.clamp(EPSILON, 1.0 - EPSILON);
      -(t * p.ln() + (1.0 - t) * (1.0 - p).ln())
    })
    .sum();
  total / n as f32
}

/// Gradient of mean BCE with respect to the pre-sigmoid logits.
///
/// The sigmoid and the log cancel, leaving `(p - t) / n`.
pub fn bce_sigmoid_grad(pred: &Array2<f32>, target: &Array2<f32>) -> Array2<f32> {
  let n = pred.nrows().max(1) as f32;
  (pred - target) / n
}

/// Turn a 1-d vector into an n x 1 column.
pub fn column(v: &Array1<f32>) -> Array2<f32> {
  v.clone().insert_axis(ndarray::Axis(1))
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_relative_eq;
  use ndarray::array;

  #[test]
  fn sigmoid_is_half_at_zero() {
    let out = sigmoid(&array![[0.0], [100.0], [-100.0]]);
    assert_relative_eq!(out[[0, 0]], 0.5);
    assert_relative_eq!(out[[1, 0]], 1.0, epsilon = 1e-6);
    assert_relative_eq!(out[[2, 0]], 0.0, epsilon = 1e-6);
  }

  #[test]
  fn relu_zeroes_negatives() {
    let x = array![[-1.0, 0.0, 2.5]];
    assert_eq!(relu(&x), array![[0.0, 0.0, 2.5]]);
    assert_eq!(relu_derivative(&relu(&x)), array![[0.0, 0.0, 1.0]]);
  }

  #[test]
  fn bce_matches_hand_computation() {
    let pred = array![[0.9], [0.2]];
    let target = array![[1.0], [0.0]];
    let expected = -((0.9f32).ln() + (0.8f32).ln()) / 2.0;
    assert_relative_eq!(binary_cross_entropy(&pred, &target), expected, epsilon = 1e-6);
  }

  #[test]
  fn bce_is_finite_for_saturated_predictions() {
    let pred = array![[0.0], [1.0]];
    let target = array![[1.0], [0.0]];
    assert!(binary_cross_entropy(&pred, &target).is_finite());
  }

  #[test]
  fn bce_grad_matches_finite_difference() {
    let logits = array![[0.3], [-1.2], [2.0]];
    let target = array![[1.0], [0.0], [0.0]];
    let analytic = bce_sigmoid_grad(&sigmoid(&logits), &target);

    let h = 1e-3;
    for i in 0..3 {
      let mut up = logits.clone();
      up[[i, 0]] += h;
      let mut down = logits.clone();
      down[[i, 0]] -= h;
      let numeric = (binary_cross_entropy(&sigmoid(&up), &target)
        - binary_cross_entropy(&sigmoid(&down), &target))
        / (2.0 * h);
      assert_relative_eq!(analytic[[i, 0]], numeric, epsilon = 1e-3);
    }
  }
}
