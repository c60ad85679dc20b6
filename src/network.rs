//! Fully connected networks with a single sigmoid output.
//!
//! Rows are samples throughout: a batch of `n` inputs with `d` features is an
//! `n x d` matrix, and each layer computes `act(x . W + b)` with `W` shaped
//! `fan_in x fan_out`.

use ndarray::{Array1, Array2, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::{Rng, RngCore};

use crate::math::{relu, relu_derivative, sigmoid, sigmoid_derivative};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
  Relu,
  Sigmoid,
}

impl Activation {
  fn apply(self, z: &Array2<f32>) -> Array2<f32> {
    match self {
      Activation::Relu => relu(z),
      Activation::Sigmoid => sigmoid(z),
    }
  }

  // derivative evaluated on the activated values
  fn derivative(self, a: &Array2<f32>) -> Array2<f32> {
    match self {
      Activation::Relu => relu_derivative(a),
      Activation::Sigmoid => sigmoid_derivative(a),
    }
  }
}

#[derive(Debug, Clone)]
pub struct Dense {
  pub weight: Array2<f32>,
  /// 1 x fan_out, broadcast over rows.
  pub bias: Array2<f32>,
  pub activation: Activation,
}

impl Dense {
  /// Glorot-uniform weights, zero bias.
  pub fn new<R: Rng + ?Sized>(
    fan_in: usize,
    fan_out: usize,
    activation: Activation,
    rng: &mut R,
  ) -> Self {
    let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
    Dense {
      weight: Array2::random_using((fan_in, fan_out), Uniform::new(-limit, limit), rng),
      bias: Array2::zeros((1, fan_out)),
      activation,
    }
  }

  pub fn fan_in(&self) -> usize {
    self.weight.nrows()
  }

  pub fn fan_out(&self) -> usize {
    self.weight.ncols()
  }
}

pub enum Mode<'a> {
  /// Dropout active, masks drawn from the given generator.
  Train(&'a mut dyn RngCore),
  Eval,
}

/// Everything `backward` needs from a forward pass.
pub struct ForwardPass {
  /// Input fed to each layer (after the previous layer's dropout).
  inputs: Vec<Array2<f32>>,
  /// Activated output of each layer, before dropout.
  activations: Vec<Array2<f32>>,
  /// Inverted-dropout mask applied after each layer, if any.
  masks: Vec<Option<Array2<f32>>>,
}

impl ForwardPass {
  /// Sigmoid output, n x 1.
  pub fn output(&self) -> &Array2<f32> {
    // every Mlp has at least its output layer
    &self.activations[self.activations.len() - 1]
  }
}

pub struct Gradients {
  pub weights: Vec<Array2<f32>>,
  pub biases: Vec<Array2<f32>>,
  /// Gradient with respect to the network input.
  pub input: Array2<f32>,
}

impl Gradients {
  /// Parameter gradients in the order of `Mlp::parameters_mut`.
  pub fn into_flat(self) -> Vec<Array2<f32>> {
    self
      .weights
      .into_iter()
      .zip(self.biases)
      .flat_map(|(w, b)| [w, b])
      .collect()
  }
}

#[derive(Debug, Clone)]
pub struct Mlp {
  layers: Vec<Dense>,
  dropout: f32,
}

impl Mlp {
  /// ReLU hidden layers of the given widths, then one sigmoid unit.
  pub fn new<R: Rng + ?Sized>(input: usize, hidden: &[usize], dropout: f32, rng: &mut R) -> Self {
    let mut layers = Vec::with_capacity(hidden.len() + 1);
    let mut fan_in = input;
    for &width in hidden {
      layers.push(Dense::new(fan_in, width, Activation::Relu, rng));
      fan_in = width;
    }
    layers.push(Dense::new(fan_in, 1, Activation::Sigmoid, rng));
    Mlp { layers, dropout }
  }

  /// Rebuild from existing layers, e.g. loaded weights.
  pub fn from_layers(layers: Vec<Dense>, dropout: f32) -> Self {
    Mlp { layers, dropout }
  }

  /// (fan_in, fan_out) of every layer for the given architecture.
  pub fn layer_shapes(input: usize, hidden: &[usize]) -> Vec<(usize, usize)> {
    let mut shapes = Vec::with_capacity(hidden.len() + 1);
    let mut fan_in = input;
    for &width in hidden.iter().chain(std::iter::once(&1)) {
      shapes.push((fan_in, width));
      fan_in = width;
    }
    shapes
  }

  pub fn layers(&self) -> &[Dense] {
    &self.layers
  }

  pub fn dropout(&self) -> f32 {
    self.dropout
  }

  pub fn input_size(&self) -> usize {
    self.layers.first().map_or(0, Dense::fan_in)
  }

  pub fn forward(&self, x: &Array2<f32>, mut mode: Mode<'_>) -> ForwardPass {
    let depth = self.layers.len();
    let mut inputs = Vec::with_capacity(depth);
    let mut activations = Vec::with_capacity(depth);
    let mut masks = Vec::with_capacity(depth);

    let mut current = x.clone();
    for (i, layer) in self.layers.iter().enumerate() {
      let z = current.dot(&layer.weight) + &layer.bias;
      let a = layer.activation.apply(&z);

      let is_hidden = i + 1 < depth;
      let mask = match &mut mode {
        Mode::Train(rng) if is_hidden && self.dropout > 0.0 => {
          let keep = 1.0 - self.dropout;
          Some(Array2::from_shape_fn(a.dim(), |_| {
            if rng.gen::<f32>() < keep {
              1.0 / keep
            } else {
              0.0
            }
          }))
        }
        _ => None,
      };

      let next = match &mask {
        Some(m) => &a * m,
        None => a.clone(),
      };
      inputs.push(std::mem::replace(&mut current, next));
      activations.push(a);
      masks.push(mask);
    }

    ForwardPass {
      inputs,
      activations,
      masks,
    }
  }

  /// Eval-mode probabilities, one per row.
  pub fn predict(&self, x: &Array2<f32>) -> Array1<f32> {
    self.forward(x, Mode::Eval).output().column(0).to_owned()
  }

  /// Backpropagate from the gradient of the loss with respect to the final
  /// pre-sigmoid logits (n x 1).
  pub fn backward(&self, pass: &ForwardPass, grad_logits: &Array2<f32>) -> Gradients {
    let depth = self.layers.len();
    let mut weights = vec![Array2::zeros((0, 0)); depth];
    let mut biases = vec![Array2::zeros((0, 0)); depth];

    let mut delta = grad_logits.clone();
    for l in (1..depth).rev() {
      weights[l] = pass.inputs[l].t().dot(&delta);
      biases[l] = delta.sum_axis(Axis(0)).insert_axis(Axis(0));

      let mut g = delta.dot(&self.layers[l].weight.t());
      if let Some(mask) = &pass.masks[l - 1] {
        g = g * mask;
      }
      delta = g * self.layers[l - 1].activation.derivative(&pass.activations[l - 1]);
    }
    weights[0] = pass.inputs[0].t().dot(&delta);
    biases[0] = delta.sum_axis(Axis(0)).insert_axis(Axis(0));
    let grad_input = delta.dot(&self.layers[0].weight.t());

    Gradients {
      weights,
      biases,
      input: grad_input,
    }
  }

  /// Weights and biases interleaved: w0, b0, w1, b1, ...
  pub fn parameters(&self) -> Vec<&Array2<f32>> {
    self
      .layers
      .iter()
      .flat_map(|l| [&l.weight, &l.bias])
      .collect()
  }

  pub fn parameters_mut(&mut self) -> Vec<&mut Array2<f32>> {
    self
      .layers
      .iter_mut()
      .flat_map(|l| [&mut l.weight, &mut l.bias])
      .collect()
  }

  pub fn num_parameters(&self) -> usize {
    self.parameters().iter().map(|p| p.len()).sum()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::math::{binary_cross_entropy, bce_sigmoid_grad};
  use approx::assert_relative_eq;
  use ndarray::array;
  use rand::rngs::StdRng;
  use rand::SeedableRng;

  fn loss(net: &Mlp, x: &Array2<f32>, y: &Array2<f32>) -> f32 {
    binary_cross_entropy(net.forward(x, Mode::Eval).output(), y)
  }

  #[test]
  fn shapes_follow_architecture() {
    let mut rng = StdRng::seed_from_u64(0);
    let net = Mlp::new(5, &[32, 32, 32], 0.2, &mut rng);
    assert_eq!(net.layers().len(), 4);
    assert_eq!(
      Mlp::layer_shapes(5, &[32, 32, 32]),
      vec![(5, 32), (32, 32), (32, 32), (32, 1)]
    );
    assert_eq!(net.num_parameters(), 5 * 32 + 32 + 2 * (32 * 32 + 32) + 32 + 1);

    let x = Array2::zeros((7, 5));
    let out = net.predict(&x);
    assert_eq!(out.len(), 7);
    assert!(out.iter().all(|&p| (0.0..=1.0).contains(&p)));
  }

  #[test]
  fn glorot_limits_are_respected() {
    let mut rng = StdRng::seed_from_u64(1);
    let layer = Dense::new(10, 6, Activation::Relu, &mut rng);
    let limit = (6.0f32 / 16.0).sqrt();
    assert!(layer.weight.iter().all(|w| w.abs() <= limit));
    assert!(layer.bias.iter().all(|&b| b == 0.0));
  }

  #[test]
  fn eval_mode_is_deterministic() {
    let mut rng = StdRng::seed_from_u64(2);
    let net = Mlp::new(3, &[8], 0.5, &mut rng);
    let x = array![[0.1, -0.4, 2.0], [1.0, 1.0, 1.0]];
    assert_eq!(net.predict(&x), net.predict(&x));
  }

  #[test]
  fn dropout_masks_are_scaled() {
    let mut rng = StdRng::seed_from_u64(3);
    let net = Mlp::new(4, &[64], 0.5, &mut rng);
    let x = Array2::ones((16, 4));
    let pass = net.forward(&x, Mode::Train(&mut rng));
    let mask = pass.masks[0].as_ref().unwrap();
    assert!(mask.iter().all(|&m| m == 0.0 || m == 2.0));
    assert!(mask.iter().any(|&m| m == 0.0));
    assert!(pass.masks[1].is_none());
  }

  #[test]
  fn gradients_match_finite_differences() {
    let mut rng = StdRng::seed_from_u64(4);
    let net = Mlp::new(3, &[5, 4], 0.0, &mut rng);
    let x = array![[0.5, -1.0, 0.3], [1.5, 0.2, -0.7], [-0.3, 0.8, 1.1]];
    let y = array![[1.0], [0.0], [1.0]];

    let pass = net.forward(&x, Mode::Eval);
    let grads = net.backward(&pass, &bce_sigmoid_grad(pass.output(), &y));

    let h = 1e-3;
    for (l, gw) in grads.weights.iter().enumerate() {
      for ((i, j), &analytic) in gw.indexed_iter() {
        let mut up = net.clone();
        up.layers[l].weight[[i, j]] += h;
        let mut down = net.clone();
        down.layers[l].weight[[i, j]] -= h;
        let numeric = (loss(&up, &x, &y) - loss(&down, &x, &y)) / (2.0 * h);
        assert_relative_eq!(analytic, numeric, epsilon = 2e-3);
      }
    }

    for ((i, j), &analytic) in grads.input.indexed_iter() {
      let mut up = x.clone();
      up[[i, j]] += h;
      let mut down = x.clone();
      down[[i, j]] -= h;
      let numeric = (loss(&net, &up, &y) - loss(&net, &down, &y)) / (2.0 * h);
      assert_relative_eq!(analytic, numeric, epsilon = 2e-3);
    }
  }

  #[test]
  fn flat_gradients_line_up_with_parameters() {
    let mut rng = StdRng::seed_from_u64(5);
    let mut net = Mlp::new(2, &[3], 0.0, &mut rng);
    let x = array![[1.0, 2.0]];
    let pass = net.forward(&x, Mode::Eval);
    let flat = net.backward(&pass, &array![[1.0]]).into_flat();
    let params = net.parameters_mut();
    assert_eq!(flat.len(), params.len());
    for (g, p) in flat.iter().zip(params) {
      assert_eq!(g.dim(), p.dim());
    }
  }
}
