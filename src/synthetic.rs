//! Synthetic, inherently unfair dataset.
//!
//! The label base rate depends on the protected attribute, and one feature
//! leaks the protected attribute directly. A classifier that is accurate on
//! this data cannot have equal positive rates across groups.

use ndarray::{Array1, Array2};
use ndarray_rand::rand_distr::{Bernoulli, Distribution, Normal};
use rand::Rng;
use tracing::info;

use crate::dataset::Dataset;
use crate::error::{Error, Result};

pub const DEFAULT_SAMPLES: usize = 10_000;

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
  /// P(protected = 1)
  pub protected_rate: f64,
  /// P(target = 1 | protected = 0)
  pub base_rate_a: f64,
  /// P(target = 1 | protected = 1)
  pub base_rate_b: f64,
  /// Distance of the class means from zero on informative features.
  pub separation: f32,
  pub informative_features: usize,
}

impl Default for GeneratorConfig {
  fn default() -> Self {
    Self {
      protected_rate: 0.5,
      base_rate_a: 0.7,
      base_rate_b: 0.3,
      separation: 1.0,
      informative_features: 3,
    }
  }
}

fn bernoulli(p: f64) -> Result<Bernoulli> {
  Bernoulli::new(p).map_err(|e| Error::Config(format!("invalid probability {}: {}", p, e)))
}

fn normal(mean: f32) -> Result<Normal<f32>> {
  Normal::new(mean, 1.0).map_err(|e| Error::Config(format!("invalid normal: {}", e)))
}

/// Generate `samples` rows with the default generator settings.
pub fn generate<R: Rng + ?Sized>(samples: usize, rng: &mut R) -> Result<Dataset> {
  generate_with(&GeneratorConfig::default(), samples, rng)
}

pub fn generate_with<R: Rng + ?Sized>(
  config: &GeneratorConfig,
  samples: usize,
  rng: &mut R,
) -> Result<Dataset> {
  let group = bernoulli(config.protected_rate)?;
  let label_a = bernoulli(config.base_rate_a)?;
  let label_b = bernoulli(config.base_rate_b)?;
  let pos = normal(config.separation)?;
  let neg = normal(-config.separation)?;
  let noise = normal(0.0)?;

  let k = config.informative_features;
  // informative columns, then proxy, then noise
  let n_features = k + 2;
  let mut features = Array2::<f32>::zeros((samples, n_features));
  let mut target = Array1::<f32>::zeros(samples);
  let mut protected = Array1::<f32>::zeros(samples);

  for i in 0..samples {
    let z = group.sample(rng);
    let y = if z {
      label_b.sample(rng)
    } else {
      label_a.sample(rng)
    };
    protected[i] = if z { 1.0 } else { 0.0 };
    target[i] = if y { 1.0 } else { 0.0 };

    let by_label = if y { &pos } else { &neg };
    for j in 0..k {
      features[[i, j]] = by_label.sample(rng);
    }
    features[[i, k]] = if z { pos.sample(rng) } else { neg.sample(rng) };
    features[[i, k + 1]] = noise.sample(rng);
  }

  let mut names: Vec<String> = (1..=k).map(|j| format!("x{}", j)).collect();
  names.push("proxy".into());
  names.push("noise".into());

  let dataset = Dataset::new(features, target, protected, names)?;
  let (a, b) = dataset.base_rates();
  info!(samples, base_rate_a = a, base_rate_b = b, "generated unfair dataset");
  Ok(dataset)
}
