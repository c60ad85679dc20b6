//! Training configuration
//!
//! Every field has a default so a TOML file only needs to name what it
//! changes. CLI flags are applied on top by the binary.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const LR: f32 = 0.001;
pub const BATCH_SIZE: usize = 128;
pub const ITERATIONS: usize = 165;
pub const LAMBDA: f32 = 130.0;
pub const HIDDEN: [usize; 3] = [32, 32, 32];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
  pub classifier_hidden: Vec<usize>,
  pub adversary_hidden: Vec<usize>,
  /// Dropout applied after every hidden layer of the classifier.
  pub dropout: f32,
  pub learning_rate: f32,
  pub batch_size: usize,
  pub pretrain_classifier_epochs: usize,
  pub pretrain_adversary_epochs: usize,
  /// Number of adversarial rounds after pretraining.
  pub iterations: usize,
  /// Weight of the adversary's loss in the classifier objective.
  pub lambda: f32,
  pub threshold: f32,
  pub test_fraction: f32,
  pub seed: u64,
}

impl Default for TrainingConfig {
  fn default() -> Self {
    Self {
      classifier_hidden: HIDDEN.to_vec(),
      adversary_hidden: HIDDEN.to_vec(),
      dropout: 0.2,
      learning_rate: LR,
      batch_size: BATCH_SIZE,
      pretrain_classifier_epochs: 10,
      pretrain_adversary_epochs: 5,
      iterations: ITERATIONS,
      lambda: LAMBDA,
      threshold: 0.5,
      test_fraction: 0.5,
      seed: 7,
    }
  }
}

impl TrainingConfig {
  pub fn from_toml_str(s: &str) -> Result<Self> {
    let config: TrainingConfig = toml::from_str(s)?;
    config.validate()?;
    Ok(config)
  }

  pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
    let contents = std::fs::read_to_string(path)?;
    Self::from_toml_str(&contents)
  }

  pub fn validate(&self) -> Result<()> {
    if self.batch_size == 0 {
      return Err(Error::Config("batch_size must be positive".into()));
    }
    for (name, widths) in [
      ("classifier_hidden", &self.classifier_hidden),
      ("adversary_hidden", &self.adversary_hidden),
    ] {
      if widths.contains(&0) {
        return Err(Error::Config(format!(
          "{} layers must be at least 1 wide, got {:?}",
          name, widths
        )));
      }
    }
    if !(0.0..1.0).contains(&self.dropout) {
      return Err(Error::Config(format!(
        "dropout must be in [0, 1), got {}",
        self.dropout
      )));
    }
    if !(self.learning_rate > 0.0) {
      return Err(Error::Config(format!(
        "learning_rate must be positive, got {}",
        self.learning_rate
      )));
    }
    if !(self.lambda >= 0.0) {
      return Err(Error::Config(format!(
        "lambda must not be negative, got {}",
        self.lambda
      )));
    }
    if !(self.test_fraction > 0.0 && self.test_fraction < 1.0) {
      return Err(Error::Config(format!(
        "test_fraction must be in (0, 1), got {}",
        self.test_fraction
      )));
    }
    if !(0.0..=1.0).contains(&self.threshold) {
      return Err(Error::Config(format!(
        "threshold must be in [0, 1], got {}",
        self.threshold
      )));
    }
    Ok(())
  }
}
