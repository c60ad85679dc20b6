//! Error types for fairnet

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("CSV error: {0}")]
  Csv(#[from] csv::Error),

  #[error("invalid data at row {row}, column `{column}`: {message}")]
  Data {
    row: usize,
    column: String,
    message: String,
  },

  #[error("missing required column `{0}`")]
  MissingColumn(&'static str),

  #[error("configuration error: {0}")]
  Config(String),

  #[error("TOML error: {0}")]
  Toml(#[from] toml::de::Error),

  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("safetensors error: {0}")]
  SafeTensor(#[from] safetensors::SafeTensorError),

  #[error("checkpoint error: {0}")]
  Checkpoint(String),

  #[error("feature columns {got:?} do not match the model's {expected:?}")]
  FeatureMismatch {
    expected: Vec<String>,
    got: Vec<String>,
  },

  #[error("tensor `{tensor}` contains {count} non-finite values")]
  NonFinite { tensor: String, count: usize },

  #[error("plot error: {0}")]
  Plot(String),

  #[error("shape mismatch for `{name}`: expected {expected:?}, got {got:?}")]
  ShapeMismatch {
    name: String,
    expected: Vec<usize>,
    got: Vec<usize>,
  },
}

pub type Result<T> = std::result::Result<T, Error>;
