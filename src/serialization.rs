//! Safetensors checkpoints for a trained `FairClassifier`.
//!
//! Tensors are named `classifier.{i}.weight`, `classifier.{i}.bias`,
//! `adversary.{i}.weight` and `adversary.{i}.bias`, stored as F32
//! little-endian. The training config, the feature standardiser, the
//! input width and the feature column names travel in the file metadata.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;

use ndarray::{Array2, Axis};
use safetensors::{serialize_to_file, Dtype, SafeTensors, View};
use tracing::info;

use crate::config::TrainingConfig;
use crate::dataset::{Dataset, Standardizer};
use crate::error::{Error, Result};
use crate::network::{Activation, Dense, Mlp};
use crate::training::FairClassifier;

const META_CONFIG: &str = "config";
const META_SCALER: &str = "scaler";
const META_FEATURES: &str = "n_features";
const META_FEATURE_NAMES: &str = "feature_names";

/// A model restored from disk, with what it needs to score new data.
pub struct Checkpoint {
  pub model: FairClassifier,
  pub scaler: Standardizer,
  /// Feature columns in the order the classifier expects them.
  pub feature_names: Vec<String>,
}

impl Checkpoint {
  /// Reorder `dataset`'s feature columns to the training order by name,
  /// then standardise them.
  pub fn prepare(&self, dataset: &Dataset) -> Result<Dataset> {
    let positions: Option<Vec<usize>> = self
      .feature_names
      .iter()
      .map(|name| dataset.feature_names.iter().position(|n| n == name))
      .collect();
    let positions = match positions {
      Some(p) if p.len() == dataset.n_features() => p,
      _ => {
        return Err(Error::FeatureMismatch {
          expected: self.feature_names.clone(),
          got: dataset.feature_names.clone(),
        })
      }
    };

    let features = dataset.features.select(Axis(1), &positions);
    Dataset::new(
      self.scaler.transform(&features)?,
      dataset.target.clone(),
      dataset.protected.clone(),
      self.feature_names.clone(),
    )
  }
}

/// Convert a slice of f32 into little-endian bytes
fn f32_to_le_bytes(v: &[f32]) -> Vec<u8> {
  let mut bytes = Vec::with_capacity(v.len() * 4);
  for &f in v.iter() {
    bytes.extend_from_slice(&f.to_le_bytes());
  }
  bytes
}

fn le_bytes_to_f32(data: &[u8]) -> Vec<f32> {
  data
    .chunks_exact(4)
    .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
    .collect()
}

struct OwnedTensor {
  shape: Vec<usize>,
  data: Vec<u8>,
}

impl View for OwnedTensor {
  fn dtype(&self) -> Dtype {
    Dtype::F32
  }

  fn shape(&self) -> &[usize] {
    &self.shape
  }

  fn data(&self) -> Cow<'_, [u8]> {
    (&self.data[..]).into()
  }

  fn data_len(&self) -> usize {
    self.data.len()
  }
}

fn named_tensors(prefix: &str, net: &Mlp) -> Result<Vec<(String, OwnedTensor)>> {
  let mut out = Vec::with_capacity(net.layers().len() * 2);
  for (i, layer) in net.layers().iter().enumerate() {
    for (kind, arr) in [("weight", &layer.weight), ("bias", &layer.bias)] {
      let name = format!("{}.{}.{}", prefix, i, kind);
      let non_finite = arr.iter().filter(|x| !x.is_finite()).count();
      if non_finite > 0 {
        return Err(Error::NonFinite {
          tensor: name,
          count: non_finite,
        });
      }
      let (r, c) = arr.dim();
      let flat: Vec<f32> = arr.iter().cloned().collect();
      out.push((
        name,
        OwnedTensor {
          shape: vec![r, c],
          data: f32_to_le_bytes(&flat),
        },
      ));
    }
  }
  Ok(out)
}

/// Write both networks plus the metadata needed to rebuild them.
pub fn save_checkpoint<P: AsRef<Path>>(
  path: P,
  model: &FairClassifier,
  scaler: &Standardizer,
  feature_names: &[String],
) -> Result<()> {
  let n_features = model.classifier().input_size();
  if feature_names.len() != n_features || scaler.mean.len() != n_features {
    return Err(Error::ShapeMismatch {
      name: META_FEATURE_NAMES.into(),
      expected: vec![n_features],
      got: vec![feature_names.len(), scaler.mean.len()],
    });
  }

  let mut tensors = named_tensors("classifier", model.classifier())?;
  tensors.extend(named_tensors("adversary", model.adversary())?);

  let mut metadata = HashMap::new();
  metadata.insert(META_CONFIG.to_string(), serde_json::to_string(model.config())?);
  metadata.insert(META_SCALER.to_string(), serde_json::to_string(scaler)?);
  metadata.insert(META_FEATURES.to_string(), n_features.to_string());
  metadata.insert(
    META_FEATURE_NAMES.to_string(),
    serde_json::to_string(feature_names)?,
  );

  serialize_to_file(tensors, Some(metadata), path.as_ref())?;
  info!(path = %path.as_ref().display(), "saved checkpoint");
  Ok(())
}

fn read_layers(
  tensors: &SafeTensors<'_>,
  prefix: &str,
  input: usize,
  hidden: &[usize],
) -> Result<Vec<Dense>> {
  let shapes = Mlp::layer_shapes(input, hidden);
  let last = shapes.len() - 1;
  let mut layers = Vec::with_capacity(shapes.len());

  for (i, &(fan_in, fan_out)) in shapes.iter().enumerate() {
    let read = |kind: &str, expected: [usize; 2]| -> Result<Array2<f32>> {
      let name = format!("{}.{}.{}", prefix, i, kind);
      let view = tensors.tensor(&name)?;
      if view.dtype() != Dtype::F32 {
        return Err(Error::Checkpoint(format!(
          "tensor `{}` has dtype {:?}, expected F32",
          name,
          view.dtype()
        )));
      }
      if view.shape() != expected {
        return Err(Error::ShapeMismatch {
          name,
          expected: expected.to_vec(),
          got: view.shape().to_vec(),
        });
      }
      Array2::from_shape_vec((expected[0], expected[1]), le_bytes_to_f32(view.data())).map_err(
        |e| Error::Checkpoint(format!("tensor `{}` has malformed data: {}", name, e)),
      )
    };

    let weight = read("weight", [fan_in, fan_out])?;
    let bias = read("bias", [1, fan_out])?;
    let activation = if i == last {
      Activation::Sigmoid
    } else {
      Activation::Relu
    };
    layers.push(Dense {
      weight,
      bias,
      activation,
    });
  }
  Ok(layers)
}

fn meta_value<'a>(meta: &'a Option<HashMap<String, String>>, key: &str) -> Result<&'a str> {
  meta
    .as_ref()
    .and_then(|m| m.get(key))
    .map(String::as_str)
    .ok_or_else(|| Error::Checkpoint(format!("missing metadata key `{}`", key)))
}

/// Rebuild the classifier, its adversary and the feature standardiser.
pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<Checkpoint> {
  let buffer = std::fs::read(path.as_ref())?;

  let (_, header) = SafeTensors::read_metadata(&buffer)?;
  let meta = header.metadata();
  let config: TrainingConfig = serde_json::from_str(meta_value(meta, META_CONFIG)?)?;
  let scaler: Standardizer = serde_json::from_str(meta_value(meta, META_SCALER)?)?;
  let n_features: usize = meta_value(meta, META_FEATURES)?
    .parse()
    .map_err(|e| Error::Checkpoint(format!("invalid `{}`: {}", META_FEATURES, e)))?;
  if scaler.mean.len() != n_features {
    return Err(Error::ShapeMismatch {
      name: META_SCALER.into(),
      expected: vec![n_features],
      got: vec![scaler.mean.len()],
    });
  }
  let feature_names: Vec<String> =
    serde_json::from_str(meta_value(meta, META_FEATURE_NAMES)?)?;
  if feature_names.len() != n_features {
    return Err(Error::ShapeMismatch {
      name: META_FEATURE_NAMES.into(),
      expected: vec![n_features],
      got: vec![feature_names.len()],
    });
  }

  let tensors = SafeTensors::deserialize(&buffer)?;
  let classifier = Mlp::from_layers(
    read_layers(&tensors, "classifier", n_features, &config.classifier_hidden)?,
    config.dropout,
  );
  let adversary = Mlp::from_layers(
    read_layers(&tensors, "adversary", 1, &config.adversary_hidden)?,
    0.0,
  );

  info!(
    path = %path.as_ref().display(),
    classifier_params = classifier.num_parameters(),
    adversary_params = adversary.num_parameters(),
    "loaded checkpoint"
  );
  Ok(Checkpoint {
    model: FairClassifier::from_parts(classifier, adversary, config),
    scaler,
    feature_names,
  })
}
