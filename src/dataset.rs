//! Tabular dataset with a binary target and a binary protected attribute.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;

use ndarray::{Array1, Array2, Axis};
use rand::seq::index;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const PROTECTED_COLUMN: &str = "protected";
pub const TARGET_COLUMN: &str = "target";

#[derive(Debug, Clone)]
pub struct Dataset {
  /// One row per sample.
  pub features: Array2<f32>,
  pub target: Array1<f32>,
  pub protected: Array1<f32>,
  pub feature_names: Vec<String>,
}

impl Dataset {
  pub fn new(
    features: Array2<f32>,
    target: Array1<f32>,
    protected: Array1<f32>,
    feature_names: Vec<String>,
  ) -> Result<Self> {
    let n = features.nrows();
    if target.len() != n || protected.len() != n {
      return Err(Error::ShapeMismatch {
        name: "dataset".into(),
        expected: vec![n],
        got: vec![target.len(), protected.len()],
      });
    }
    if feature_names.len() != features.ncols() {
      return Err(Error::ShapeMismatch {
        name: "feature_names".into(),
        expected: vec![features.ncols()],
        got: vec![feature_names.len()],
      });
    }
    if let Some(((r, c), v)) = features.indexed_iter().find(|(_, v)| !v.is_finite()) {
      return Err(Error::Data {
        row: r + 1,
        column: feature_names[c].clone(),
        message: format!("expected a finite number, got {}", v),
      });
    }
    Ok(Self {
      features,
      target,
      protected,
      feature_names,
    })
  }

  pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
    let file = std::fs::File::open(path)?;
    Self::from_reader(file)
  }

  pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
    let mut rdr = csv::Reader::from_reader(reader);
    let headers = rdr.headers()?.clone();

    let find = |name: &'static str| {
      headers
        .iter()
        .position(|h| h.trim() == name)
        .ok_or(Error::MissingColumn(name))
    };
    let protected_idx = find(PROTECTED_COLUMN)?;
    let target_idx = find(TARGET_COLUMN)?;

    let feature_cols: Vec<(usize, String)> = headers
      .iter()
      .enumerate()
      .filter(|(i, _)| *i != protected_idx && *i != target_idx)
      .map(|(i, h)| (i, h.trim().to_string()))
      .collect();

    let mut values = Vec::new();
    let mut target = Vec::new();
    let mut protected = Vec::new();

    for (row, record) in rdr.records().enumerate() {
      let record = record?;
      // header is line 1, first record is row 1
      let row = row + 1;
      let field = |idx: usize, column: &str| -> Result<f32> {
        let raw = record.get(idx).unwrap_or("").trim();
        let v = raw.parse::<f32>().map_err(|e| Error::Data {
          row,
          column: column.to_string(),
          message: format!("cannot parse {:?}: {}", raw, e),
        })?;
        if !v.is_finite() {
          return Err(Error::Data {
            row,
            column: column.to_string(),
            message: format!("expected a finite number, got {:?}", raw),
          });
        }
        Ok(v)
      };
      let binary = |idx: usize, column: &str| -> Result<f32> {
        let v = field(idx, column)?;
        if v == 0.0 || v == 1.0 {
          Ok(v)
        } else {
          Err(Error::Data {
            row,
            column: column.to_string(),
            message: format!("expected 0 or 1, got {}", v),
          })
        }
      };

      protected.push(binary(protected_idx, PROTECTED_COLUMN)?);
      target.push(binary(target_idx, TARGET_COLUMN)?);
      for (idx, name) in &feature_cols {
        values.push(field(*idx, name)?);
      }
    }

    let n = target.len();
    let features = Array2::from_shape_vec((n, feature_cols.len()), values).map_err(|_| {
      Error::ShapeMismatch {
        name: "features".into(),
        expected: vec![n, feature_cols.len()],
        got: vec![],
      }
    })?;
    debug!(rows = n, features = feature_cols.len(), "loaded dataset");

    Self::new(
      features,
      Array1::from(target),
      Array1::from(protected),
      feature_cols.into_iter().map(|(_, name)| name).collect(),
    )
  }

  pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
    let file = std::fs::File::create(path)?;
    self.to_writer(file)
  }

  pub fn to_writer<W: Write>(&self, writer: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    let mut header = vec![PROTECTED_COLUMN.to_string(), TARGET_COLUMN.to_string()];
    header.extend(self.feature_names.iter().cloned());
    wtr.write_record(&header)?;

    for ((row, &t), &z) in self
      .features
      .outer_iter()
      .zip(self.target.iter())
      .zip(self.protected.iter())
    {
      let mut record = vec![format!("{}", z as u8), format!("{}", t as u8)];
      record.extend(row.iter().map(|v| v.to_string()));
      wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
  }

  pub fn len(&self) -> usize {
    self.target.len()
  }

  pub fn is_empty(&self) -> bool {
    self.target.is_empty()
  }

  pub fn n_features(&self) -> usize {
    self.features.ncols()
  }

  /// Build a new dataset holding the given rows, in order.
  pub fn select(&self, indices: &[usize]) -> Dataset {
    Dataset {
      features: self.features.select(Axis(0), indices),
      target: self.target.select(Axis(0), indices),
      protected: self.protected.select(Axis(0), indices),
      feature_names: self.feature_names.clone(),
    }
  }

  /// Mean of `target` within each protected group, as (group A, group B).
  pub fn base_rates(&self) -> (f32, f32) {
    let rate = |group: f32| {
      let (hits, count) = self
        .target
        .iter()
        .zip(self.protected.iter())
        .filter(|&(_, &z)| z == group)
        .fold((0.0, 0usize), |(h, c), (&t, _)| (h + t, c + 1));
      if count == 0 {
        0.0
      } else {
        hits / count as f32
      }
    };
    (rate(0.0), rate(1.0))
  }
}

/// Split into (train, test), stratified on the (target, protected) cell.
pub fn train_test_split<R: Rng + ?Sized>(
  dataset: &Dataset,
  test_fraction: f32,
  rng: &mut R,
) -> (Dataset, Dataset) {
  let mut cells: BTreeMap<(u8, u8), Vec<usize>> = BTreeMap::new();
  for (i, (&t, &z)) in dataset.target.iter().zip(dataset.protected.iter()).enumerate() {
    cells.entry((t as u8, z as u8)).or_default().push(i);
  }

  let mut train = Vec::with_capacity(dataset.len());
  let mut test = Vec::with_capacity(dataset.len());
  for (cell, mut idx) in cells {
    idx.shuffle(rng);
    let n_test = (idx.len() as f32 * test_fraction).round() as usize;
    if n_test == 0 || n_test == idx.len() {
      warn!(?cell, size = idx.len(), "stratum too small to split evenly");
    }
    test.extend_from_slice(&idx[..n_test]);
    train.extend_from_slice(&idx[n_test..]);
  }
  train.shuffle(rng);
  test.shuffle(rng);

  (dataset.select(&train), dataset.select(&test))
}

/// Indices of a random batch drawn without replacement.
pub fn sample_batch<R: Rng + ?Sized>(len: usize, batch_size: usize, rng: &mut R) -> Vec<usize> {
  index::sample(rng, len, batch_size.min(len)).into_vec()
}

/// Per-column standardisation fitted on the training features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
  pub mean: Vec<f32>,
  pub std: Vec<f32>,
}

impl Standardizer {
  pub fn fit(features: &Array2<f32>) -> Self {
    let ncols = features.ncols();
    if features.nrows() == 0 {
      return Self {
        mean: vec![0.0; ncols],
        std: vec![1.0; ncols],
      };
    }
    let mean = features
      .mean_axis(Axis(0))
      .unwrap_or_else(|| Array1::zeros(ncols));
    let std = features.std_axis(Axis(0), 0.0).mapv(|s| if s > 1e-12 { s } else { 1.0 });
    Self {
      mean: mean.to_vec(),
      std: std.to_vec(),
    }
  }

  pub fn transform(&self, features: &Array2<f32>) -> Result<Array2<f32>> {
    if features.ncols() != self.mean.len() {
      return Err(Error::ShapeMismatch {
        name: "features".into(),
        expected: vec![self.mean.len()],
        got: vec![features.ncols()],
      });
    }
    let mean = Array1::from(self.mean.clone());
    let std = Array1::from(self.std.clone());
    Ok((features - &mean) / &std)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_relative_eq;
  use ndarray::array;
  use rand::rngs::StdRng;
  use rand::SeedableRng;

  const CSV: &str = "x1,protected,target,x2\n0.5,1,0,2.0\n-1.0,0,1,3.0\n2.0,1,1,4.0\n";

  #[test]
  fn parses_columns_in_any_position() {
    let ds = Dataset::from_reader(CSV.as_bytes()).unwrap();
    assert_eq!(ds.len(), 3);
    assert_eq!(ds.feature_names, vec!["x1", "x2"]);
    assert_eq!(ds.protected, array![1.0, 0.0, 1.0]);
    assert_eq!(ds.target, array![0.0, 1.0, 1.0]);
    assert_eq!(ds.features.row(1), array![-1.0, 3.0]);
  }

  #[test]
  fn missing_target_column_is_reported() {
    let err = Dataset::from_reader("protected,x\n1,2\n".as_bytes()).unwrap_err();
    assert!(matches!(err, Error::MissingColumn("target")));
  }

  #[test]
  fn non_binary_label_names_row_and_column() {
    let err = Dataset::from_reader("protected,target,x\n1,0,1\n0,2,1\n".as_bytes()).unwrap_err();
    match err {
      Error::Data { row, column, .. } => {
        assert_eq!(row, 2);
        assert_eq!(column, "target");
      }
      other => panic!("unexpected error {other:?}"),
    }
  }

  #[test]
  fn unparseable_feature_is_a_data_error() {
    let err = Dataset::from_reader("protected,target,x\n1,0,abc\n".as_bytes()).unwrap_err();
    assert!(matches!(err, Error::Data { row: 1, .. }));
  }

  #[test]
  fn dataset_rejects_non_finite_features() {
    let err = Dataset::new(
      array![[1.0, 2.0], [f32::NAN, 0.0]],
      array![0.0, 1.0],
      array![1.0, 0.0],
      vec!["a".into(), "b".into()],
    )
    .unwrap_err();
    assert!(matches!(err, Error::Data { row: 2, ref column, .. } if column == "a"));
  }

  #[test]
  fn non_finite_feature_is_a_data_error() {
    for raw in ["NaN", "inf", "-inf"] {
      let csv = format!("protected,target,x\n1,0,0.5\n0,1,{}\n", raw);
      match Dataset::from_reader(csv.as_bytes()).unwrap_err() {
        Error::Data { row, column, .. } => {
          assert_eq!(row, 2);
          assert_eq!(column, "x");
        }
        other => panic!("unexpected error {other:?}"),
      }
    }
  }

  #[test]
  fn csv_file_round_trip() {
    let ds = Dataset::from_reader(CSV.as_bytes()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.csv");
    ds.to_csv(&path).unwrap();
    let back = Dataset::from_csv(&path).unwrap();
    assert_eq!(back.features, ds.features);
    assert_eq!(back.target, ds.target);
    assert_eq!(back.protected, ds.protected);
    assert_eq!(back.feature_names, ds.feature_names);
  }

  #[test]
  fn base_rates_per_group() {
    let ds = Dataset::from_reader(CSV.as_bytes()).unwrap();
    let (a, b) = ds.base_rates();
    assert_relative_eq!(a, 1.0);
    assert_relative_eq!(b, 0.5);
  }

  #[test]
  fn split_is_stratified_and_disjoint() {
    let n = 400;
    let features = Array2::from_shape_fn((n, 1), |(i, _)| i as f32);
    let target = Array1::from_shape_fn(n, |i| (i % 2) as f32);
    let protected = Array1::from_shape_fn(n, |i| ((i / 2) % 2) as f32);
    let ds = Dataset::new(features, target, protected, vec!["id".into()]).unwrap();

    let mut rng = StdRng::seed_from_u64(1);
    let (train, test) = train_test_split(&ds, 0.25, &mut rng);
    assert_eq!(train.len(), 300);
    assert_eq!(test.len(), 100);

    let (a, b) = test.base_rates();
    assert_relative_eq!(a, 0.5);
    assert_relative_eq!(b, 0.5);

    let mut ids: Vec<usize> = train
      .features
      .iter()
      .chain(test.features.iter())
      .map(|&v| v as usize)
      .collect();
    ids.sort_unstable();
    assert_eq!(ids, (0..n).collect::<Vec<_>>());
  }

  #[test]
  fn batch_is_clamped_and_unique() {
    let mut rng = StdRng::seed_from_u64(3);
    let mut batch = sample_batch(10, 128, &mut rng);
    assert_eq!(batch.len(), 10);
    batch.sort_unstable();
    batch.dedup();
    assert_eq!(batch.len(), 10);
  }

  #[test]
  fn standardizer_centres_and_scales() {
    let x = array![[1.0, 5.0], [3.0, 5.0], [5.0, 5.0]];
    let scaler = Standardizer::fit(&x);
    let z = scaler.transform(&x).unwrap();
    assert_relative_eq!(z.column(0).mean().unwrap(), 0.0, epsilon = 1e-6);
    assert_relative_eq!(z.column(0).std(0.0), 1.0, epsilon = 1e-5);
    // constant column keeps a unit std
    assert_eq!(scaler.std[1], 1.0);
    assert!(z.column(1).iter().all(|&v| v == 0.0));
  }

  #[test]
  fn standardizer_rejects_wrong_width() {
    let scaler = Standardizer::fit(&array![[1.0, 2.0]]);
    assert!(scaler.transform(&array![[1.0]]).is_err());
  }
}
