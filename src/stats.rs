use std::io::Write;
use std::path::Path;

use ndarray::Array1;
use serde::Serialize;

use crate::error::Result;
use crate::fairness::FairnessReport;

/// Sample-weighted running mean of a batch loss.
#[derive(Default, Debug, Clone, Copy)]
pub struct RunningLoss {
  total: f64,
  samples: usize,
}

impl RunningLoss {
  pub fn new() -> Self {
    Self::default()
  }

  /// `loss` is the mean over a batch of `batch` samples.
  pub fn update(&mut self, loss: f32, batch: usize) {
    self.total += loss as f64 * batch as f64;
    self.samples += batch;
  }

  pub fn mean(&self) -> f32 {
    if self.samples == 0 {
      0.0
    } else {
      (self.total / self.samples as f64) as f32
    }
  }

  pub fn samples(&self) -> usize {
    self.samples
  }
}

/// One row of the training history. Iteration 0 is the pretrained state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IterationRecord {
  pub iteration: usize,
  pub accuracy: f32,
  pub roc_auc: f32,
  pub p_rule: f32,
  pub fpr_gap: f32,
  pub fnr_gap: f32,
  pub classifier_loss: f32,
  pub adversary_loss: f32,
}

impl IterationRecord {
  pub fn from_report(
    iteration: usize,
    report: &FairnessReport,
    classifier_loss: f32,
    adversary_loss: f32,
  ) -> Self {
    Self {
      iteration,
      accuracy: report.accuracy,
      roc_auc: report.roc_auc,
      p_rule: report.p_rule,
      fpr_gap: report.fpr_gap(),
      fnr_gap: report.fnr_gap(),
      classifier_loss,
      adversary_loss,
    }
  }

  pub fn is_finite(&self) -> bool {
    [
      self.accuracy,
      self.roc_auc,
      self.p_rule,
      self.fpr_gap,
      self.fnr_gap,
      self.classifier_loss,
      self.adversary_loss,
    ]
    .iter()
    .all(|v| v.is_finite())
  }
}

#[derive(Debug, Clone, Default)]
pub struct History {
  records: Vec<IterationRecord>,
}

impl History {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&mut self, record: IterationRecord) {
    self.records.push(record);
  }

  pub fn last(&self) -> Option<&IterationRecord> {
    self.records.last()
  }

  pub fn first(&self) -> Option<&IterationRecord> {
    self.records.first()
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &IterationRecord> {
    self.records.iter()
  }

  pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
    let file = std::fs::File::create(path)?;
    self.to_writer(file)
  }

  pub fn to_writer<W: Write>(&self, writer: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    for record in &self.records {
      wtr.serialize(record)?;
    }
    wtr.flush()?;
    Ok(())
  }
}

/// Normalised histogram over [0, 1] of the probabilities belonging to one
/// protected group. Bins sum to 1 unless the group is empty.
pub fn group_histogram(
  prob: &Array1<f32>,
  protected: &Array1<f32>,
  group: f32,
  bins: usize,
) -> Vec<f32> {
  if bins == 0 {
    return Vec::new();
  }
  let mut counts = vec![0usize; bins];
  let mut total = 0usize;
  for (&p, _) in prob.iter().zip(protected.iter()).filter(|&(_, &z)| z == group) {
    let bin = ((p.clamp(0.0, 1.0) * bins as f32) as usize).min(bins - 1);
    counts[bin] += 1;
    total += 1;
  }
  counts
    .into_iter()
    .map(|c| if total == 0 { 0.0 } else { c as f32 / total as f32 })
    .collect()
}
