//! Accuracy and fairness metrics for a binary classifier with a binary
//! protected attribute.
//!
//! All functions take predicted probabilities and threshold them where a
//! hard decision is needed. Any rate whose denominator is empty is 0.

use std::fmt;

use ndarray::Array1;
use serde::Serialize;

fn ratio(num: usize, den: usize) -> f32 {
  if den == 0 {
    0.0
  } else {
    num as f32 / den as f32
  }
}

/// Fraction of thresholded predictions that equal the target.
pub fn accuracy(prob: &Array1<f32>, target: &Array1<f32>, threshold: f32) -> f32 {
  let correct = prob
    .iter()
    .zip(target.iter())
    .filter(|&(&p, &t)| (p > threshold) == (t == 1.0))
    .count();
  ratio(correct, prob.len())
}

/// Area under the ROC curve via the Mann-Whitney rank statistic.
///
/// Ties share their average rank. Returns 0.5 when only one class is present.
pub fn roc_auc(prob: &Array1<f32>, target: &Array1<f32>) -> f32 {
  let n_pos = target.iter().filter(|&&t| t == 1.0).count();
  let n_neg = target.len() - n_pos;
  if n_pos == 0 || n_neg == 0 {
    return 0.5;
  }

  let mut order: Vec<usize> = (0..prob.len()).collect();
  order.sort_by(|&a, &b| prob[a].total_cmp(&prob[b]));

  let mut rank_sum_pos = 0.0f64;
  let mut i = 0;
  while i < order.len() {
    let mut j = i;
    while j + 1 < order.len() && prob[order[j + 1]] == prob[order[i]] {
      j += 1;
    }
    // ranks are 1-based; the tie block i..=j shares the mean rank
    let avg_rank = (i + j) as f64 / 2.0 + 1.0;
    for &k in &order[i..=j] {
      if target[k] == 1.0 {
        rank_sum_pos += avg_rank;
      }
    }
    i = j + 1;
  }

  let n_pos = n_pos as f64;
  let u = rank_sum_pos - n_pos * (n_pos + 1.0) / 2.0;
  (u / (n_pos * n_neg as f64)) as f32
}

/// Positive-prediction rate of the members of one protected group.
fn positive_rate(prob: &Array1<f32>, protected: &Array1<f32>, group: f32, threshold: f32) -> f32 {
  let (hits, count) = prob
    .iter()
    .zip(protected.iter())
    .filter(|&(_, &z)| z == group)
    .fold((0, 0), |(h, c), (&p, _)| (h + usize::from(p > threshold), c + 1));
  ratio(hits, count)
}

/// The p%-rule: how close the two groups' positive-prediction rates are,
/// as a percentage. 100 means equal rates.
pub fn p_rule(prob: &Array1<f32>, protected: &Array1<f32>, threshold: f32) -> f32 {
  let a = positive_rate(prob, protected, 0.0, threshold);
  let b = positive_rate(prob, protected, 1.0, threshold);
  if a == 0.0 && b == 0.0 {
    return 100.0;
  }
  if a == 0.0 || b == 0.0 {
    return 0.0;
  }
  (a / b).min(b / a) * 100.0
}

/// Confusion-derived rates for one protected group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GroupRates {
  pub count: usize,
  /// Share of the group with target = 1.
  pub base_rate: f32,
  /// Share of the group predicted positive.
  pub positive_rate: f32,
  pub fpr: f32,
  pub fnr: f32,
}

/// Rates for (group A, group B), i.e. protected = 0 and protected = 1.
pub fn group_rates(
  prob: &Array1<f32>,
  target: &Array1<f32>,
  protected: &Array1<f32>,
  threshold: f32,
) -> (GroupRates, GroupRates) {
  let rates = |group: f32| {
    let (mut tp, mut fp, mut tn, mut fn_) = (0usize, 0usize, 0usize, 0usize);
    for ((&p, &t), _) in prob
      .iter()
      .zip(target.iter())
      .zip(protected.iter())
      .filter(|&(_, &z)| z == group)
    {
      match (p > threshold, t == 1.0) {
        (true, true) => tp += 1,
        (true, false) => fp += 1,
        (false, false) => tn += 1,
        (false, true) => fn_ += 1,
      }
    }
    let count = tp + fp + tn + fn_;
    GroupRates {
      count,
      base_rate: ratio(tp + fn_, count),
      positive_rate: ratio(tp + fp, count),
      fpr: ratio(fp, fp + tn),
      fnr: ratio(fn_, fn_ + tp),
    }
  };
  (rates(0.0), rates(1.0))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FairnessReport {
  pub accuracy: f32,
  pub roc_auc: f32,
  pub p_rule: f32,
  pub group_a: GroupRates,
  pub group_b: GroupRates,
}

impl FairnessReport {
  pub fn compute(
    prob: &Array1<f32>,
    target: &Array1<f32>,
    protected: &Array1<f32>,
    threshold: f32,
  ) -> Self {
    let (group_a, group_b) = group_rates(prob, target, protected, threshold);
    FairnessReport {
      accuracy: accuracy(prob, target, threshold),
      roc_auc: roc_auc(prob, target),
      p_rule: p_rule(prob, protected, threshold),
      group_a,
      group_b,
    }
  }

  pub fn fpr_gap(&self) -> f32 {
    (self.group_a.fpr - self.group_b.fpr).abs()
  }

  pub fn fnr_gap(&self) -> f32 {
    (self.group_a.fnr - self.group_b.fnr).abs()
  }
}

impl fmt::Display for FairnessReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "ROC AUC:  {:.3}", self.roc_auc)?;
    writeln!(f, "Accuracy: {:.1}%", self.accuracy * 100.0)?;
    writeln!(f, "p%-rule:  {:.0}%", self.p_rule)?;
    writeln!(
      f,
      "{:<8} {:>7} {:>9} {:>9} {:>7} {:>7}",
      "group", "count", "base rate", "pos. rate", "FPR", "FNR"
    )?;
    for (name, g) in [("A", &self.group_a), ("B", &self.group_b)] {
      writeln!(
        f,
        "{:<8} {:>7} {:>9.3} {:>9.3} {:>7.3} {:>7.3}",
        name, g.count, g.base_rate, g.positive_rate, g.fpr, g.fnr
      )?;
    }
    write!(
      f,
      "FPR gap:  {:.3}   FNR gap: {:.3}",
      self.fpr_gap(),
      self.fnr_gap()
    )
  }
}
