//! Adversarially debiased classifier.
//!
//! A classifier predicts the target from the features. An adversary sees
//! only the classifier's probability and tries to recover the protected
//! attribute from it. During the adversarial rounds the classifier
//! minimises `BCE(y, p) - lambda * BCE(z, adv(p))`, so it is rewarded for
//! making the adversary's job hard.

use std::path::Path;

use ndarray::{Array1, Array2, Axis};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info};

use crate::config::TrainingConfig;
use crate::dataset::{sample_batch, train_test_split, Dataset, Standardizer};
use crate::error::{Error, Result};
use crate::fairness::FairnessReport;
use crate::math::{bce_sigmoid_grad, binary_cross_entropy, column};
use crate::network::{Gradients, Mlp, Mode};
use crate::optim::Adam;
use crate::serialization::{load_checkpoint, save_checkpoint, Checkpoint};
use crate::stats::{History, IterationRecord, RunningLoss};

/// Log a summary line every this many adversarial iterations.
const LOG_EVERY: usize = 10;

pub struct FairClassifier {
  classifier: Mlp,
  adversary: Mlp,
  config: TrainingConfig,
  clf_optim: Adam,
  // the combined objective keeps its own moments, separate from pretraining
  clf_adv_optim: Adam,
  adv_optim: Adam,
}

impl FairClassifier {
  pub fn new<R: Rng + ?Sized>(
    n_features: usize,
    config: &TrainingConfig,
    rng: &mut R,
  ) -> Result<Self> {
    config.validate()?;
    let classifier = Mlp::new(n_features, &config.classifier_hidden, config.dropout, rng);
    // the adversary sees a single input: the classifier's probability
    let adversary = Mlp::new(1, &config.adversary_hidden, 0.0, rng);
    Ok(Self::from_parts(classifier, adversary, config.clone()))
  }

  pub fn from_parts(classifier: Mlp, adversary: Mlp, config: TrainingConfig) -> Self {
    let lr = config.learning_rate;
    FairClassifier {
      classifier,
      adversary,
      config,
      clf_optim: Adam::default_params(lr),
      clf_adv_optim: Adam::default_params(lr),
      adv_optim: Adam::default_params(lr),
    }
  }

  pub fn classifier(&self) -> &Mlp {
    &self.classifier
  }

  pub fn adversary(&self) -> &Mlp {
    &self.adversary
  }

  pub fn config(&self) -> &TrainingConfig {
    &self.config
  }

  /// Save both networks with the scaler and feature names that go with them.
  pub fn to_checkpoint<P: AsRef<Path>>(
    &self,
    path: P,
    scaler: &Standardizer,
    feature_names: &[String],
  ) -> Result<()> {
    save_checkpoint(path, self, scaler, feature_names)
  }

  pub fn from_checkpoint<P: AsRef<Path>>(path: P) -> Result<Checkpoint> {
    load_checkpoint(path)
  }

  pub fn predict_proba(&self, x: &Array2<f32>) -> Array1<f32> {
    self.classifier.predict(x)
  }

  /// The adversary's estimate of P(protected = 1) given the classifier output.
  pub fn adversary_proba(&self, x: &Array2<f32>) -> Array1<f32> {
    let p = column(&self.classifier.predict(x));
    self.adversary.predict(&p)
  }

  pub fn evaluate(&self, dataset: &Dataset) -> FairnessReport {
    let prob = self.predict_proba(&dataset.features);
    FairnessReport::compute(
      &prob,
      &dataset.target,
      &dataset.protected,
      self.config.threshold,
    )
  }

  /// Plain minibatch training of the classifier on BCE(y). Returns the mean
  /// loss of the last epoch.
  pub fn pretrain_classifier<R: Rng>(
    &mut self,
    x: &Array2<f32>,
    y: &Array1<f32>,
    rng: &mut R,
  ) -> f32 {
    let mut last = 0.0;
    for epoch in 0..self.config.pretrain_classifier_epochs {
      let mut loss = RunningLoss::new();
      for batch in shuffled_batches(x.nrows(), self.config.batch_size, rng) {
        let xb = x.select(Axis(0), &batch);
        let yb = column(&y.select(Axis(0), &batch));
        let pass = self.classifier.forward(&xb, Mode::Train(&mut *rng));
        loss.update(binary_cross_entropy(pass.output(), &yb), batch.len());
        let grads = self
          .classifier
          .backward(&pass, &bce_sigmoid_grad(pass.output(), &yb));
        self
          .clf_optim
          .step(&mut self.classifier.parameters_mut(), &grads.into_flat());
      }
      last = loss.mean();
      debug!(epoch, loss = last, "classifier pretraining epoch");
    }
    last
  }

  /// One epoch of adversary training on the frozen classifier's outputs.
  fn adversary_epoch<R: Rng>(&mut self, x: &Array2<f32>, z: &Array1<f32>, rng: &mut R) -> f32 {
    let p = column(&self.classifier.predict(x));
    let mut loss = RunningLoss::new();
    for batch in shuffled_batches(x.nrows(), self.config.batch_size, rng) {
      let pb = p.select(Axis(0), &batch);
      let zb = column(&z.select(Axis(0), &batch));
      let pass = self.adversary.forward(&pb, Mode::Train(&mut *rng));
      loss.update(binary_cross_entropy(pass.output(), &zb), batch.len());
      let grads = self
        .adversary
        .backward(&pass, &bce_sigmoid_grad(pass.output(), &zb));
      self
        .adv_optim
        .step(&mut self.adversary.parameters_mut(), &grads.into_flat());
    }
    loss.mean()
  }

  /// Train only the adversary for the configured number of epochs. Returns
  /// the mean loss of the last epoch.
  pub fn pretrain_adversary<R: Rng>(
    &mut self,
    x: &Array2<f32>,
    z: &Array1<f32>,
    rng: &mut R,
  ) -> f32 {
    let mut last = 0.0;
    for epoch in 0..self.config.pretrain_adversary_epochs {
      last = self.adversary_epoch(x, z, rng);
      debug!(epoch, loss = last, "adversary pretraining epoch");
    }
    last
  }

  /// Gradients of `BCE(y, p) - lambda * BCE(z, adv(p))` with respect to the
  /// classifier's parameters. The adversary is held fixed.
  ///
  /// Returns the gradients with the classifier loss and adversary loss.
  fn combined_gradients(
    &self,
    x: &Array2<f32>,
    y: &Array2<f32>,
    z: &Array2<f32>,
    mode: Mode<'_>,
  ) -> (Gradients, f32, f32) {
    let clf_pass = self.classifier.forward(x, mode);
    let p = clf_pass.output();
    let adv_pass = self.adversary.forward(p, Mode::Eval);
    let q = adv_pass.output();

    let clf_loss = binary_cross_entropy(p, y);
    let adv_loss = binary_cross_entropy(q, z);

    // d(-lambda * BCE(z, q)) / d(adversary logits), pushed back to p
    let adv_grad_logits = bce_sigmoid_grad(q, z) * -self.config.lambda;
    let grad_p = self.adversary.backward(&adv_pass, &adv_grad_logits).input;

    // through the classifier's own sigmoid
    let grad_logits = bce_sigmoid_grad(p, y) + grad_p * p.mapv(|v| v * (1.0 - v));
    let grads = self.classifier.backward(&clf_pass, &grad_logits);
    (grads, clf_loss, adv_loss)
  }

  /// One classifier update on a random batch against the frozen adversary.
  fn adversarial_step<R: Rng>(&mut self, train: &Dataset, rng: &mut R) -> (f32, f32) {
    let batch = sample_batch(train.len(), self.config.batch_size, rng);
    let xb = train.features.select(Axis(0), &batch);
    let yb = column(&train.target.select(Axis(0), &batch));
    let zb = column(&train.protected.select(Axis(0), &batch));

    let (grads, clf_loss, adv_loss) =
      self.combined_gradients(&xb, &yb, &zb, Mode::Train(&mut *rng));
    self
      .clf_adv_optim
      .step(&mut self.classifier.parameters_mut(), &grads.into_flat());
    (clf_loss, adv_loss)
  }

  /// Pretrain both networks, then alternate adversary epochs and classifier
  /// steps for `iterations` rounds.
  ///
  /// The observer is called with the validation probabilities and the
  /// validation set after pretraining (iteration 0) and after every round.
  pub fn fit<R, F>(
    &mut self,
    train: &Dataset,
    validation: &Dataset,
    rng: &mut R,
    mut observer: F,
  ) -> Result<History>
  where
    R: Rng,
    F: FnMut(usize, &Array1<f32>, &Dataset),
  {
    if train.is_empty() || validation.is_empty() {
      return Err(Error::Config(
        "training and validation sets must not be empty".into(),
      ));
    }
    if train.n_features() != self.classifier.input_size() {
      return Err(Error::ShapeMismatch {
        name: "features".into(),
        expected: vec![self.classifier.input_size()],
        got: vec![train.n_features()],
      });
    }

    let clf_loss = self.pretrain_classifier(&train.features, &train.target, rng);
    info!(loss = clf_loss, "pretrained classifier");
    let adv_loss = self.pretrain_adversary(&train.features, &train.protected, rng);
    info!(loss = adv_loss, "pretrained adversary");

    let mut history = History::new();
    let record = self.record(0, validation, clf_loss, adv_loss, &mut observer);
    history.push(record);

    for iteration in 1..=self.config.iterations {
      let adv_loss = self.adversary_epoch(&train.features, &train.protected, rng);
      let (clf_loss, _) = self.adversarial_step(train, rng);

      let record = self.record(iteration, validation, clf_loss, adv_loss, &mut observer);
      if iteration % LOG_EVERY == 0 || iteration == self.config.iterations {
        info!(
          iteration,
          accuracy = record.accuracy,
          roc_auc = record.roc_auc,
          p_rule = record.p_rule,
          "adversarial training"
        );
      }
      history.push(record);
    }
    Ok(history)
  }

  fn record<F: FnMut(usize, &Array1<f32>, &Dataset)>(
    &self,
    iteration: usize,
    validation: &Dataset,
    clf_loss: f32,
    adv_loss: f32,
    observer: &mut F,
  ) -> IterationRecord {
    let prob = self.predict_proba(&validation.features);
    let report = FairnessReport::compute(
      &prob,
      &validation.target,
      &validation.protected,
      self.config.threshold,
    );
    observer(iteration, &prob, validation);
    IterationRecord::from_report(iteration, &report, clf_loss, adv_loss)
  }
}

/// Shuffled row indices cut into batches; the last batch may be short.
fn shuffled_batches<R: Rng>(len: usize, batch_size: usize, rng: &mut R) -> Vec<Vec<usize>> {
  let mut idx: Vec<usize> = (0..len).collect();
  idx.shuffle(rng);
  idx.chunks(batch_size.max(1)).map(<[usize]>::to_vec).collect()
}

pub struct TrainOutcome {
  pub model: FairClassifier,
  pub scaler: Standardizer,
  pub history: History,
  /// Held-out split, already standardised.
  pub test: Dataset,
  pub pretrained: FairnessReport,
  pub trained: FairnessReport,
}

/// Split, standardise, train and evaluate.
pub fn run_train<R, F>(
  dataset: &Dataset,
  config: &TrainingConfig,
  rng: &mut R,
  mut observer: F,
) -> Result<TrainOutcome>
where
  R: Rng,
  F: FnMut(usize, &Array1<f32>, &Dataset),
{
  config.validate()?;
  let (mut train, mut test) = train_test_split(dataset, config.test_fraction, rng);
  info!(
    train = train.len(),
    test = test.len(),
    features = dataset.n_features(),
    "split dataset"
  );

  let scaler = Standardizer::fit(&train.features);
  train.features = scaler.transform(&train.features)?;
  test.features = scaler.transform(&test.features)?;

  let mut model = FairClassifier::new(dataset.n_features(), config, rng)?;
  info!(
    classifier_params = model.classifier.num_parameters(),
    adversary_params = model.adversary.num_parameters(),
    lambda = config.lambda,
    "built networks"
  );

  let mut pretrained = None;
  let history = model.fit(&train, &test, rng, |iteration, prob, validation| {
    if iteration == 0 {
      pretrained = Some(FairnessReport::compute(
        prob,
        &validation.target,
        &validation.protected,
        config.threshold,
      ));
    }
    observer(iteration, prob, validation);
  })?;

  let trained = model.evaluate(&test);
  let pretrained = pretrained.unwrap_or(trained);
  Ok(TrainOutcome {
    model,
    scaler,
    history,
    test,
    pretrained,
    trained,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::synthetic::generate;
  use approx::assert_relative_eq;
  use ndarray::array;
  use rand::rngs::StdRng;
  use rand::SeedableRng;

  fn small_config() -> TrainingConfig {
    TrainingConfig {
      classifier_hidden: vec![8],
      adversary_hidden: vec![6],
      dropout: 0.0,
      batch_size: 32,
      pretrain_classifier_epochs: 2,
      pretrain_adversary_epochs: 1,
      iterations: 3,
      lambda: 5.0,
      ..TrainingConfig::default()
    }
  }

  fn combined_loss(model: &FairClassifier, x: &Array2<f32>, y: &Array2<f32>, z: &Array2<f32>) -> f32 {
    let p = model.classifier.forward(x, Mode::Eval).output().clone();
    let q = model.adversary.forward(&p, Mode::Eval).output().clone();
    binary_cross_entropy(&p, y) - model.config.lambda * binary_cross_entropy(&q, z)
  }

  #[test]
  fn combined_gradient_matches_finite_differences() {
    let mut rng = StdRng::seed_from_u64(9);
    let config = TrainingConfig {
      lambda: 3.0,
      ..small_config()
    };
    let model = FairClassifier::new(2, &config, &mut rng).unwrap();
    let x = array![[0.4, -1.0], [1.2, 0.3], [-0.8, 0.9], [0.1, 0.1]];
    let y = array![[1.0], [0.0], [1.0], [0.0]];
    let z = array![[0.0], [1.0], [1.0], [0.0]];

    let (grads, _, _) = model.combined_gradients(&x, &y, &z, Mode::Eval);

    let h = 1e-3;
    for (l, gw) in grads.weights.iter().enumerate() {
      for ((i, j), &analytic) in gw.indexed_iter() {
        let mut up = FairClassifier::from_parts(
          model.classifier.clone(),
          model.adversary.clone(),
          config.clone(),
        );
        let mut down = FairClassifier::from_parts(
          model.classifier.clone(),
          model.adversary.clone(),
          config.clone(),
        );
        up.classifier.parameters_mut()[2 * l][[i, j]] += h;
        down.classifier.parameters_mut()[2 * l][[i, j]] -= h;
        let numeric =
          (combined_loss(&up, &x, &y, &z) - combined_loss(&down, &x, &y, &z)) / (2.0 * h);
        assert_relative_eq!(analytic, numeric, epsilon = 5e-3);
      }
    }
  }

  #[test]
  fn adversarial_step_leaves_adversary_untouched() {
    let mut rng = StdRng::seed_from_u64(1);
    let ds = generate(200, &mut rng).unwrap();
    let mut model = FairClassifier::new(ds.n_features(), &small_config(), &mut rng).unwrap();
    let before: Vec<Array2<f32>> = model.adversary.parameters().into_iter().cloned().collect();
    let clf_before = model.classifier.parameters()[0].clone();

    model.adversarial_step(&ds, &mut rng);

    for (b, a) in before.iter().zip(model.adversary.parameters()) {
      assert_eq!(b, a);
    }
    assert_ne!(&clf_before, model.classifier.parameters()[0]);
  }

  #[test]
  fn pretraining_lowers_classifier_loss() {
    let mut rng = StdRng::seed_from_u64(2);
    let ds = generate(1_000, &mut rng).unwrap();
    let config = TrainingConfig {
      pretrain_classifier_epochs: 1,
      learning_rate: 0.01,
      ..small_config()
    };
    let mut model = FairClassifier::new(ds.n_features(), &config, &mut rng).unwrap();
    let y = column(&ds.target);
    let initial = binary_cross_entropy(&column(&model.predict_proba(&ds.features)), &y);

    for _ in 0..10 {
      model.pretrain_classifier(&ds.features, &ds.target, &mut rng);
    }
    let trained = binary_cross_entropy(&column(&model.predict_proba(&ds.features)), &y);
    assert!(trained < initial, "loss went from {} to {}", initial, trained);
    assert!(model.evaluate(&ds).accuracy > 0.8);
  }

  #[test]
  fn fit_records_every_iteration() {
    let mut rng = StdRng::seed_from_u64(3);
    let ds = generate(300, &mut rng).unwrap();
    let (train, test) = train_test_split(&ds, 0.5, &mut rng);
    let mut model = FairClassifier::new(ds.n_features(), &small_config(), &mut rng).unwrap();

    let mut seen = Vec::new();
    let history = model
      .fit(&train, &test, &mut rng, |i, prob, validation| {
        assert_eq!(prob.len(), validation.len());
        seen.push(i);
      })
      .unwrap();

    assert_eq!(history.len(), 4);
    assert_eq!(seen, vec![0, 1, 2, 3]);
    assert!(history.iter().all(|r| r.is_finite()));
    assert_eq!(history.first().map(|r| r.iteration), Some(0));
  }

  #[test]
  fn fit_rejects_wrong_feature_count() {
    let mut rng = StdRng::seed_from_u64(4);
    let ds = generate(50, &mut rng).unwrap();
    let mut model = FairClassifier::new(3, &small_config(), &mut rng).unwrap();
    let err = model.fit(&ds, &ds, &mut rng, |_, _, _| {}).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));
  }

  #[test]
  fn run_train_reports_before_and_after() {
    let mut rng = StdRng::seed_from_u64(5);
    let ds = generate(400, &mut rng).unwrap();
    let outcome = run_train(&ds, &small_config(), &mut rng, |_, _, _| {}).unwrap();
    assert_eq!(outcome.history.len(), 4);
    assert_relative_eq!(outcome.pretrained.p_rule, outcome.history.first().unwrap().p_rule);
    assert_relative_eq!(outcome.trained.p_rule, outcome.history.last().unwrap().p_rule);
    assert_eq!(outcome.scaler.mean.len(), ds.n_features());
  }

  #[test]
  fn checkpoint_scores_raw_data_like_the_trained_model() {
    let mut rng = StdRng::seed_from_u64(8);
    let ds = generate(300, &mut rng).unwrap();
    let outcome = run_train(&ds, &small_config(), &mut rng, |_, _, _| {}).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.safetensors");
    outcome
      .model
      .to_checkpoint(&path, &outcome.scaler, &ds.feature_names)
      .unwrap();
    let checkpoint = FairClassifier::from_checkpoint(&path).unwrap();
    assert_eq!(checkpoint.feature_names, ds.feature_names);

    let mut expected = ds.clone();
    expected.features = outcome.scaler.transform(&ds.features).unwrap();
    let prepared = checkpoint.prepare(&ds).unwrap();
    assert_eq!(
      checkpoint.model.evaluate(&prepared),
      outcome.model.evaluate(&expected)
    );
  }

  #[test]
  fn batches_cover_every_row_once() {
    let mut rng = StdRng::seed_from_u64(6);
    let batches = shuffled_batches(10, 4, &mut rng);
    assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![4, 4, 2]);
    let mut all: Vec<usize> = batches.concat();
    all.sort_unstable();
    assert_eq!(all, (0..10).collect::<Vec<_>>());
  }
}
