use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fairnet::dataset::Dataset;
use fairnet::stats::History;
use fairnet::synthetic::{self, DEFAULT_SAMPLES};
use fairnet::{run_train, FairClassifier, FairnessReport, TrainingConfig};

/// Render a distribution plot every this many iterations.
#[cfg_attr(not(feature = "plot"), allow(dead_code))]
const PLOT_EVERY: usize = 15;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Write a synthetic dataset whose base rates differ between groups
  Generate {
    /// Output CSV file
    #[arg(short, long, default_value = "data.csv")]
    out: PathBuf,

    #[arg(short = 'n', long, default_value_t = DEFAULT_SAMPLES)]
    samples: usize,

    #[arg(long, default_value_t = 7)]
    seed: u64,
  },

  /// Pretrain, then adversarially debias a classifier
  Train {
    /// Input CSV with `protected`, `target` and feature columns
    #[arg(short, long)]
    data: PathBuf,

    /// Output file to write model weights to
    #[arg(short, long, default_value = "model.safetensors")]
    out: PathBuf,

    /// TOML training config; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Per-iteration metrics as CSV
    #[arg(long)]
    history: Option<PathBuf>,

    /// Directory for PNG plots (needs the `plot` feature)
    #[arg(long)]
    plots: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    lambda: Option<f32>,

    #[arg(long)]
    iterations: Option<usize>,
  },

  /// Report accuracy and fairness of a saved model on a dataset
  Evaluate {
    #[arg(short, long, default_value = "model.safetensors")]
    model: PathBuf,

    #[arg(short, long)]
    data: PathBuf,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
  },
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fairnet=info")),
    )
    .with_target(false)
    .init();

  let cli = Cli::parse();

  match cli.command {
    Commands::Generate { out, samples, seed } => {
      let mut rng = StdRng::seed_from_u64(seed);
      let dataset = synthetic::generate(samples, &mut rng)?;
      dataset
        .to_csv(&out)
        .with_context(|| format!("writing {}", out.display()))?;
      println!("Wrote {} rows to {}", dataset.len(), out.display());
    }

    Commands::Train {
      data,
      out,
      config,
      history,
      plots,
      seed,
      lambda,
      iterations,
    } => {
      let mut cfg = match &config {
        Some(path) => TrainingConfig::from_toml_file(path)
          .with_context(|| format!("loading config {}", path.display()))?,
        None => TrainingConfig::default(),
      };
      if let Some(seed) = seed {
        cfg.seed = seed;
      }
      if let Some(lambda) = lambda {
        cfg.lambda = lambda;
      }
      if let Some(iterations) = iterations {
        cfg.iterations = iterations;
      }
      cfg.validate()?;

      train(&data, &out, &cfg, history.as_deref(), plots.as_deref())?;
    }

    Commands::Evaluate { model, data, json } => {
      let checkpoint = FairClassifier::from_checkpoint(&model)
        .with_context(|| format!("loading {}", model.display()))?;
      let dataset =
        Dataset::from_csv(&data).with_context(|| format!("reading {}", data.display()))?;
      let dataset = checkpoint.prepare(&dataset)?;
      let report = checkpoint.model.evaluate(&dataset);
      if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
      } else {
        println!("{}", report);
      }
    }
  }

  Ok(())
}

fn train(
  data: &Path,
  out: &Path,
  cfg: &TrainingConfig,
  history_path: Option<&Path>,
  plots: Option<&Path>,
) -> Result<()> {
  let dataset = Dataset::from_csv(data).with_context(|| format!("reading {}", data.display()))?;
  let (base_a, base_b) = dataset.base_rates();
  info!(
    rows = dataset.len(),
    base_rate_a = base_a,
    base_rate_b = base_b,
    "loaded dataset"
  );

  if let Some(dir) = plots {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
  }
  let mut plotter = Plotter::new(plots, cfg.iterations);

  let mut rng = StdRng::seed_from_u64(cfg.seed);
  let outcome = run_train(&dataset, cfg, &mut rng, |iteration, prob, validation| {
    plotter.observe(iteration, prob, validation)
  })?;
  plotter.finish(&outcome.history)?;

  print_report("Before adversarial training", &outcome.pretrained);
  print_report("After adversarial training", &outcome.trained);

  if let Some(path) = history_path {
    outcome
      .history
      .to_csv(path)
      .with_context(|| format!("writing {}", path.display()))?;
    println!("History written to {}", path.display());
  }

  outcome
    .model
    .to_checkpoint(out, &outcome.scaler, &dataset.feature_names)
    .with_context(|| format!("saving model to {}", out.display()))?;
  println!("Model saved to {} as safetensors", out.display());
  Ok(())
}

fn print_report(title: &str, report: &FairnessReport) {
  println!("\n== {} ==", title);
  println!("{}", report);
}

/// Renders validation distributions while training runs.
struct Plotter {
  #[cfg_attr(not(feature = "plot"), allow(dead_code))]
  dir: Option<PathBuf>,
  #[cfg_attr(not(feature = "plot"), allow(dead_code))]
  last_iteration: usize,
  // the training observer cannot fail, so the first error waits here
  #[cfg_attr(not(feature = "plot"), allow(dead_code))]
  error: Option<fairnet::Error>,
}

impl Plotter {
  fn new(dir: Option<&Path>, last_iteration: usize) -> Self {
    if dir.is_some() && !cfg!(feature = "plot") {
      warn!("--plots given but fairnet was built without the `plot` feature");
    }
    Plotter {
      dir: dir.map(Path::to_path_buf),
      last_iteration,
      error: None,
    }
  }

  #[cfg(feature = "plot")]
  fn observe(&mut self, iteration: usize, prob: &Array1<f32>, validation: &Dataset) {
    let Some(dir) = &self.dir else { return };
    if self.error.is_some() {
      return;
    }
    if iteration % PLOT_EVERY != 0 && iteration != self.last_iteration {
      return;
    }
    let path = dir.join(format!("distributions_{:03}.png", iteration));
    let title = format!("Iteration {}", iteration);
    if let Err(e) = fairnet::plot::plot_distributions(&path, prob, &validation.protected, &title) {
      self.error = Some(e);
    }
  }

  #[cfg(not(feature = "plot"))]
  fn observe(&mut self, _iteration: usize, _prob: &Array1<f32>, _validation: &Dataset) {}

  #[cfg(feature = "plot")]
  fn finish(self, history: &History) -> Result<()> {
    if let Some(err) = self.error {
      return Err(err).context("rendering plots");
    }
    if let Some(dir) = &self.dir {
      fairnet::plot::plot_history(dir.join("history.png"), history)?;
      println!("Plots written to {}", dir.display());
    }
    Ok(())
  }

  #[cfg(not(feature = "plot"))]
  fn finish(self, _history: &History) -> Result<()> {
    Ok(())
  }
}
