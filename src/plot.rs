//! PNG charts rendered with cairo image surfaces.

use std::fs::File;
use std::path::Path;

use cairo::{Context, FontSlant, FontWeight, Format, ImageSurface};
use ndarray::Array1;

use crate::error::{Error, Result};
use crate::stats::{group_histogram, History};

const WIDTH: i32 = 640;
const HEIGHT: i32 = 400;
const MARGIN: f64 = 50.0;
const BINS: usize = 20;

const GROUP_A: (f64, f64, f64) = (0.20, 0.40, 0.80);
const GROUP_B: (f64, f64, f64) = (0.85, 0.30, 0.25);

fn plot_err<E: std::fmt::Display>(e: E) -> Error {
  Error::Plot(e.to_string())
}

struct Canvas {
  surface: ImageSurface,
  ctx: Context,
}

impl Canvas {
  fn new() -> Result<Self> {
    let surface = ImageSurface::create(Format::ARgb32, WIDTH, HEIGHT).map_err(plot_err)?;
    let ctx = Context::new(&surface).map_err(plot_err)?;

    // white background
    ctx.set_source_rgb(1.0, 1.0, 1.0);
    ctx.paint().map_err(plot_err)?;
    ctx.select_font_face("Sans", FontSlant::Normal, FontWeight::Normal);
    ctx.set_font_size(12.0);
    Ok(Canvas { surface, ctx })
  }

  fn plot_width(&self) -> f64 {
    WIDTH as f64 - 2.0 * MARGIN
  }

  fn plot_height(&self) -> f64 {
    HEIGHT as f64 - 2.0 * MARGIN
  }

  /// Map (x, y) in [0, 1]^2 to surface coordinates.
  fn to_px(&self, x: f64, y: f64) -> (f64, f64) {
    (
      MARGIN + x * self.plot_width(),
      HEIGHT as f64 - MARGIN - y * self.plot_height(),
    )
  }

  fn axes(&self, title: &str, x_label: &str) -> Result<()> {
    let ctx = &self.ctx;
    ctx.set_source_rgb(0.0, 0.0, 0.0);
    ctx.set_line_width(1.0);
    let (x0, y0) = self.to_px(0.0, 0.0);
    let (x1, _) = self.to_px(1.0, 0.0);
    let (_, y1) = self.to_px(0.0, 1.0);
    ctx.move_to(x0, y1);
    ctx.line_to(x0, y0);
    ctx.line_to(x1, y0);
    ctx.stroke().map_err(plot_err)?;

    ctx.move_to(MARGIN, MARGIN / 2.0);
    ctx.show_text(title).map_err(plot_err)?;
    ctx.move_to(x1 - 60.0, y0 + 30.0);
    ctx.show_text(x_label).map_err(plot_err)?;
    Ok(())
  }

  fn legend(&self, entries: &[(&str, (f64, f64, f64))]) -> Result<()> {
    let ctx = &self.ctx;
    for (i, (label, (r, g, b))) in entries.iter().enumerate() {
      let y = MARGIN + 10.0 + i as f64 * 18.0;
      let x = WIDTH as f64 - MARGIN - 110.0;
      ctx.set_source_rgb(*r, *g, *b);
      ctx.rectangle(x, y - 9.0, 12.0, 12.0);
      ctx.fill().map_err(plot_err)?;
      ctx.set_source_rgb(0.0, 0.0, 0.0);
      ctx.move_to(x + 18.0, y + 2.0);
      ctx.show_text(label).map_err(plot_err)?;
    }
    Ok(())
  }

  fn save(self, path: &Path) -> Result<()> {
    drop(self.ctx);
    let mut file = File::create(path)?;
    self.surface.write_to_png(&mut file).map_err(plot_err)
  }
}

/// Overlaid histograms of predicted probabilities for groups A and B.
pub fn plot_distributions<P: AsRef<Path>>(
  path: P,
  prob: &Array1<f32>,
  protected: &Array1<f32>,
  title: &str,
) -> Result<()> {
  let canvas = Canvas::new()?;
  let hist_a = group_histogram(prob, protected, 0.0, BINS);
  let hist_b = group_histogram(prob, protected, 1.0, BINS);
  let peak = hist_a
    .iter()
    .chain(hist_b.iter())
    .cloned()
    .fold(0.0f32, f32::max)
    .max(1e-6) as f64;

  let bin_width = 1.0 / BINS as f64;
  for (hist, (r, g, b)) in [(&hist_a, GROUP_A), (&hist_b, GROUP_B)] {
    canvas.ctx.set_source_rgba(r, g, b, 0.5);
    for (i, &h) in hist.iter().enumerate() {
      let (x, y) = canvas.to_px(i as f64 * bin_width, h as f64 / peak);
      let (_, base) = canvas.to_px(0.0, 0.0);
      canvas
        .ctx
        .rectangle(x, y, bin_width * canvas.plot_width(), base - y);
    }
    canvas.ctx.fill().map_err(plot_err)?;
  }

  canvas.axes(title, "P(target = 1)")?;
  canvas.legend(&[("group A", GROUP_A), ("group B", GROUP_B)])?;
  canvas.save(path.as_ref())
}

/// Accuracy, ROC AUC and p%-rule (scaled to 0..1) across iterations.
pub fn plot_history<P: AsRef<Path>>(path: P, history: &History) -> Result<()> {
  let canvas = Canvas::new()?;
  let last = history.last().map_or(1, |r| r.iteration.max(1)) as f64;

  let series: [(&str, (f64, f64, f64), fn(&crate::stats::IterationRecord) -> f32); 3] = [
    ("accuracy", (0.20, 0.60, 0.30), |r| r.accuracy),
    ("ROC AUC", GROUP_A, |r| r.roc_auc),
    ("p%-rule / 100", GROUP_B, |r| r.p_rule / 100.0),
  ];

  canvas.ctx.set_line_width(2.0);
  for (_, (r, g, b), value) in &series {
    canvas.ctx.set_source_rgb(*r, *g, *b);
    for (i, record) in history.iter().enumerate() {
      let (x, y) = canvas.to_px(record.iteration as f64 / last, value(record) as f64);
      if i == 0 {
        canvas.ctx.move_to(x, y);
      } else {
        canvas.ctx.line_to(x, y);
      }
    }
    canvas.ctx.stroke().map_err(plot_err)?;
  }

  canvas.axes("Training history", "iteration")?;
  let legend: Vec<(&str, (f64, f64, f64))> =
    series.iter().map(|(name, color, _)| (*name, *color)).collect();
  canvas.legend(&legend)?;
  canvas.save(path.as_ref())
}
