use std::path::PathBuf;

use anyhow::{bail, Context};
use plotters::prelude::*;
use spade_gan::{logger, spectral::SpectralNorm, Shape, Tensor};
use structopt::StructOpt;

/// Tracks the power iteration estimate of a random matrix's largest singular value.
#[derive(StructOpt)]
pub struct SigmaOptions {
    #[structopt(short, long, default_value = "64")]
    rows: usize,
    #[structopt(short, long, default_value = "64")]
    cols: usize,
    /// Power iterations per training step
    #[structopt(short, long, default_value = "1")]
    iterations: usize,
    #[structopt(short, long, default_value = "50")]
    steps: usize,
    /// Write the convergence curve to this image
    #[structopt(short, long, parse(from_os_str))]
    plot: Option<PathBuf>,
}

const LINE_COLOUR: RGBColor = RGBColor(31, 119, 180);
const CHART_BG_COLOUR: RGBAColor = RGBAColor(234, 234, 242, 1.0);
const FONT: &str = "sans-serif";
const IMG_DIMS: (u32, u32) = (1280, 720);

impl SigmaOptions {
    pub fn run(&self) -> anyhow::Result<()> {
        if self.rows == 0 || self.cols == 0 {
            bail!("Matrix dimensions must be positive, got {}x{}!", self.rows, self.cols);
        }

        let weight = Tensor::random(Shape::new(&[self.rows, self.cols]), 0.0, 1.0, true);
        let mut sn = SpectralNorm::new(weight, self.iterations, 0, spade_gan::spectral::DEFAULT_EPS)?;

        let mut history = Vec::with_capacity(self.steps);
        for step in 1..=self.steps {
            let sigma = sn.forward(true).sigma;
            logger::report_spectral_norm("weight", sigma, step * self.iterations);
            history.push((step, sigma));
        }

        if let Some(path) = &self.plot {
            plot(path, &history).with_context(|| format!("Failed to plot to {}.", path.display()))?;
            println!("Plot saved to {}", path.display());
        }

        Ok(())
    }
}

fn plot(path: &PathBuf, history: &[(usize, f32)]) -> anyhow::Result<()> {
    if history.is_empty() {
        bail!("Nothing to plot!");
    }

    let x_max = history.len() as i32;
    let y_max = history.iter().map(|&(_, s)| s).fold(f32::MIN, f32::max) * 1.05;

    let root = BitMapBackend::new(path, IMG_DIMS).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("Spectral norm estimate", (FONT, 40))
        .margin(20)
        .x_label_area_size(60)
        .y_label_area_size(80)
        .build_cartesian_2d(0..x_max, 0f32..y_max)?;

    chart.plotting_area().fill(&CHART_BG_COLOUR)?;

    chart.configure_mesh().x_desc("Step").y_desc("Sigma").draw()?;

    chart.draw_series(LineSeries::new(
        history.iter().map(|&(x, y)| (x as i32, y)),
        ShapeStyle::from(LINE_COLOUR).stroke_width(2),
    ))?;

    root.present()?;

    Ok(())
}
