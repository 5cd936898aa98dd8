//! Render the posterior-predictive band: training scatter, shaded 90%
//! interval, and the predictive mean curve.

use anyhow::{anyhow, Result};
use bnnfit_core::predict::PredictiveBand;
use plotters::prelude::*;

const WIDTH: u32 = 960;
const HEIGHT: u32 = 640;

/// Draw the figure to `path`. `train` holds (coordinate, observed y)
/// pairs; `xs` is the test-point plotting coordinate, aligned with the
/// band vectors.
pub fn render(path: &str, train: &[(f64, f64)], xs: &[f64], band: &PredictiveBand) -> Result<()> {
    let (x_min, x_max) = value_range(xs.iter().copied(), 0.05);
    let (y_min, y_max) = value_range(
        band.lo
            .iter()
            .chain(band.hi.iter())
            .copied()
            .chain(train.iter().map(|&(_, y)| y)),
        0.10,
    );

    let root = BitMapBackend::new(path, (WIDTH, HEIGHT)).into_drawing_area();
    root.fill(&WHITE).map_err(|e| anyhow!("plot: {e}"))?;

    let mut chart = ChartBuilder::on(&root)
        .caption("Bayesian neural network — posterior predictive", ("sans-serif", 24))
        .margin(12)
        .x_label_area_size(36)
        .y_label_area_size(48)
        .build_cartesian_2d(x_min..x_max, y_min..y_max)
        .map_err(|e| anyhow!("plot: {e}"))?;

    chart
        .configure_mesh()
        .x_desc("x")
        .y_desc("y")
        .draw()
        .map_err(|e| anyhow!("plot: {e}"))?;

    // 90% interval as a closed polygon: upper curve, then lower reversed.
    let mut polygon: Vec<(f64, f64)> = xs.iter().zip(band.hi.iter()).map(|(&x, &y)| (x, y)).collect();
    polygon.extend(xs.iter().zip(band.lo.iter()).rev().map(|(&x, &y)| (x, y)));
    chart
        .draw_series(std::iter::once(Polygon::new(polygon, BLUE.mix(0.2))))
        .map_err(|e| anyhow!("plot: {e}"))?
        .label("90% interval")
        .legend(|(x, y)| Rectangle::new([(x, y - 4), (x + 12, y + 4)], BLUE.mix(0.2).filled()));

    chart
        .draw_series(LineSeries::new(
            xs.iter().zip(band.mean.iter()).map(|(&x, &y)| (x, y)),
            BLUE.stroke_width(2),
        ))
        .map_err(|e| anyhow!("plot: {e}"))?
        .label("posterior mean")
        .legend(|(x, y)| PathElement::new([(x, y), (x + 12, y)], BLUE.stroke_width(2)));

    chart
        .draw_series(
            train
                .iter()
                .map(|&(x, y)| Circle::new((x, y), 3, GREEN.filled())),
        )
        .map_err(|e| anyhow!("plot: {e}"))?
        .label("training data")
        .legend(|(x, y)| Circle::new((x + 6, y), 3, GREEN.filled()));

    chart
        .configure_series_labels()
        .border_style(BLACK)
        .background_style(WHITE.mix(0.8))
        .draw()
        .map_err(|e| anyhow!("plot: {e}"))?;

    root.present().map_err(|e| anyhow!("plot: {e}"))?;
    Ok(())
}

fn value_range(values: impl Iterator<Item = f64>, pad_frac: f64) -> (f64, f64) {
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for v in values {
        lo = lo.min(v);
        hi = hi.max(v);
    }
    if !lo.is_finite() || !hi.is_finite() {
        return (0.0, 1.0);
    }
    let pad = (hi - lo).max(1e-9) * pad_frac;
    (lo - pad, hi + pad)
}
