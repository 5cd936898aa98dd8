//! Posterior-predictive sampling: replay the network forward pass once
//! per posterior draw with that draw's weights, injecting fresh
//! observation noise from a per-draw RNG. Replays share no mutable
//! state and run as a parallel map over the draws.

use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::model::BnnModel;

/// One predictive output row per posterior draw over `x_new`, shape
/// (S, N_new). Draw i uses a ChaCha8 RNG seeded `seed + i` (wrapping
/// near u64::MAX), so a rerun with the same draws and seed is
/// bit-identical, and replays of the same draw under different seeds
/// differ only in the noise term.
///
/// Draws must be on the constrained scale, ordered as produced by
/// `SampleResult::merged_constrained` (chain-major).
pub fn posterior_predictive(
    model: &BnnModel,
    x_new: &Array2<f64>,
    draws: &[Vec<f64>],
    seed: u64,
) -> Result<Array2<f64>> {
    if model.d_y != 1 {
        return Err(Error::InvalidConfig(format!(
            "predictive summarization requires d_y = 1, got {}",
            model.d_y
        )));
    }
    if draws.is_empty() {
        return Err(Error::InvalidConfig("no posterior draws supplied".into()));
    }

    let n_new = x_new.nrows();
    let rows: Vec<Vec<f64>> = draws
        .par_iter()
        .enumerate()
        .map(|(i, draw)| -> Result<Vec<f64>> {
            let weights = model.decode(draw)?;
            let mean = model.forward(x_new, &weights)?;
            let sigma = weights.sigma_obs();
            let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(i as u64));
            let row = (0..n_new)
                .map(|r| {
                    let z: f64 = StandardNormal.sample(&mut rng);
                    mean[(r, 0)] + sigma * z
                })
                .collect();
            Ok(row)
        })
        .collect::<Result<Vec<_>>>()?;

    let mut out = Array2::zeros((draws.len(), n_new));
    for (i, row) in rows.into_iter().enumerate() {
        for (j, v) in row.into_iter().enumerate() {
            out[(i, j)] = v;
        }
    }
    Ok(out)
}

/// Mean curve plus a percentile band, reduced over the sample axis.
#[derive(Debug, Clone)]
pub struct PredictiveBand {
    pub mean: Vec<f64>,
    pub lo: Vec<f64>,
    pub hi: Vec<f64>,
}

/// Reduce an (S, N_new) predictive array columnwise to its mean and the
/// [q_lo, q_hi] percentile band.
pub fn summarize(samples: &Array2<f64>, q_lo: f64, q_hi: f64) -> PredictiveBand {
    let s = samples.nrows();
    let n = samples.ncols();
    let mut mean = Vec::with_capacity(n);
    let mut lo = Vec::with_capacity(n);
    let mut hi = Vec::with_capacity(n);

    for j in 0..n {
        let mut col: Vec<f64> = (0..s).map(|i| samples[(i, j)]).collect();
        mean.push(col.iter().sum::<f64>() / s as f64);
        col.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        lo.push(crate::diagnostics::quantile_sorted(&col, q_lo));
        hi.push(crate::diagnostics::quantile_sorted(&col, q_hi));
    }

    PredictiveBand { mean, lo, hi }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BnnModel;
    use ndarray::Array2;

    fn test_model() -> (BnnModel, Array2<f64>, Vec<f64>) {
        let model = BnnModel::new(2, 3, 1).unwrap();
        let x = Array2::from_shape_fn((8, 2), |(i, j)| ((i + j) as f64 * 0.4).sin());
        let draw: Vec<f64> = (0..model.param_count())
            .map(|i| 0.3 * ((i as f64) * 0.9).cos())
            .collect();
        // Force a positive precision in the last slot.
        let mut draw = draw;
        *draw.last_mut().unwrap() = 25.0;
        (model, x, draw)
    }

    #[test]
    fn predictive_shape_is_draws_by_points() {
        let (model, x, draw) = test_model();
        let draws = vec![draw.clone(), draw.clone(), draw];
        let pred = posterior_predictive(&model, &x, &draws, 0).unwrap();
        assert_eq!(pred.dim(), (3, 8));
    }

    #[test]
    fn same_draw_different_seeds_share_forward_mean() {
        let (model, x, draw) = test_model();
        let weights = model.decode(&draw).unwrap();
        let mean = model.forward(&x, &weights).unwrap();
        let sigma = weights.sigma_obs();

        let a = posterior_predictive(&model, &x, &[draw.clone()], 1).unwrap();
        let b = posterior_predictive(&model, &x, &[draw], 2).unwrap();

        for j in 0..8 {
            let da = a[(0, j)] - mean[(j, 0)];
            let db = b[(0, j)] - mean[(j, 0)];
            // Residuals are pure observation noise, bounded by a few sigma.
            assert!(da.abs() < 6.0 * sigma);
            assert!(db.abs() < 6.0 * sigma);
        }
        assert_ne!(a, b);
    }

    #[test]
    fn predictive_is_deterministic_given_seed() {
        let (model, x, draw) = test_model();
        let draws = vec![draw.clone(), draw];
        let a = posterior_predictive(&model, &x, &draws, 42).unwrap();
        let b = posterior_predictive(&model, &x, &draws, 42).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn seed_at_u64_max_wraps_across_draws() {
        let (model, x, draw) = test_model();
        let draws = vec![draw.clone(), draw];
        let pred = posterior_predictive(&model, &x, &draws, u64::MAX).unwrap();
        assert_eq!(pred.dim(), (2, 8));
        // The wrapped streams (u64::MAX and 0) draw different noise.
        assert_ne!(pred.row(0), pred.row(1));
    }

    #[test]
    fn empty_draws_rejected() {
        let (model, x, _) = test_model();
        assert!(posterior_predictive(&model, &x, &[], 0).is_err());
    }

    #[test]
    fn band_brackets_the_mean_for_symmetric_noise() {
        let (model, x, draw) = test_model();
        let draws: Vec<Vec<f64>> = (0..200).map(|_| draw.clone()).collect();
        let pred = posterior_predictive(&model, &x, &draws, 9).unwrap();
        let band = summarize(&pred, 0.05, 0.95);
        assert_eq!(band.mean.len(), 8);
        for j in 0..8 {
            assert!(band.lo[j] <= band.mean[j]);
            assert!(band.mean[j] <= band.hi[j]);
        }
    }
}
