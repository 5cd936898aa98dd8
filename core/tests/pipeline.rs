//! End-to-end run at reduced size: generate data, fit with NUTS,
//! replay the posterior predictive, and summarize the band.

use bnnfit_core::data::make_regression;
use bnnfit_core::model::BnnModel;
use bnnfit_core::predict::{posterior_predictive, summarize};
use bnnfit_core::sampler::{sample, SampleResult, SamplerConfig};

const NUM_DATA: usize = 60;
const D_X: usize = 3;
const D_H: usize = 3;
const NUM_TEST: usize = 40;
const NUM_DRAWS: usize = 250;
const NUM_WARMUP: usize = 200;

fn fit(num_chains: usize) -> (BnnModel, SampleResult) {
    let ds = make_regression(NUM_DATA, D_X, 0.05, NUM_TEST).unwrap();
    let model = BnnModel::new(D_X, D_H, 1).unwrap();
    let graph = model.graph(&ds.x, Some(&ds.y)).unwrap();
    let config = SamplerConfig {
        num_chains,
        num_draws: NUM_DRAWS,
        num_warmup: NUM_WARMUP,
        seed: 7,
        ..Default::default()
    };
    (model, sample(graph, &config, None).unwrap())
}

#[test]
fn retained_draw_count_is_chains_times_samples() {
    let (_, result) = fit(2);
    assert_eq!(result.num_chains(), 2);
    assert_eq!(result.num_draws_per_chain(), NUM_DRAWS);
    assert_eq!(result.merged_constrained().len(), 2 * NUM_DRAWS);
}

#[test]
fn every_draw_decodes_into_block_shapes() {
    let (model, result) = fit(1);
    for draw in result.merged_constrained() {
        let w = model.decode(&draw).unwrap();
        assert_eq!(w.w1.dim(), (D_X, D_H));
        assert_eq!(w.w2.dim(), (D_H, D_H));
        assert_eq!(w.w3.dim(), (D_H, 1));
        assert!(w.prec_obs > 0.0);
        assert!(w.sigma_obs().is_finite());
    }
}

#[test]
fn predictive_band_tracks_the_mean_curve() {
    let ds = make_regression(NUM_DATA, D_X, 0.05, NUM_TEST).unwrap();
    let (model, result) = fit(1);
    let draws = result.merged_constrained();

    let pred = posterior_predictive(&model, &ds.x_test, &draws, 99).unwrap();
    assert_eq!(pred.dim(), (NUM_DRAWS, NUM_TEST));

    let band = summarize(&pred, 0.05, 0.95);
    assert_eq!(band.mean.len(), NUM_TEST);

    // The 90% band should bracket the mean almost everywhere.
    let inside = (0..NUM_TEST)
        .filter(|&j| band.lo[j] <= band.mean[j] && band.mean[j] <= band.hi[j])
        .count();
    assert!(
        inside as f64 >= 0.85 * NUM_TEST as f64,
        "band brackets the mean at only {}/{} points",
        inside,
        NUM_TEST
    );

    // Band widths are positive and finite.
    for j in 0..NUM_TEST {
        assert!(band.hi[j] > band.lo[j]);
        assert!(band.mean[j].is_finite());
    }
}
