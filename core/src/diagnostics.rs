//! MCMC convergence diagnostics: split R-hat and rank-normalized bulk
//! ESS following Vehtari et al. (2021), rendered as a per-parameter
//! summary table on the constrained scale.

use crate::sampler::SampleResult;

/// Per-parameter posterior summary.
#[derive(Debug, Clone)]
pub struct ParamSummary {
    pub name: String,
    pub mean: f64,
    pub std: f64,
    pub q5: f64,
    pub q95: f64,
    pub n_eff: f64,
    pub r_hat: f64,
}

/// Full diagnostic report for a sampling run.
#[derive(Debug, Clone)]
pub struct DiagnosticsReport {
    pub params: Vec<ParamSummary>,
    pub num_chains: usize,
    pub num_draws: usize,
    pub accept_rates: Vec<f64>,
    pub divergences: usize,
}

impl DiagnosticsReport {
    /// Render the report as a formatted table string.
    pub fn to_table(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!(
            "{} chains × {} draws per chain",
            self.num_chains, self.num_draws
        ));
        lines.push(String::new());
        lines.push(format!(
            "{:<12} {:>9} {:>9} {:>9} {:>9} {:>8} {:>7}",
            "Parameter", "mean", "std", "5.0%", "95.0%", "n_eff", "r_hat"
        ));
        lines.push("─".repeat(68));

        for p in &self.params {
            let n_eff = if p.n_eff.is_finite() {
                format!("{:.0}", p.n_eff)
            } else {
                "NaN".to_string()
            };
            lines.push(format!(
                "{:<12} {:>9.3} {:>9.3} {:>9.3} {:>9.3} {:>8} {:>7.3}",
                p.name, p.mean, p.std, p.q5, p.q95, n_eff, p.r_hat
            ));
        }

        lines.push("─".repeat(68));

        let avg_accept: f64 =
            self.accept_rates.iter().sum::<f64>() / self.accept_rates.len() as f64;
        lines.push(format!(
            "Mean accept rate: {:.2}  │  Divergences: {}",
            avg_accept, self.divergences
        ));

        let any_bad_rhat = self
            .params
            .iter()
            .any(|p| p.r_hat > 1.05 || !p.r_hat.is_finite());
        let any_low_ess = self.params.iter().any(|p| p.n_eff < 400.0);

        if any_bad_rhat {
            lines.push("⚠  Some R-hat values > 1.05 — chains may not have converged.".to_string());
        }
        if any_low_ess {
            lines.push("⚠  Some ESS values < 400 — consider increasing draws or tuning.".to_string());
        }
        if self.divergences > 0 {
            lines.push(format!(
                "⚠  {} divergent transitions — results may be unreliable.",
                self.divergences
            ));
        }

        lines.join("\n")
    }
}

/// Compute the full report from a sampling result (constrained scale).
pub fn compute_diagnostics(result: &SampleResult) -> DiagnosticsReport {
    let chains = result.constrained_chains();
    let n_chains = chains.len();
    let n_draws = result.num_draws_per_chain();
    let n_params = result.param_names.len();

    let mut params = Vec::with_capacity(n_params);
    for pidx in 0..n_params {
        let traces: Vec<Vec<f64>> = chains
            .iter()
            .map(|c| c.iter().map(|draw| draw[pidx]).collect())
            .collect();

        let mean = pooled_mean(&traces);
        let std = pooled_std(&traces, mean);

        let mut all: Vec<f64> = traces.iter().flat_map(|c| c.iter().copied()).collect();
        all.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        params.push(ParamSummary {
            name: result.param_names[pidx].clone(),
            mean,
            std,
            q5: quantile_sorted(&all, 0.05),
            q95: quantile_sorted(&all, 0.95),
            n_eff: ess_bulk(&traces),
            r_hat: split_r_hat(&traces),
        });
    }

    DiagnosticsReport {
        params,
        num_chains: n_chains,
        num_draws: n_draws,
        accept_rates: result.accept_rates.clone(),
        divergences: result.divergences,
    }
}

// ── Internal helpers ────────────────────────────────────────────────

fn mean_of(data: &[f64]) -> f64 {
    data.iter().sum::<f64>() / data.len() as f64
}

fn pooled_mean(chains: &[Vec<f64>]) -> f64 {
    let total: usize = chains.iter().map(|c| c.len()).sum();
    chains.iter().flat_map(|c| c.iter()).sum::<f64>() / total as f64
}

fn pooled_std(chains: &[Vec<f64>], mean: f64) -> f64 {
    let total: usize = chains.iter().map(|c| c.len()).sum();
    let sum_sq: f64 = chains
        .iter()
        .flat_map(|c| c.iter())
        .map(|&v| (v - mean) * (v - mean))
        .sum();
    (sum_sq / (total - 1) as f64).sqrt()
}

/// Linear-interpolation quantile of pre-sorted data.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let idx = q * (sorted.len() - 1) as f64;
    let lo = idx.floor() as usize;
    let hi = idx.ceil() as usize;
    let frac = idx - lo as f64;
    sorted[lo] * (1.0 - frac) + sorted[hi.min(sorted.len() - 1)] * frac
}

fn split_halves(chains: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let mut split = Vec::with_capacity(chains.len() * 2);
    for chain in chains {
        let mid = chain.len() / 2;
        split.push(chain[..mid].to_vec());
        split.push(chain[mid..].to_vec());
    }
    split
}

/// Split R-hat: halve every chain, then compare between- and
/// within-chain variance across the 2M half-chains.
pub fn split_r_hat(chains: &[Vec<f64>]) -> f64 {
    let split = split_halves(chains);
    let m = split.len() as f64;
    let n = split[0].len() as f64;

    let chain_means: Vec<f64> = split.iter().map(|c| mean_of(c)).collect();
    let grand_mean = chain_means.iter().sum::<f64>() / m;

    let b = n / (m - 1.0)
        * chain_means
            .iter()
            .map(|&cm| (cm - grand_mean).powi(2))
            .sum::<f64>();

    let w = split
        .iter()
        .map(|c| {
            let cm = mean_of(c);
            c.iter().map(|&x| (x - cm).powi(2)).sum::<f64>() / (n - 1.0)
        })
        .sum::<f64>()
        / m;

    if w < 1e-30 {
        return f64::NAN;
    }

    let var_hat = (n - 1.0) / n * w + b / n;
    (var_hat / w).sqrt()
}

/// Bulk ESS: rank-normalize the pooled draws, then apply Geyer's initial
/// monotone sequence estimate on the split chains.
pub fn ess_bulk(chains: &[Vec<f64>]) -> f64 {
    let ranked = rank_normalize(chains);
    ess_autocorr(&ranked)
}

/// Replace draws by the normal scores of their pooled ranks
/// (ties averaged): Φ⁻¹((rank − 3/8) / (N + 1/4)).
fn rank_normalize(chains: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n_chains = chains.len();
    let n_per = chains[0].len();
    let total = n_chains * n_per;

    let mut indexed: Vec<(f64, usize, usize)> = Vec::with_capacity(total);
    for (ci, chain) in chains.iter().enumerate() {
        for (di, &v) in chain.iter().enumerate() {
            indexed.push((v, ci, di));
        }
    }
    indexed.sort_unstable_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut ranks = vec![0.0f64; total];
    let mut i = 0;
    while i < total {
        let mut j = i;
        while j < total && indexed[j].0 == indexed[i].0 {
            j += 1;
        }
        let avg_rank = (i + j + 1) as f64 / 2.0;
        for r in ranks.iter_mut().take(j).skip(i) {
            *r = avg_rank;
        }
        i = j;
    }

    let n_f = total as f64;
    let mut result = vec![vec![0.0; n_per]; n_chains];
    for (idx, &(_, ci, di)) in indexed.iter().enumerate() {
        let p = (ranks[idx] - 0.375) / (n_f + 0.25);
        result[ci][di] = inv_normal_cdf(p);
    }
    result
}

/// ESS from split chains via autocorrelation (Geyer's initial monotone
/// sequence).
fn ess_autocorr(chains: &[Vec<f64>]) -> f64 {
    let split = split_halves(chains);
    let m = split.len();
    let n = split[0].len();
    let m_f = m as f64;
    let n_f = n as f64;

    let chain_means: Vec<f64> = split.iter().map(|c| mean_of(c)).collect();

    let w: f64 = split
        .iter()
        .map(|c| {
            let cm = mean_of(c);
            c.iter().map(|&x| (x - cm).powi(2)).sum::<f64>() / (n_f - 1.0)
        })
        .sum::<f64>()
        / m_f;

    if w < 1e-30 {
        return f64::NAN;
    }

    let mut rho_hat = Vec::with_capacity(n);
    for lag in 0..n {
        let mut gamma = 0.0f64;
        for (ci, chain) in split.iter().enumerate() {
            let cm = chain_means[ci];
            for t in 0..(n - lag) {
                gamma += (chain[t] - cm) * (chain[t + lag] - cm);
            }
        }
        gamma /= m_f * (n_f - 1.0);
        rho_hat.push(1.0 - (w - gamma) / w);
    }

    // Sum consecutive autocorrelation pairs until the sum turns negative.
    let mut tau = -1.0f64;
    let mut t = 1;
    while t + 1 < rho_hat.len() {
        let pair_sum = rho_hat[t] + rho_hat[t + 1];
        if pair_sum < 0.0 {
            break;
        }
        tau += pair_sum;
        t += 2;
    }
    tau = tau.max(1.0 / (m_f * n_f));

    m_f * n_f / (1.0 + 2.0 * tau)
}

/// Approximate inverse normal CDF (Beasley-Springer-Moro).
fn inv_normal_cdf(p: f64) -> f64 {
    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }

    let t = if p < 0.5 {
        (-2.0 * p.ln()).sqrt()
    } else {
        (-2.0 * (1.0 - p).ln()).sqrt()
    };

    let c0 = 2.515517;
    let c1 = 0.802853;
    let c2 = 0.010328;
    let d1 = 1.432788;
    let d2 = 0.189269;
    let d3 = 0.001308;

    let val = t - (c0 + c1 * t + c2 * t * t) / (1.0 + d1 * t + d2 * t * t + d3 * t * t * t);

    if p < 0.5 {
        -val
    } else {
        val
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn r_hat_near_one_for_matching_chains() {
        let chains: Vec<Vec<f64>> = (0..4)
            .map(|seed| {
                let mut v = seed as f64;
                (0..1000)
                    .map(|i| {
                        v = (v * 1.1 + 0.3).sin() * 10.0;
                        v + (i as f64 * 0.001)
                    })
                    .collect()
            })
            .collect();
        let rh = split_r_hat(&chains);
        assert!(rh < 1.1, "expected R-hat near 1.0, got {}", rh);
    }

    #[test]
    fn r_hat_large_for_separated_chains() {
        let chain1: Vec<f64> = (0..500).map(|i| 0.0 + (i as f64 * 0.001)).collect();
        let chain2: Vec<f64> = (0..500).map(|i| 100.0 + (i as f64 * 0.001)).collect();
        let rh = split_r_hat(&[chain1, chain2]);
        assert!(rh > 1.5, "expected large R-hat, got {}", rh);
    }

    #[test]
    fn ess_positive_for_mixing_chains() {
        let chains: Vec<Vec<f64>> = (0..4)
            .map(|seed| {
                (0..500)
                    .map(|i| (((seed * 1000 + i) as f64) * 0.1).sin() * 2.0)
                    .collect()
            })
            .collect();
        let ess = ess_bulk(&chains);
        assert!(ess > 0.0, "ESS should be positive, got {}", ess);
    }

    #[test]
    fn quantiles_interpolate_linearly() {
        let sorted: Vec<f64> = (0..=100).map(|i| i as f64).collect();
        assert!((quantile_sorted(&sorted, 0.05) - 5.0).abs() < 1e-12);
        assert!((quantile_sorted(&sorted, 0.95) - 95.0).abs() < 1e-12);
        assert!((quantile_sorted(&sorted, 0.5) - 50.0).abs() < 1e-12);
    }
}
