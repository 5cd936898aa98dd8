//! No-U-Turn Sampler — Hoffman & Gelman (2014) with multinomial
//! candidate selection (Betancourt 2017), the variant used by Stan and
//! PyMC:
//!
//!   - Iterative trajectory doubling, forward or backward per depth
//!   - Generalized U-turn criterion on subtrees
//!   - Multinomial proposal selection weighted by exp(-H)
//!   - Divergence detection via an energy-error threshold
//!   - Dual-averaging step-size and diagonal mass-matrix adaptation

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::autodiff::Evaluator;
use crate::graph::Graph;
use crate::progress::ProgressState;

/// Energy error beyond which a trajectory is declared divergent. The
/// draw is recorded as divergent and the chain keeps running.
const MAX_ENERGY_ERROR: f64 = 1000.0;

#[derive(Debug, Clone)]
pub struct NutsConfig {
    /// 0.0 means find an initial step size automatically.
    pub step_size: f64,
    pub max_tree_depth: usize,
    pub num_draws: usize,
    pub num_warmup: usize,
}

impl Default for NutsConfig {
    fn default() -> Self {
        Self {
            step_size: 0.0,
            max_tree_depth: 10,
            num_draws: 1000,
            num_warmup: 500,
        }
    }
}

/// Result of a single chain run. Samples are unconstrained draws in the
/// order they were retained.
#[derive(Debug, Clone)]
pub struct ChainResult {
    pub samples: Vec<Vec<f64>>,
    pub accept_rate: f64,
    pub step_size: f64,
    pub divergences: usize,
}

/// A point on the Hamiltonian trajectory.
#[derive(Clone)]
struct PhasePoint {
    q: Vec<f64>,
    p: Vec<f64>,
    grad: Vec<f64>,
    logp: f64,
}

impl PhasePoint {
    fn energy(&self, mass: &MassMatrix) -> f64 {
        -self.logp + mass.kinetic(&self.p)
    }
}

/// Diagonal mass matrix with cached square roots for momentum draws.
struct MassMatrix {
    inv_diag: Vec<f64>,
    sqrt_diag: Vec<f64>,
}

impl MassMatrix {
    fn identity(dim: usize) -> Self {
        Self {
            inv_diag: vec![1.0; dim],
            sqrt_diag: vec![1.0; dim],
        }
    }

    fn from_variances(vars: &[f64]) -> Self {
        let mut m = Self::identity(vars.len());
        for (i, &v) in vars.iter().enumerate() {
            if v > 1e-8 {
                m.inv_diag[i] = 1.0 / v;
                m.sqrt_diag[i] = v.sqrt();
            }
        }
        m
    }

    fn kinetic(&self, p: &[f64]) -> f64 {
        p.iter()
            .zip(self.inv_diag.iter())
            .map(|(&pi, &im)| 0.5 * pi * pi * im)
            .sum()
    }

    fn sample_momentum(&self, p: &mut [f64], rng: &mut ChaCha8Rng) {
        for (pi, &s) in p.iter_mut().zip(self.sqrt_diag.iter()) {
            let z: f64 = StandardNormal.sample(rng);
            *pi = z * s;
        }
    }
}

/// Nesterov dual averaging of the log step size (Hoffman & Gelman §3.2).
struct DualAveraging {
    mu: f64,
    gamma: f64,
    t0: f64,
    kappa: f64,
    target: f64,
    h_bar: f64,
    log_eps_bar: f64,
    count: u64,
}

impl DualAveraging {
    fn new(init_step: f64, target: f64) -> Self {
        Self {
            mu: (10.0 * init_step).ln(),
            gamma: 0.05,
            t0: 10.0,
            kappa: 0.75,
            target,
            h_bar: 0.0,
            log_eps_bar: init_step.ln(),
            count: 0,
        }
    }

    /// Feed one acceptance statistic; returns the step size to use next.
    fn advance(&mut self, accept_stat: f64) -> f64 {
        self.count += 1;
        let m = self.count as f64;
        let w = 1.0 / (m + self.t0);
        self.h_bar = (1.0 - w) * self.h_bar + w * (self.target - accept_stat);
        let log_eps = self.mu - (m.sqrt() / self.gamma) * self.h_bar;
        let m_pow = m.powf(-self.kappa);
        self.log_eps_bar = m_pow * log_eps + (1.0 - m_pow) * self.log_eps_bar;
        log_eps.exp()
    }

    /// The smoothed step size, used after warmup ends.
    fn adapted(&self) -> f64 {
        self.log_eps_bar.exp()
    }

    fn restart(&mut self, step: f64) {
        self.mu = (10.0 * step).ln();
        self.log_eps_bar = step.ln();
        self.h_bar = 0.0;
        self.count = 0;
    }
}

/// Running first and second moments of warmup positions, used to build
/// the diagonal mass matrix.
struct RunningMoments {
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
    count: usize,
}

impl RunningMoments {
    fn new(dim: usize) -> Self {
        Self {
            sum: vec![0.0; dim],
            sum_sq: vec![0.0; dim],
            count: 0,
        }
    }

    fn push(&mut self, q: &[f64]) {
        for (i, &v) in q.iter().enumerate() {
            self.sum[i] += v;
            self.sum_sq[i] += v * v;
        }
        self.count += 1;
    }

    fn variances(&self) -> Vec<f64> {
        let n = self.count as f64;
        self.sum
            .iter()
            .zip(self.sum_sq.iter())
            .map(|(&s, &ss)| ss / n - (s / n) * (s / n))
            .collect()
    }
}

/// Run a single NUTS chain.
///
/// Warmup phases (fractions of `num_warmup`):
///   Phase 1 (15%): step-size adaptation, identity mass matrix
///   Phase 2 (75%): collect positions → diagonal mass matrix
///   Phase 3 (10%): final step-size adaptation with the adapted mass
pub fn run_chain(
    graph: &Graph,
    config: &NutsConfig,
    rng: &mut ChaCha8Rng,
    init: Option<Vec<f64>>,
    progress: Option<&ProgressState>,
) -> ChainResult {
    let dim = graph.param_count;
    let total_iters = config.num_warmup + config.num_draws;

    let mut evaluator = Evaluator::new(graph);
    let q0 = init.unwrap_or_else(|| vec![0.0; dim]);
    let mut samples = Vec::with_capacity(config.num_draws);
    let mut divergences = 0usize;
    let mut sum_accept = 0.0f64;

    let mut mass = MassMatrix::identity(dim);

    let phase1_end = config.num_warmup * 15 / 100;
    let phase2_end = config.num_warmup * 90 / 100;
    let mut moments = RunningMoments::new(dim);

    let mut step_size = if config.step_size > 0.0 {
        config.step_size
    } else {
        initial_step_size(graph, &mut evaluator, &q0, &mass, rng)
    };

    // Target accept 0.80, following Stan's NUTS default.
    let mut adapt = DualAveraging::new(step_size, 0.80);

    evaluator.compute(graph, &q0);
    let mut current = PhasePoint {
        q: q0,
        p: vec![0.0; dim],
        grad: evaluator.grad.clone(),
        logp: evaluator.total_logp,
    };

    for iter in 0..total_iters {
        let is_warmup = iter < config.num_warmup;

        mass.sample_momentum(&mut current.p, rng);
        let h0 = current.energy(&mass);

        let (proposal, info) = build_trajectory(
            graph,
            &mut evaluator,
            &current,
            step_size,
            &mass,
            h0,
            config.max_tree_depth,
            rng,
        );

        // The multinomial weighting handles acceptance internally; the
        // proposal is taken unless the trajectory diverged.
        if !info.diverging {
            current.q.copy_from_slice(&proposal.q);
            current.grad.copy_from_slice(&proposal.grad);
            current.logp = proposal.logp;
        } else {
            divergences += 1;
        }

        sum_accept += info.mean_accept;

        if let Some(p) = progress {
            p.increment();
            p.add_leapfrogs(info.n_leapfrog);
            if info.diverging {
                p.add_divergence();
            }
        }

        if is_warmup {
            step_size = adapt.advance(info.mean_accept);

            if iter >= phase1_end && iter < phase2_end {
                moments.push(&current.q);
            }

            if iter == phase2_end && moments.count > 10 {
                mass = MassMatrix::from_variances(&moments.variances());
                let fresh = initial_step_size(graph, &mut evaluator, &current.q, &mass, rng);
                step_size = fresh;
                adapt.restart(fresh);
                // Recompute the cached state after evaluator reuse
                evaluator.compute(graph, &current.q);
                current.logp = evaluator.total_logp;
                current.grad.copy_from_slice(&evaluator.grad);
            }

            if iter + 1 == config.num_warmup {
                step_size = adapt.adapted();
            }
        } else {
            samples.push(current.q.clone());
        }
    }

    ChainResult {
        samples,
        accept_rate: sum_accept / total_iters as f64,
        step_size,
        divergences,
    }
}

struct TrajectoryInfo {
    diverging: bool,
    mean_accept: f64,
    n_leapfrog: usize,
}

/// One balanced subtree built during the doubling process.
struct Subtree {
    left: PhasePoint,
    right: PhasePoint,
    /// Multinomial-selected candidate among the subtree's valid leaves.
    proposal: PhasePoint,
    /// Log of the sum of exp(-ΔH) leaf weights.
    log_sum_weight: f64,
    depth: usize,
    n_leapfrog: usize,
    turning: bool,
    diverging: bool,
}

/// Grow the trajectory by doubling until a U-turn, divergence, or the
/// depth cap. At depth j the new subtree has 2^j leaves, appended on a
/// uniformly random side of the current trajectory.
#[allow(clippy::too_many_arguments)]
fn build_trajectory(
    graph: &Graph,
    evaluator: &mut Evaluator,
    initial: &PhasePoint,
    eps: f64,
    mass: &MassMatrix,
    h0: f64,
    max_depth: usize,
    rng: &mut ChaCha8Rng,
) -> (PhasePoint, TrajectoryInfo) {
    let mut left = initial.clone();
    let mut right = initial.clone();
    let mut proposal = initial.clone();
    let mut log_sum_weight = 0.0f64; // the initial point carries weight exp(0)
    let mut depth = 0;
    let mut n_leapfrog = 0usize;
    let mut sum_accept_stat = 0.0f64;
    let mut n_accept_stat = 0usize;
    let mut diverging = false;

    while depth < max_depth {
        let forward = rng.gen::<bool>();
        let subtree = if forward {
            grow_subtree(graph, evaluator, &right, eps, mass, h0, depth, rng)
        } else {
            grow_subtree(graph, evaluator, &left, -eps, mass, h0, depth, rng)
        };

        n_leapfrog += subtree.n_leapfrog;

        if subtree.diverging {
            diverging = true;
            break;
        }
        if subtree.turning {
            break;
        }

        // Multinomial combination across the doubled tree.
        let accept_prob = (subtree.log_sum_weight - log_sum_weight).min(0.0).exp();
        if rng.gen::<f64>() < accept_prob {
            proposal = subtree.proposal;
        }
        log_sum_weight = log_sum_exp(log_sum_weight, subtree.log_sum_weight);

        let n_leaves = 1usize << subtree.depth;
        sum_accept_stat += subtree.log_sum_weight.exp().min(n_leaves as f64);
        n_accept_stat += n_leaves;

        if forward {
            right = subtree.right;
        } else {
            left = subtree.left;
        }

        if is_turning(&left, &right, mass) {
            break;
        }

        depth += 1;
    }

    let mean_accept = if n_accept_stat > 0 {
        (sum_accept_stat / n_accept_stat as f64).min(1.0)
    } else {
        0.0
    };

    (
        proposal,
        TrajectoryInfo {
            diverging,
            mean_accept,
            n_leapfrog,
        },
    )
}

/// Recursively build a balanced binary subtree of the given depth.
/// Depth 0 is a single leapfrog step.
#[allow(clippy::too_many_arguments)]
fn grow_subtree(
    graph: &Graph,
    evaluator: &mut Evaluator,
    start: &PhasePoint,
    eps: f64,
    mass: &MassMatrix,
    h0: f64,
    depth: usize,
    rng: &mut ChaCha8Rng,
) -> Subtree {
    if depth == 0 {
        let next = leapfrog(graph, evaluator, start, eps, mass);
        let delta_h = next.energy(mass) - h0;
        let diverging = delta_h > MAX_ENERGY_ERROR || !delta_h.is_finite();
        let log_weight = if diverging { f64::NEG_INFINITY } else { -delta_h };

        return Subtree {
            left: next.clone(),
            right: next.clone(),
            proposal: next,
            log_sum_weight: log_weight,
            depth: 0,
            n_leapfrog: 1,
            turning: false,
            diverging,
        };
    }

    let inner = grow_subtree(graph, evaluator, start, eps, mass, h0, depth - 1, rng);
    if inner.diverging || inner.turning {
        return inner;
    }

    let next_start = if eps > 0.0 { &inner.right } else { &inner.left };
    let outer = grow_subtree(graph, evaluator, next_start, eps, mass, h0, depth - 1, rng);

    if outer.diverging {
        return Subtree {
            left: inner.left,
            right: inner.right,
            proposal: inner.proposal,
            log_sum_weight: inner.log_sum_weight,
            depth,
            n_leapfrog: inner.n_leapfrog + outer.n_leapfrog,
            turning: false,
            diverging: true,
        };
    }

    let log_sum = log_sum_exp(inner.log_sum_weight, outer.log_sum_weight);
    let take_outer = rng.gen::<f64>() < (outer.log_sum_weight - log_sum).exp();
    let proposal = if take_outer {
        outer.proposal
    } else {
        inner.proposal
    };

    let (left, right) = if eps > 0.0 {
        (inner.left, outer.right)
    } else {
        (outer.left, inner.right)
    };

    let turning = outer.turning || is_turning(&left, &right, mass);

    Subtree {
        left,
        right,
        proposal,
        log_sum_weight: log_sum,
        depth,
        n_leapfrog: inner.n_leapfrog + outer.n_leapfrog,
        turning,
        diverging: false,
    }
}

/// Single leapfrog step: half-step momentum, full-step position,
/// half-step momentum.
fn leapfrog(
    graph: &Graph,
    evaluator: &mut Evaluator,
    point: &PhasePoint,
    eps: f64,
    mass: &MassMatrix,
) -> PhasePoint {
    let dim = point.q.len();
    let mut p_new = vec![0.0; dim];
    let mut q_new = vec![0.0; dim];

    for i in 0..dim {
        p_new[i] = point.p[i] + 0.5 * eps * point.grad[i];
    }
    for i in 0..dim {
        q_new[i] = point.q[i] + eps * mass.inv_diag[i] * p_new[i];
    }
    evaluator.compute(graph, &q_new);
    let logp_new = evaluator.total_logp;
    let grad_new = evaluator.grad.clone();
    for i in 0..dim {
        p_new[i] += 0.5 * eps * grad_new[i];
    }

    PhasePoint {
        q: q_new,
        p: p_new,
        grad: grad_new,
        logp: logp_new,
    }
}

/// Generalized U-turn check: the trajectory is turning when the momentum
/// at either end points back across the endpoints:
///
///   (q_right - q_left) · (M⁻¹ p_left) < 0  OR
///   (q_right - q_left) · (M⁻¹ p_right) < 0
fn is_turning(left: &PhasePoint, right: &PhasePoint, mass: &MassMatrix) -> bool {
    let mut dot_left = 0.0f64;
    let mut dot_right = 0.0f64;
    for i in 0..left.q.len() {
        let dq = right.q[i] - left.q[i];
        dot_left += dq * (mass.inv_diag[i] * left.p[i]);
        dot_right += dq * (mass.inv_diag[i] * right.p[i]);
    }
    dot_left < 0.0 || dot_right < 0.0
}

fn log_sum_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY && b == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    let max = a.max(b);
    max + ((a - max).exp() + (b - max).exp()).ln()
}

/// Double or halve a trial step until the one-step acceptance crosses
/// 0.5, starting from eps = 1 (Hoffman & Gelman Algorithm 4).
fn initial_step_size(
    graph: &Graph,
    evaluator: &mut Evaluator,
    q: &[f64],
    mass: &MassMatrix,
    rng: &mut ChaCha8Rng,
) -> f64 {
    evaluator.compute(graph, q);
    let start = PhasePoint {
        q: q.to_vec(),
        p: {
            let mut p = vec![0.0; q.len()];
            mass.sample_momentum(&mut p, rng);
            p
        },
        grad: evaluator.grad.clone(),
        logp: evaluator.total_logp,
    };
    let h0 = start.energy(mass);

    let mut eps = 1.0;
    let threshold = (-0.5f64).ln();

    let first = leapfrog(graph, evaluator, &start, eps, mass);
    let direction = if h0 - first.energy(mass) > threshold {
        1.0
    } else {
        -1.0
    };

    for _ in 0..50 {
        let trial = leapfrog(graph, evaluator, &start, eps, mass);
        let log_ratio = h0 - trial.energy(mass);
        if !log_ratio.is_finite() {
            eps *= 0.5;
            break;
        }
        if direction > 0.0 && log_ratio < threshold {
            break;
        }
        if direction < 0.0 && log_ratio > threshold {
            break;
        }
        eps *= 2.0f64.powf(direction);
    }

    eps.clamp(1e-10, 1e3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use rand::SeedableRng;

    /// A 2D standard normal target.
    fn gaussian_graph() -> Graph {
        let mut g = Graph::new();
        let w = g.add_param("w", 2, 1);
        g.std_normal_logp(w);
        g
    }

    #[test]
    fn draw_count_matches_config() {
        let g = gaussian_graph();
        let config = NutsConfig {
            num_draws: 150,
            num_warmup: 100,
            ..Default::default()
        };
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let result = run_chain(&g, &config, &mut rng, Some(vec![0.5, -0.5]), None);
        assert_eq!(result.samples.len(), 150);
        assert!(result.step_size > 0.0);
    }

    #[test]
    fn recovers_standard_normal_moments() {
        let g = gaussian_graph();
        let config = NutsConfig {
            num_draws: 2000,
            num_warmup: 500,
            ..Default::default()
        };
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let result = run_chain(&g, &config, &mut rng, Some(vec![1.0, 1.0]), None);

        for dim in 0..2 {
            let mean: f64 =
                result.samples.iter().map(|s| s[dim]).sum::<f64>() / result.samples.len() as f64;
            let var: f64 = result
                .samples
                .iter()
                .map(|s| (s[dim] - mean) * (s[dim] - mean))
                .sum::<f64>()
                / result.samples.len() as f64;
            assert!(mean.abs() < 0.15, "mean[{}] = {}", dim, mean);
            assert!((var - 1.0).abs() < 0.3, "var[{}] = {}", dim, var);
        }
    }

    #[test]
    fn log_sum_exp_handles_neg_infinity() {
        assert_eq!(
            log_sum_exp(f64::NEG_INFINITY, f64::NEG_INFINITY),
            f64::NEG_INFINITY
        );
        assert!((log_sum_exp(0.0, 0.0) - 2.0f64.ln()).abs() < 1e-12);
    }
}
