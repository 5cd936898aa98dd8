//! Two-hidden-layer Bayesian neural network for scalar regression.
//!
//! Latent variables: weight matrices w1 (D_X,D_H), w2 (D_H,D_H),
//! w3 (D_H,D_Y) with independent Normal(0,1) priors, and a scalar
//! observation precision with a Gamma(3,1) prior sampled on the log
//! scale. The derived noise scale is prec^(-1/2). The likelihood is
//! Normal per observation around the network output, which uses tanh
//! hidden activations and a linear final layer.

use ndarray::Array2;

use crate::error::{Error, Result};
use crate::graph::{Graph, ParamTransform};

pub const PREC_ALPHA: f64 = 3.0;
pub const PREC_BETA: f64 = 1.0;

/// Static description of the network: widths only, no data.
#[derive(Debug, Clone, Copy)]
pub struct BnnModel {
    pub d_x: usize,
    pub d_h: usize,
    pub d_y: usize,
}

/// One concrete parameter set, decoded from a flat posterior draw.
#[derive(Debug, Clone)]
pub struct BnnWeights {
    pub w1: Array2<f64>,
    pub w2: Array2<f64>,
    pub w3: Array2<f64>,
    /// Observation precision on the constrained (positive) scale.
    pub prec_obs: f64,
}

impl BnnWeights {
    pub fn sigma_obs(&self) -> f64 {
        self.prec_obs.powf(-0.5)
    }
}

impl BnnModel {
    pub fn new(d_x: usize, d_h: usize, d_y: usize) -> Result<Self> {
        if d_x == 0 || d_h == 0 || d_y == 0 {
            return Err(Error::InvalidConfig(format!(
                "network widths must be positive (d_x={}, d_h={}, d_y={})",
                d_x, d_h, d_y
            )));
        }
        Ok(Self { d_x, d_h, d_y })
    }

    /// Total length of the flat parameter vector:
    /// w1 + w2 + w3 weights plus the raw log-precision.
    pub fn param_count(&self) -> usize {
        self.d_x * self.d_h + self.d_h * self.d_h + self.d_h * self.d_y + 1
    }

    /// Compile the generative model into a computation graph.
    ///
    /// With `y` present the graph carries the full joint density
    /// (priors + likelihood) and is what the sampler differentiates.
    /// With `y` absent only the prior terms exist; predictive sampling
    /// instead replays `forward` and injects observation noise itself.
    /// A `y` whose shape differs from the network output is a fatal
    /// precondition violation.
    pub fn graph(&self, x: &Array2<f64>, y: Option<&Array2<f64>>) -> Result<Graph> {
        if x.ncols() != self.d_x {
            return Err(Error::shape(
                "model inputs",
                format!("{} feature columns", self.d_x),
                format!("{}", x.ncols()),
            ));
        }

        let mut g = Graph::new();
        let x_node = g.add_data("x", x.clone());

        let w1 = g.add_param("w1", self.d_x, self.d_h);
        g.std_normal_logp(w1);
        let w2 = g.add_param("w2", self.d_h, self.d_h);
        g.std_normal_logp(w2);
        let w3 = g.add_param("w3", self.d_h, self.d_y);
        g.std_normal_logp(w3);

        // prec_obs ~ Gamma(3, 1), sampled as raw = log(prec); the raw
        // node itself is the log-Jacobian of the exp transform.
        let raw = g.add_param_with_transform("prec_obs", 1, 1, ParamTransform::Exp);
        let prec = g.exp(raw)?;
        g.gamma_logp(prec, PREC_ALPHA, PREC_BETA)?;
        g.add_logp_term(raw)?;
        let sigma = g.inv_sqrt(prec)?;

        let a1 = g.matmul(x_node, w1)?;
        let z1 = g.tanh(a1);
        let a2 = g.matmul(z1, w2)?;
        let z2 = g.tanh(a2);
        let mu = g.matmul(z2, w3)?;

        if let Some(y) = y {
            let (yr, yc) = (y.nrows(), y.ncols());
            if (yr, yc) != (x.nrows(), self.d_y) {
                return Err(Error::shape(
                    "observed outputs",
                    format!("{}x{}", x.nrows(), self.d_y),
                    format!("{}x{}", yr, yc),
                ));
            }
            let obs_idx = g.add_obs(y.clone());
            g.normal_obs_logp(mu, sigma, obs_idx)?;
        }

        Ok(g)
    }

    /// Deterministic forward pass: tanh(tanh(X·w1)·w2)·w3.
    pub fn forward(&self, x: &Array2<f64>, w: &BnnWeights) -> Result<Array2<f64>> {
        if x.ncols() != self.d_x {
            return Err(Error::shape(
                "forward inputs",
                format!("{} feature columns", self.d_x),
                format!("{}", x.ncols()),
            ));
        }
        let z1 = x.dot(&w.w1).mapv(f64::tanh);
        let z2 = z1.dot(&w.w2).mapv(f64::tanh);
        Ok(z2.dot(&w.w3))
    }

    /// Decode a flat posterior draw (constrained scale) into weights.
    pub fn decode(&self, draw: &[f64]) -> Result<BnnWeights> {
        if draw.len() != self.param_count() {
            return Err(Error::shape(
                "posterior draw",
                format!("{} entries", self.param_count()),
                format!("{}", draw.len()),
            ));
        }
        let mut offset = 0;
        let mut take = |rows: usize, cols: usize| {
            let m = Array2::from_shape_fn((rows, cols), |(i, j)| draw[offset + i * cols + j]);
            offset += rows * cols;
            m
        };
        let w1 = take(self.d_x, self.d_h);
        let w2 = take(self.d_h, self.d_h);
        let w3 = take(self.d_h, self.d_y);
        let prec_obs = draw[offset];
        Ok(BnnWeights {
            w1,
            w2,
            w3,
            prec_obs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::eval_logp;
    use ndarray::Array2;

    fn ramp(rows: usize, cols: usize, scale: f64) -> Array2<f64> {
        Array2::from_shape_fn((rows, cols), |(i, j)| {
            scale * (((i * cols + j) as f64) * 0.31).sin()
        })
    }

    #[test]
    fn forward_output_shape() {
        let model = BnnModel::new(3, 5, 1).unwrap();
        let x = ramp(20, 3, 1.0);
        let w = BnnWeights {
            w1: ramp(3, 5, 0.5),
            w2: ramp(5, 5, 0.5),
            w3: ramp(5, 1, 0.5),
            prec_obs: 4.0,
        };
        let out = model.forward(&x, &w).unwrap();
        assert_eq!(out.dim(), (20, 1));
    }

    #[test]
    fn wrong_y_shape_is_fatal() {
        let model = BnnModel::new(3, 5, 1).unwrap();
        let x = ramp(20, 3, 1.0);
        let y_bad = ramp(19, 1, 1.0);
        assert!(matches!(
            model.graph(&x, Some(&y_bad)),
            Err(Error::ShapeMismatch { .. })
        ));
        let y_wide = ramp(20, 2, 1.0);
        assert!(matches!(
            model.graph(&x, Some(&y_wide)),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn zero_widths_rejected() {
        assert!(BnnModel::new(0, 5, 1).is_err());
        assert!(BnnModel::new(3, 0, 1).is_err());
    }

    #[test]
    fn graph_param_count_matches_model() {
        let model = BnnModel::new(3, 5, 1).unwrap();
        let x = ramp(20, 3, 1.0);
        let y = ramp(20, 1, 1.0);
        let g = model.graph(&x, Some(&y)).unwrap();
        assert_eq!(g.param_count, model.param_count());
        assert_eq!(g.param_count, 3 * 5 + 5 * 5 + 5 + 1);
    }

    #[test]
    fn prior_only_graph_has_finite_logp() {
        let model = BnnModel::new(2, 3, 1).unwrap();
        let x = ramp(10, 2, 1.0);
        let g = model.graph(&x, None).unwrap();
        let theta = vec![0.2; g.param_count];
        assert!(eval_logp(&g, &theta).is_finite());
    }

    #[test]
    fn decode_round_trips_layout() {
        let model = BnnModel::new(2, 3, 1).unwrap();
        let draw: Vec<f64> = (0..model.param_count()).map(|i| i as f64).collect();
        let w = model.decode(&draw).unwrap();
        assert_eq!(w.w1[(0, 0)], 0.0);
        assert_eq!(w.w1[(1, 2)], 5.0);
        assert_eq!(w.w2[(0, 0)], 6.0);
        assert_eq!(w.w3[(2, 0)], 17.0);
        assert_eq!(w.prec_obs, 18.0);
    }
}
