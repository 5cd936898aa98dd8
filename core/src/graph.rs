use std::collections::HashMap;

use ndarray::Array2;

use crate::error::{Error, Result};

/// Unique identifier for a node in the computation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

/// How a parameter block maps between the unconstrained vector the
/// sampler walks on and the constrained value the model sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamTransform {
    /// Unconstrained, used as-is.
    Identity,
    /// Positive parameter sampled on the log scale: x = exp(raw).
    Exp,
}

/// A named block of parameters occupying a contiguous slice of the flat
/// parameter vector, laid out row-major.
#[derive(Debug, Clone)]
pub struct ParamBlock {
    pub name: String,
    pub rows: usize,
    pub cols: usize,
    pub offset: usize,
    pub transform: ParamTransform,
}

impl ParamBlock {
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_scalar(&self) -> bool {
        self.len() == 1
    }

    /// One display name per entry: a scalar block stays "prec", larger
    /// blocks become "w1[i,j]".
    pub fn entry_names(&self) -> Vec<String> {
        if self.is_scalar() {
            return vec![self.name.clone()];
        }
        let mut names = Vec::with_capacity(self.len());
        for i in 0..self.rows {
            for j in 0..self.cols {
                names.push(format!("{}[{},{}]", self.name, i, j));
            }
        }
        names
    }
}

/// Operations supported in the computation graph.
///
/// Values are either scalars or dense matrices; a scalar parameter block
/// evaluates to a scalar node. Log-density ops produce scalars and are
/// registered as terms of the joint log-probability.
#[derive(Debug, Clone)]
pub enum Op {
    /// A free parameter block (index into `blocks`).
    Param(usize),
    /// Constant data matrix (index into the data table).
    Data(usize),
    /// Constant scalar baked into the graph.
    Constant(f64),
    /// Dense matrix product.
    MatMul(NodeId, NodeId),
    /// Element-wise hyperbolic tangent.
    Tanh(NodeId),
    /// Scalar exponential.
    Exp(NodeId),
    /// Scalar x^(-1/2), used to derive a noise scale from a precision.
    InvSqrt(NodeId),
    /// Sum of independent standard-Normal log-densities over all entries.
    StdNormalLogP(NodeId),
    /// Gamma(alpha, beta) log-density of a positive scalar (rate form).
    GammaLogP { x: NodeId, alpha: f64, beta: f64 },
    /// Sum of Normal(mu[i,j], sigma) log-densities of an observed matrix.
    NormalObsLogP {
        mu: NodeId,
        sigma: NodeId,
        obs_idx: usize,
    },
}

/// A single node in the computation graph.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub op: Op,
    pub name: Option<String>,
}

/// The computational graph representing a probabilistic model.
///
/// Nodes are stored in topological order (each node only references
/// earlier nodes). Data and observed matrices live in side tables so the
/// graph stays lightweight and shareable across sampler threads. Shapes
/// are tracked at build time; every shape violation is reported when the
/// graph is assembled, never during sampling.
#[derive(Debug, Clone)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub blocks: Vec<ParamBlock>,
    pub param_count: usize,
    pub data: Vec<Array2<f64>>,
    pub obs: Vec<Array2<f64>>,
    pub logp_terms: Vec<NodeId>,
    shapes: Vec<(usize, usize)>,
    name_to_node: HashMap<String, NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            blocks: Vec::new(),
            param_count: 0,
            data: Vec::new(),
            obs: Vec::new(),
            logp_terms: Vec::new(),
            shapes: Vec::new(),
            name_to_node: HashMap::new(),
        }
    }

    fn push_node(&mut self, op: Op, shape: (usize, usize), name: Option<String>) -> NodeId {
        let id = NodeId(self.nodes.len());
        if let Some(ref n) = name {
            self.name_to_node.insert(n.clone(), id);
        }
        self.nodes.push(Node { id, op, name });
        self.shapes.push(shape);
        id
    }

    /// Build-time shape of a node; scalars report (1, 1).
    pub fn shape(&self, id: NodeId) -> (usize, usize) {
        self.shapes[id.0]
    }

    pub fn add_param(&mut self, name: &str, rows: usize, cols: usize) -> NodeId {
        self.add_param_with_transform(name, rows, cols, ParamTransform::Identity)
    }

    pub fn add_param_with_transform(
        &mut self,
        name: &str,
        rows: usize,
        cols: usize,
        transform: ParamTransform,
    ) -> NodeId {
        let block_idx = self.blocks.len();
        self.blocks.push(ParamBlock {
            name: name.to_string(),
            rows,
            cols,
            offset: self.param_count,
            transform,
        });
        self.param_count += rows * cols;
        self.push_node(Op::Param(block_idx), (rows, cols), Some(name.to_string()))
    }

    pub fn add_data(&mut self, name: &str, values: Array2<f64>) -> NodeId {
        let shape = (values.nrows(), values.ncols());
        let idx = self.data.len();
        self.data.push(values);
        self.push_node(Op::Data(idx), shape, Some(name.to_string()))
    }

    pub fn add_obs(&mut self, values: Array2<f64>) -> usize {
        let idx = self.obs.len();
        self.obs.push(values);
        idx
    }

    pub fn add_constant(&mut self, value: f64) -> NodeId {
        self.push_node(Op::Constant(value), (1, 1), None)
    }

    pub fn matmul(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        let (ar, ac) = self.shape(a);
        let (br, bc) = self.shape(b);
        if ac != br {
            return Err(Error::shape(
                "matmul",
                format!("inner dimensions to agree ({}x{} · {}x{})", ar, ac, br, bc),
                format!("{} vs {}", ac, br),
            ));
        }
        Ok(self.push_node(Op::MatMul(a, b), (ar, bc), None))
    }

    pub fn tanh(&mut self, a: NodeId) -> NodeId {
        let shape = self.shape(a);
        self.push_node(Op::Tanh(a), shape, None)
    }

    pub fn exp(&mut self, a: NodeId) -> Result<NodeId> {
        self.require_scalar("exp", a)?;
        Ok(self.push_node(Op::Exp(a), (1, 1), None))
    }

    pub fn inv_sqrt(&mut self, a: NodeId) -> Result<NodeId> {
        self.require_scalar("inv_sqrt", a)?;
        Ok(self.push_node(Op::InvSqrt(a), (1, 1), None))
    }

    /// Standard-Normal prior over every entry of a parameter matrix.
    pub fn std_normal_logp(&mut self, x: NodeId) -> NodeId {
        let node = self.push_node(Op::StdNormalLogP(x), (1, 1), None);
        self.logp_terms.push(node);
        node
    }

    pub fn gamma_logp(&mut self, x: NodeId, alpha: f64, beta: f64) -> Result<NodeId> {
        self.require_scalar("gamma_logp", x)?;
        let node = self.push_node(Op::GammaLogP { x, alpha, beta }, (1, 1), None);
        self.logp_terms.push(node);
        Ok(node)
    }

    /// Normal likelihood of an observed matrix given a mean matrix and a
    /// scalar noise scale. The observation shape must match the mean.
    pub fn normal_obs_logp(&mut self, mu: NodeId, sigma: NodeId, obs_idx: usize) -> Result<NodeId> {
        self.require_scalar("normal_obs_logp sigma", sigma)?;
        let mu_shape = self.shape(mu);
        let obs = &self.obs[obs_idx];
        let obs_shape = (obs.nrows(), obs.ncols());
        if mu_shape != obs_shape {
            return Err(Error::shape(
                "normal_obs_logp",
                format!("observations of shape {}x{}", mu_shape.0, mu_shape.1),
                format!("{}x{}", obs_shape.0, obs_shape.1),
            ));
        }
        let node = self.push_node(Op::NormalObsLogP { mu, sigma, obs_idx }, (1, 1), None);
        self.logp_terms.push(node);
        Ok(node)
    }

    /// Register an existing scalar node as a term of the joint
    /// log-probability (used for change-of-variable Jacobians).
    pub fn add_logp_term(&mut self, id: NodeId) -> Result<()> {
        self.require_scalar("logp term", id)?;
        self.logp_terms.push(id);
        Ok(())
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.name_to_node.get(name).copied()
    }

    /// Display names for every entry of the flat parameter vector, in
    /// offset order.
    pub fn entry_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.param_count);
        for block in &self.blocks {
            names.extend(block.entry_names());
        }
        names
    }

    fn require_scalar(&self, context: &str, id: NodeId) -> Result<()> {
        let shape = self.shape(id);
        if shape != (1, 1) {
            return Err(Error::shape(
                context,
                "scalar",
                format!("{}x{}", shape.0, shape.1),
            ));
        }
        Ok(())
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}
