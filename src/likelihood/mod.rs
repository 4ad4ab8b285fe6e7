//! LAN likelihood functions built from pretrained networks.
//!
//! A LAN maps one row `[params..., rt, choice]` to the log-density of that
//! trial. The functions here assemble the rows from signed response times,
//! run the network, and sum the per-trial outputs.

mod cache;
mod config;
mod factory;
mod input;

use std::fmt;
use std::sync::Arc;

pub use cache::FunctionCache;
pub use config::LanConfig;
pub use factory::{GraphLogp, GraphLogpGrad, build_likelihood, make_logp_funcs};
pub(crate) use input::rt_choice;

use crate::errors::LanError;
use crate::symbolic::DType;

/// One distribution parameter: shared by all trials, or one value per trial.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Scalar(f64),
    Batched(Vec<f64>),
}

impl ParamValue {
    /// Values as a slice (one element for a scalar).
    pub fn values(&self) -> &[f64] {
        match self {
            ParamValue::Scalar(v) => std::slice::from_ref(v),
            ParamValue::Batched(values) => values,
        }
    }

    pub fn is_batched(&self) -> bool {
        matches!(self, ParamValue::Batched(_))
    }

    /// Zero of the same shape.
    pub fn zeros_like(&self) -> ParamValue {
        match self {
            ParamValue::Scalar(_) => ParamValue::Scalar(0.0),
            ParamValue::Batched(values) => ParamValue::Batched(vec![0.0; values.len()]),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Scalar(value)
    }
}

impl From<Vec<f64>> for ParamValue {
    fn from(value: Vec<f64>) -> Self {
        ParamValue::Batched(value)
    }
}

/// Summed log-likelihood of signed response times.
pub trait LogLikelihood: Send + Sync {
    fn logp(&self, data: &[f64], params: &[ParamValue]) -> Result<f64, LanError>;

    fn n_params(&self) -> usize;
}

/// Gradient of [`LogLikelihood::logp`] with respect to each parameter, in
/// declaration order. Never taken with respect to the data.
pub trait LogLikelihoodGrad: Send + Sync {
    fn grad_logp(&self, data: &[f64], params: &[ParamValue]) -> Result<Vec<ParamValue>, LanError>;

    fn n_params(&self) -> usize;
}

/// The `forward`, `grad` and `forward_nojit` functions of one network.
#[derive(Clone)]
pub struct LanFunctions {
    forward: Arc<dyn LogLikelihood>,
    grad: Arc<dyn LogLikelihoodGrad>,
    forward_nojit: Arc<dyn LogLikelihood>,
    n_params: usize,
    output_dtype: DType,
}

impl LanFunctions {
    pub fn new(
        forward: Arc<dyn LogLikelihood>,
        grad: Arc<dyn LogLikelihoodGrad>,
        forward_nojit: Arc<dyn LogLikelihood>,
        n_params: usize,
        output_dtype: DType,
    ) -> Self {
        Self {
            forward,
            grad,
            forward_nojit,
            n_params,
            output_dtype,
        }
    }

    pub fn forward(&self) -> &Arc<dyn LogLikelihood> {
        &self.forward
    }

    pub fn grad(&self) -> &Arc<dyn LogLikelihoodGrad> {
        &self.grad
    }

    /// The interpreted `logp`, used when a symbolic graph is lowered.
    pub fn forward_nojit(&self) -> &Arc<dyn LogLikelihood> {
        &self.forward_nojit
    }

    pub fn n_params(&self) -> usize {
        self.n_params
    }

    pub fn output_dtype(&self) -> DType {
        self.output_dtype
    }
}

impl fmt::Debug for LanFunctions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LanFunctions")
            .field("n_params", &self.n_params)
            .field("output_dtype", &self.output_dtype)
            .finish_non_exhaustive()
    }
}
