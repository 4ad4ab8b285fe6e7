//! # hssm-lan
//!
//! Likelihood Approximation Networks (LANs) for sequential sampling models.
//!
//! A LAN is a small feed-forward network trained to approximate the
//! trial-wise log-likelihood of a model such as the drift diffusion model.
//! This crate loads a pretrained LAN from its ONNX export (binary or JSON),
//! turns it into a batched log-likelihood and gradient on Burn, and wraps the
//! pair as differentiable ops of a symbolic graph.
//!
//! ## Features
//!
//! - **Burn Backend**: Runs on any Burn backend; `LanBackend` is the 64-bit CPU default.
//! - **Compiled and interpreted paths**: graphs are lowered once into a step plan,
//!   and the node-by-node interpreter stays available for lowered symbolic graphs.
//! - **Symbolic ops**: `LanLogpOp`/`LanLogpGradOp` plug into reverse-mode `grad`.
//! - **Symbolic-native networks**: `make_symbolic_logp` expands every network
//!   node into the symbolic graph itself.
//!
//! ## Example
//!
//! ```
//! use hssm_lan::prelude::*;
//!
//! // v, a, z, t -> 6 input columns with rt and choice
//! let graph = GraphConfig::with_feature_size(6)
//!     .dense(vec![vec![0.1, -0.2, 0.3, 0.0, -1.0, 0.5]], vec![0.0], Activation::None)
//!     .build()
//!     .expect("Failed to build graph");
//!
//! let funcs = make_logp_funcs(graph, 4, true).expect("Failed to build likelihood");
//! let params: Vec<ParamValue> = vec![1.0.into(), 1.5.into(), 0.5.into(), 0.2.into()];
//! let logp = funcs.forward().logp(&[0.8, -1.2, 0.6], &params).unwrap();
//! assert!(logp.is_finite());
//! ```

pub mod errors;
pub mod graph;
pub mod lan_graph;
pub mod lan_op;
pub mod layers;
pub mod likelihood;
pub mod symbolic;

// Re-exports for convenience
pub use errors::LanError;
pub use graph::{InterchangeGraph, ModelSource};
pub use lan_graph::{SymbolicLogp, make_symbolic_logp};
pub use lan_op::{LanLogpGradOp, LanLogpOp, make_logp_ops};
pub use likelihood::{LanConfig, LanFunctions, ParamValue, build_likelihood, make_logp_funcs};

/// Default backend: CPU ndarray in 64-bit precision with autodiff support.
pub type LanBackend = burn::backend::Autodiff<burn::backend::NdArray<f64>>;

/// Backend type for GPU evaluation with autodiff support.
#[cfg(feature = "wgpu")]
pub type GpuBackend = burn::backend::Autodiff<burn::backend::Wgpu>;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::LanBackend;
    pub use crate::errors::LanError;
    pub use crate::graph::{GraphConfig, InterchangeGraph, ModelSource};
    pub use crate::lan_graph::{SymbolicLogp, make_symbolic_logp};
    pub use crate::lan_op::{LanLogpOp, make_logp_ops};
    pub use crate::layers::Activation;
    pub use crate::likelihood::{
        FunctionCache, LanConfig, LanFunctions, LogLikelihood, LogLikelihoodGrad, ParamValue,
        build_likelihood, make_logp_funcs,
    };
    pub use crate::symbolic::{DType, DispatchRegistry, Function, Value, Variable, grad, lower};
}
