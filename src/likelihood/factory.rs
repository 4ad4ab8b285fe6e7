//! Builds `logp`, its gradient and an uncompiled `logp` from a network graph.

use std::sync::Arc;

use burn::tensor::{
    ElementConversion, Tensor,
    backend::{AutodiffBackend, Backend},
};

use super::config::LanConfig;
use super::input::{assemble, check_params, param_leaf};
use super::{LanFunctions, LogLikelihood, LogLikelihoodGrad, ParamValue};
use crate::errors::LanError;
use crate::graph::{CompiledGraph, InterchangeGraph, ModelSource, interpret};

/// How the network is executed.
#[derive(Debug)]
enum Network<B: Backend> {
    Compiled(CompiledGraph<B>),
    Interpreted(Arc<InterchangeGraph>),
}

impl<B: Backend> Network<B> {
    fn forward(&self, input: Tensor<B, 2>) -> Result<Tensor<B, 2>, LanError> {
        match self {
            Network::Compiled(compiled) => compiled.forward(input),
            Network::Interpreted(graph) => interpret(graph, input),
        }
    }

    /// Sum of the network output over rows.
    fn total(
        &self,
        leaves: &[Tensor<B, 2>],
        data: &[f64],
        device: &B::Device,
    ) -> Result<Tensor<B, 1>, LanError> {
        let output = self.forward(assemble(leaves, data, device))?;
        let [_, cols] = output.dims();
        if cols != 1 {
            return Err(LanError::ShapeMismatch {
                expected: 1,
                actual: cols,
            });
        }
        Ok(output.sum())
    }
}

/// Log-likelihood evaluated by running the network on `B`.
#[derive(Debug)]
pub struct GraphLogp<B: Backend> {
    network: Network<B>,
    n_params: usize,
    device: B::Device,
}

impl<B: Backend> LogLikelihood for GraphLogp<B> {
    fn logp(&self, data: &[f64], params: &[ParamValue]) -> Result<f64, LanError> {
        check_params(data, params, self.n_params)?;
        if data.is_empty() {
            return Ok(0.0);
        }
        let leaves: Vec<Tensor<B, 2>> = params.iter().map(|p| param_leaf(p, &self.device)).collect();
        let total = self.network.total(&leaves, data, &self.device)?;
        Ok(total.into_scalar().elem::<f64>())
    }

    fn n_params(&self) -> usize {
        self.n_params
    }
}

/// Gradient of the log-likelihood with respect to each parameter.
#[derive(Debug)]
pub struct GraphLogpGrad<B: AutodiffBackend> {
    network: Network<B>,
    n_params: usize,
    device: B::Device,
}

impl<B: AutodiffBackend> LogLikelihoodGrad for GraphLogpGrad<B> {
    fn grad_logp(&self, data: &[f64], params: &[ParamValue]) -> Result<Vec<ParamValue>, LanError> {
        check_params(data, params, self.n_params)?;
        if data.is_empty() {
            return Ok(params.iter().map(ParamValue::zeros_like).collect());
        }

        // Only the parameters are leaves; network weights stay constant.
        let leaves: Vec<Tensor<B, 2>> = params
            .iter()
            .map(|p| param_leaf::<B>(p, &self.device).require_grad())
            .collect();
        let total = self.network.total(&leaves, data, &self.device)?;
        let grads = total.backward();

        params
            .iter()
            .zip(&leaves)
            .map(|(param, leaf)| {
                let values = match leaf.grad(&grads) {
                    Some(g) => g
                        .to_data()
                        .convert::<f64>()
                        .to_vec::<f64>()
                        .map_err(|e| LanError::evaluation(format!("{e:?}")))?,
                    None => vec![0.0; leaf.dims()[0]],
                };
                Ok(match param {
                    ParamValue::Scalar(_) => ParamValue::Scalar(values.first().copied().unwrap_or(0.0)),
                    ParamValue::Batched(_) => ParamValue::Batched(values),
                })
            })
            .collect()
    }

    fn n_params(&self) -> usize {
        self.n_params
    }
}

/// Builds the likelihood function triple for a pretrained network.
///
/// `forward` runs on `B::InnerBackend` so it records no autodiff tape;
/// `grad` runs on `B`. With `config.compile` both use a [`CompiledGraph`]
/// lowered here, and `forward_nojit` always interprets the graph.
pub fn build_likelihood<B: AutodiffBackend>(
    source: impl Into<ModelSource>,
    n_params: usize,
    config: &LanConfig,
    device: &B::Device,
) -> Result<LanFunctions, LanError> {
    let graph = source.into().load()?;

    if let Some(width) = graph.input_width() {
        if width != n_params + 2 {
            return Err(LanError::ShapeMismatch {
                expected: n_params + 2,
                actual: width,
            });
        }
    }

    let forward_nojit: Arc<dyn LogLikelihood> = Arc::new(GraphLogp::<B::InnerBackend> {
        network: Network::Interpreted(Arc::clone(&graph)),
        n_params,
        device: device.clone(),
    });

    let (forward, grad): (Arc<dyn LogLikelihood>, Arc<dyn LogLikelihoodGrad>) = if config.compile {
        let forward: Arc<dyn LogLikelihood> = Arc::new(GraphLogp::<B::InnerBackend> {
            network: Network::Compiled(CompiledGraph::new(&graph, device)?),
            n_params,
            device: device.clone(),
        });
        let grad: Arc<dyn LogLikelihoodGrad> = Arc::new(GraphLogpGrad::<B> {
            network: Network::Compiled(CompiledGraph::new(&graph, device)?),
            n_params,
            device: device.clone(),
        });
        (forward, grad)
    } else {
        let grad: Arc<dyn LogLikelihoodGrad> = Arc::new(GraphLogpGrad::<B> {
            network: Network::Interpreted(Arc::clone(&graph)),
            n_params,
            device: device.clone(),
        });
        (Arc::clone(&forward_nojit), grad)
    };

    if config.warm_up {
        let params = vec![ParamValue::Scalar(0.0); n_params];
        forward.logp(&[1.0], &params)?;
        grad.grad_logp(&[1.0], &params)?;
        log::debug!("Warm-up evaluation of `{}` succeeded", graph.name());
    }

    log::info!(
        "Built LAN likelihood for `{}` with {} parameters (compiled: {})",
        graph.name(),
        n_params,
        config.compile
    );

    Ok(LanFunctions::new(
        forward,
        grad,
        forward_nojit,
        n_params,
        config.output_dtype,
    ))
}

/// Builds likelihood functions on the default [`LanBackend`](crate::LanBackend).
pub fn make_logp_funcs(
    source: impl Into<ModelSource>,
    n_params: usize,
    compile: bool,
) -> Result<LanFunctions, LanError> {
    let device = <crate::LanBackend as Backend>::Device::default();
    build_likelihood::<crate::LanBackend>(source, n_params, &LanConfig::new().compile(compile), &device)
}
