//! LAN likelihood functions as differentiable symbolic ops.
//!
//! [`LanLogpOp`] computes the summed log-likelihood of a data vector given the
//! distribution parameters; its gradient is expressed through
//! [`LanLogpGradOp`]. [`make_logp_ops`] builds the pair and registers their
//! kernels so lowered graphs run the uncompiled forward function.

use std::sync::Arc;

use crate::errors::LanError;
use crate::likelihood::{LanFunctions, ParamValue};
use crate::symbolic::{
    Apply, DType, DispatchRegistry, Input, InputGrad, Kernel, Op, OpId, TensorType, Value,
    Variable, apply, mul, next_op_id,
};

/// Checks `[data, params...]` and returns the parameter types.
fn validate_inputs(op: &str, inputs: &[Variable], n_params: usize) -> Result<Vec<TensorType>, LanError> {
    let Some((data, params)) = inputs.split_first() else {
        return Err(LanError::node_construction(op, "missing data input"));
    };
    if data.ty().ndim != 1 {
        return Err(LanError::node_construction(
            op,
            format!("data must be a vector, got rank {}", data.ty().ndim),
        ));
    }
    if params.len() != n_params {
        return Err(LanError::ParameterArity {
            expected: n_params,
            actual: params.len(),
        });
    }
    params
        .iter()
        .enumerate()
        .map(|(i, p)| {
            if p.ty().ndim > 1 {
                Err(LanError::node_construction(
                    op,
                    format!("parameter {i} must be a scalar or vector, got rank {}", p.ty().ndim),
                ))
            } else {
                Ok(p.ty())
            }
        })
        .collect()
}

/// Splits runtime inputs into data and parameter values.
fn split_values<'a>(op: &str, inputs: &'a [Value]) -> Result<(&'a [f64], Vec<ParamValue>), LanError> {
    let Some((data, params)) = inputs.split_first() else {
        return Err(LanError::node_construction(op, "missing data input"));
    };
    let params = params
        .iter()
        .map(|p| match p.as_scalar() {
            Some(v) => ParamValue::Scalar(v),
            None => ParamValue::Batched(p.data().to_vec()),
        })
        .collect();
    Ok((data.data(), params))
}

fn param_value_to_value(grad: ParamValue, dtype: DType) -> Result<Value, LanError> {
    let value = match grad {
        ParamValue::Scalar(v) => Value::scalar(v),
        ParamValue::Batched(values) => Value::vector(values),
    };
    value.cast(dtype)
}

fn nojit_kernel(functions: &Arc<LanFunctions>) -> Kernel {
    let functions = Arc::clone(functions);
    Arc::new(move |inputs: &[Value]| {
        let (data, params) = split_values("lan_logp", inputs)?;
        let logp = functions.forward_nojit().logp(data, &params)?;
        Ok(vec![Value::scalar(logp).cast(functions.output_dtype())?])
    })
}

fn grad_kernel(functions: &Arc<LanFunctions>) -> Kernel {
    let functions = Arc::clone(functions);
    Arc::new(move |inputs: &[Value]| {
        let (data, params) = split_values("lan_logp_grad", inputs)?;
        let grads = functions.grad().grad_logp(data, &params)?;
        grads
            .into_iter()
            .zip(&inputs[1..])
            .map(|(g, input)| param_value_to_value(g, input.dtype()))
            .collect()
    })
}

/// Forward op: `(data, params...) -> logp` (a scalar).
#[derive(Debug)]
pub struct LanLogpOp {
    id: OpId,
    functions: Arc<LanFunctions>,
    grad_op: Arc<LanLogpGradOp>,
}

impl LanLogpOp {
    /// Applies the op, returning the log-likelihood variable.
    pub fn call(self: &Arc<Self>, data: impl Into<Input>, params: Vec<Input>) -> Result<Variable, LanError> {
        let mut inputs = Vec::with_capacity(params.len() + 1);
        inputs.push(data.into());
        inputs.extend(params);
        let op: Arc<dyn Op> = Arc::clone(self) as Arc<dyn Op>;
        apply(op, inputs)?.output(0)
    }

    pub fn grad_op(&self) -> &Arc<LanLogpGradOp> {
        &self.grad_op
    }

    pub fn functions(&self) -> &Arc<LanFunctions> {
        &self.functions
    }
}

impl Op for LanLogpOp {
    fn id(&self) -> OpId {
        self.id
    }

    fn name(&self) -> &str {
        "lan_logp"
    }

    fn make_node(&self, inputs: &[Variable]) -> Result<Vec<TensorType>, LanError> {
        validate_inputs(self.name(), inputs, self.functions.n_params())?;
        Ok(vec![TensorType::scalar(self.functions.output_dtype())])
    }

    fn perform(&self, _: &Apply, inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<(), LanError> {
        let (data, params) = split_values(self.name(), inputs)?;
        let logp = self.functions.forward().logp(data, &params)?;
        outputs[0] = Some(Value::scalar(logp).cast(self.functions.output_dtype())?);
        Ok(())
    }

    fn grad(&self, inputs: &[Variable], output_grads: &[Variable]) -> Result<Vec<InputGrad>, LanError> {
        let op: Arc<dyn Op> = Arc::clone(&self.grad_op) as Arc<dyn Op>;
        let node = apply(op, inputs.iter().map(Input::from).collect())?;

        let mut grads = Vec::with_capacity(inputs.len());
        grads.push(InputGrad::NotImplemented);
        for result in node.outputs() {
            grads.push(InputGrad::Grad(mul(&output_grads[0], &result)?));
        }
        Ok(grads)
    }
}

/// Gradient op: `(data, params...) -> (d logp / d param)...`, one output per
/// parameter with that parameter's type.
#[derive(Debug)]
pub struct LanLogpGradOp {
    id: OpId,
    functions: Arc<LanFunctions>,
}

impl Op for LanLogpGradOp {
    fn id(&self) -> OpId {
        self.id
    }

    fn name(&self) -> &str {
        "lan_logp_grad"
    }

    fn make_node(&self, inputs: &[Variable]) -> Result<Vec<TensorType>, LanError> {
        validate_inputs(self.name(), inputs, self.functions.n_params())
    }

    fn perform(&self, node: &Apply, inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<(), LanError> {
        let (data, params) = split_values(self.name(), inputs)?;
        let grads = self.functions.grad().grad_logp(data, &params)?;
        for ((slot, grad), ty) in outputs.iter_mut().zip(grads).zip(node.output_types()) {
            *slot = Some(param_value_to_value(grad, ty.dtype)?);
        }
        Ok(())
    }
}

/// Builds the forward/gradient op pair over `functions` and registers their
/// lowered kernels: the forward op runs `forward_nojit`, the gradient op
/// runs `grad`.
pub fn make_logp_ops(functions: Arc<LanFunctions>, registry: &mut DispatchRegistry) -> Arc<LanLogpOp> {
    let grad_op = Arc::new(LanLogpGradOp {
        id: next_op_id(),
        functions: Arc::clone(&functions),
    });
    let logp_op = Arc::new(LanLogpOp {
        id: next_op_id(),
        functions: Arc::clone(&functions),
        grad_op: Arc::clone(&grad_op),
    });

    registry.register(logp_op.as_ref(), nojit_kernel(&functions));
    registry.register(grad_op.as_ref(), grad_kernel(&functions));
    logp_op
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphConfig;
    use crate::layers::Activation;
    use crate::likelihood::{LanConfig, build_likelihood};
    use crate::symbolic::{Function, grad};
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray<f64>>;

    fn linear_ops(dtype: DType) -> (Arc<LanLogpOp>, DispatchRegistry) {
        // logp row = v + 2a - rt + 0.5 choice
        let graph = GraphConfig::with_feature_size(4)
            .dense(vec![vec![1.0, 2.0, -1.0, 0.5]], vec![0.0], Activation::None)
            .build()
            .unwrap();
        let device = Default::default();
        let config = LanConfig::new().output_dtype(dtype);
        let functions = build_likelihood::<TestBackend>(graph, 2, &config, &device).unwrap();
        let mut registry = DispatchRegistry::new();
        let op = make_logp_ops(Arc::new(functions), &mut registry);
        (op, registry)
    }

    #[test]
    fn test_registers_both_ops() {
        let (op, registry) = linear_ops(DType::Float64);
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(op.id()));
        assert!(registry.contains(op.grad_op().id()));
    }

    #[test]
    fn test_make_node_validation() {
        let (op, _) = linear_ops(DType::Float64);
        let data = Variable::vector("data");

        let err = op.call(&data, vec![1.0.into()]).unwrap_err();
        assert!(matches!(err, LanError::ParameterArity { expected: 2, actual: 1 }));

        let err = op.call(1.0, vec![1.0.into(), 1.0.into()]).unwrap_err();
        assert!(matches!(err, LanError::NodeConstruction { ref op, .. } if op == "lan_logp"));
    }

    #[test]
    fn test_perform_and_dtype() {
        let (op, _) = linear_ops(DType::Float32);
        let data = Variable::vector("data");
        let v = Variable::scalar("v");
        let logp = op.call(&data, vec![(&v).into(), 0.5.into()]).unwrap();
        assert_eq!(logp.ty(), TensorType::scalar(DType::Float32));

        let f = Function::new(vec![data, v], vec![logp]).unwrap();
        let out = f
            .call(&[Value::vector(vec![0.5, -1.5, 2.0]), Value::scalar(1.0)])
            .unwrap();
        assert_eq!(out[0].dtype(), DType::Float32);
        assert_eq!(out[0].as_scalar(), Some(3.0));
    }

    #[test]
    fn test_grad_wrt_data_not_implemented() {
        let (op, _) = linear_ops(DType::Float64);
        let data = Variable::vector("data");
        let logp = op.call(&data, vec![1.0.into(), 0.5.into()]).unwrap();
        let err = grad(&logp, &[data]).unwrap_err();
        assert!(matches!(
            err,
            LanError::GradientNotImplemented { ref op, input: 0 } if op == "lan_logp"
        ));
    }

    #[test]
    fn test_grad_output_types_follow_params() {
        let (op, _) = linear_ops(DType::Float64);
        let data = Variable::vector("data");
        let v = Variable::scalar("v");
        let a = Variable::vector("a");
        let logp = op.call(&data, vec![(&v).into(), (&a).into()]).unwrap();
        let grads = grad(&logp, &[v.clone(), a.clone()]).unwrap();
        assert_eq!(grads[0].ty().ndim, 0);
        assert_eq!(grads[1].ty().ndim, 1);

        let f = Function::new(vec![data, v, a], grads).unwrap();
        let out = f
            .call(&[
                Value::vector(vec![0.5, -1.5]),
                Value::scalar(1.0),
                Value::vector(vec![0.2, 0.4]),
            ])
            .unwrap();
        assert_eq!(out[0].as_scalar(), Some(2.0));
        assert_eq!(out[1].data(), &[2.0, 2.0]);
    }
}
