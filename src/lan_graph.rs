//! The LAN log-likelihood written directly as a symbolic graph.
//!
//! Where [`LanLogpOp`](crate::lan_op::LanLogpOp) wraps the whole network as
//! one opaque op, [`make_symbolic_logp`] expands every network node into its
//! own symbolic node. The input matrix, each `Gemm`, `MatMul`, elementwise
//! op and activation, and the final sum all appear in the graph, so [`grad`]
//! differentiates through them node by node and [`lower`] runs them without
//! any registered kernels.
//!
//! [`grad`]: crate::symbolic::grad
//! [`lower`]: crate::symbolic::lower

use std::collections::HashMap;
use std::sync::Arc;

use burn::backend::{Autodiff, NdArray};
use burn::tensor::{Tensor, backend::Backend};

use crate::errors::LanError;
use crate::graph::{InterchangeGraph, ModelSource, OpKind, Operation};
use crate::likelihood::rt_choice;
use crate::symbolic::{
    Apply, DType, Input, InputGrad, Kernel, Op, OpId, TensorType, Value, Variable, apply,
    as_tensor_variable, fill_like, mul, next_op_id,
};

/// Backend the node kernels run on.
type Host = NdArray<f64>;

fn matrix_type() -> TensorType {
    TensorType::new(DType::Float64, 2)
}

fn to_matrix<B: Backend>(op: &str, value: &Value, device: &B::Device) -> Result<Tensor<B, 2>, LanError> {
    let [rows, cols] = match *value.shape() {
        [rows, cols] => [rows, cols],
        _ => {
            return Err(LanError::evaluation(format!(
                "`{op}` expects a matrix, got shape {:?}",
                value.shape()
            )));
        }
    };
    Ok(Tensor::<B, 1>::from_floats(value.data(), device).reshape([rows, cols]))
}

fn from_matrix<B: Backend>(tensor: Tensor<B, 2>) -> Result<Value, LanError> {
    let [rows, cols] = tensor.dims();
    let data = tensor
        .into_data()
        .convert::<f64>()
        .to_vec::<f64>()
        .map_err(|e| LanError::evaluation(format!("{e:?}")))?;
    Value::new(DType::Float64, vec![rows, cols], data)
}

fn single_output(outputs: &mut [Option<Value>], value: Value) -> Result<(), LanError> {
    match outputs.first_mut() {
        Some(slot) => {
            *slot = Some(value);
            Ok(())
        }
        None => Err(LanError::InvalidGraph("missing output slot".to_string())),
    }
}

fn fill_outputs(outputs: &mut [Option<Value>], values: Vec<Value>) {
    for (slot, value) in outputs.iter_mut().zip(values) {
        *slot = Some(value);
    }
}

/// Builds the `[rows, n_params + 2]` input matrix `[params..., rt, choice]`.
#[derive(Debug)]
struct AssembleInput {
    id: OpId,
    n_params: usize,
}

impl AssembleInput {
    fn compute(inputs: &[Value]) -> Result<Value, LanError> {
        let Some((data, params)) = inputs.split_first() else {
            return Err(LanError::evaluation("lan_input: missing data input"));
        };
        let rows = data.len();
        for param in params {
            if param.as_scalar().is_none() && param.len() != rows {
                return Err(LanError::ShapeMismatch {
                    expected: rows,
                    actual: param.len(),
                });
            }
        }

        let (rt, choice) = rt_choice(data.data());
        let cols = params.len() + 2;
        let mut values = Vec::with_capacity(rows * cols);
        for row in 0..rows {
            for param in params {
                values.push(param.as_scalar().unwrap_or_else(|| param.data()[row]));
            }
            values.push(rt[row]);
            values.push(choice[row]);
        }
        Value::new(DType::Float64, vec![rows, cols], values)
    }
}

impl Op for AssembleInput {
    fn id(&self) -> OpId {
        self.id
    }

    fn name(&self) -> &str {
        "lan_input"
    }

    fn make_node(&self, inputs: &[Variable]) -> Result<Vec<TensorType>, LanError> {
        let Some((data, params)) = inputs.split_first() else {
            return Err(LanError::node_construction(self.name(), "missing data input"));
        };
        if data.ty().ndim != 1 {
            return Err(LanError::node_construction(
                self.name(),
                format!("data must be a vector, got rank {}", data.ty().ndim),
            ));
        }
        if params.len() != self.n_params {
            return Err(LanError::ParameterArity {
                expected: self.n_params,
                actual: params.len(),
            });
        }
        if let Some((i, p)) = params.iter().enumerate().find(|(_, p)| p.ty().ndim > 1) {
            return Err(LanError::node_construction(
                self.name(),
                format!("parameter {i} must be a scalar or vector, got rank {}", p.ty().ndim),
            ));
        }
        Ok(vec![matrix_type()])
    }

    fn perform(&self, _: &Apply, inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<(), LanError> {
        single_output(outputs, Self::compute(inputs)?)
    }

    fn grad(&self, inputs: &[Variable], output_grads: &[Variable]) -> Result<Vec<InputGrad>, LanError> {
        let mut grads = Vec::with_capacity(inputs.len());
        // rt and choice are piecewise in the data
        grads.push(InputGrad::NotImplemented);
        for (index, param) in inputs[1..].iter().enumerate() {
            let column = Arc::new(ColumnGrad {
                id: next_op_id(),
                index,
                ty: param.ty(),
            });
            let g = apply(column, vec![Input::from(&output_grads[0])])?.output(0)?;
            grads.push(InputGrad::Grad(g));
        }
        Ok(grads)
    }

    fn lower(&self) -> Option<Kernel> {
        Some(Arc::new(|inputs: &[Value]| Self::compute(inputs).map(|v| vec![v])))
    }
}

/// Column `index` of a matrix, summed down to a scalar when `ty` is rank 0.
#[derive(Debug)]
struct ColumnGrad {
    id: OpId,
    index: usize,
    ty: TensorType,
}

impl ColumnGrad {
    fn compute(index: usize, ty: TensorType, inputs: &[Value]) -> Result<Value, LanError> {
        let g = &inputs[0];
        let [rows, cols] = match *g.shape() {
            [rows, cols] => [rows, cols],
            _ => return Err(LanError::evaluation("lan_input_grad expects a matrix")),
        };
        if index >= cols {
            return Err(LanError::ShapeMismatch {
                expected: index + 1,
                actual: cols,
            });
        }
        let column: Vec<f64> = (0..rows).map(|row| g.data()[row * cols + index]).collect();
        let value = if ty.ndim == 0 {
            Value::scalar(column.iter().sum())
        } else {
            Value::vector(column)
        };
        value.cast(ty.dtype)
    }
}

impl Op for ColumnGrad {
    fn id(&self) -> OpId {
        self.id
    }

    fn name(&self) -> &str {
        "lan_input_grad"
    }

    fn make_node(&self, inputs: &[Variable]) -> Result<Vec<TensorType>, LanError> {
        match inputs {
            [g] if g.ty().ndim == 2 => Ok(vec![self.ty]),
            _ => Err(LanError::node_construction(self.name(), "expected one matrix input")),
        }
    }

    fn perform(&self, _: &Apply, inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<(), LanError> {
        single_output(outputs, Self::compute(self.index, self.ty, inputs)?)
    }

    fn lower(&self) -> Option<Kernel> {
        let (index, ty) = (self.index, self.ty);
        Some(Arc::new(move |inputs: &[Value]| Self::compute(index, ty, inputs).map(|v| vec![v])))
    }
}

/// One network node, evaluated with the same kernel as the interpreter.
#[derive(Debug)]
struct NetworkNode {
    id: OpId,
    operation: Operation,
    grad_op: Arc<NetworkNodeGrad>,
}

impl NetworkNode {
    fn new(operation: Operation) -> Self {
        let grad_op = Arc::new(NetworkNodeGrad {
            id: next_op_id(),
            operation: operation.clone(),
        });
        Self {
            id: next_op_id(),
            operation,
            grad_op,
        }
    }

    fn compute(operation: &Operation, inputs: &[Value]) -> Result<Value, LanError> {
        let device = Default::default();
        let operands = inputs
            .iter()
            .map(|v| to_matrix::<Host>(operation.node(), v, &device))
            .collect::<Result<Vec<_>, _>>()?;
        from_matrix(operation.eval::<Host>(&operands, &device)?)
    }
}

impl Op for NetworkNode {
    fn id(&self) -> OpId {
        self.id
    }

    fn name(&self) -> &str {
        self.operation.node()
    }

    fn make_node(&self, inputs: &[Variable]) -> Result<Vec<TensorType>, LanError> {
        if inputs.len() != self.operation.inputs().len() {
            return Err(LanError::node_construction(
                self.name(),
                format!(
                    "expected {} inputs, got {}",
                    self.operation.inputs().len(),
                    inputs.len()
                ),
            ));
        }
        if inputs.iter().any(|v| v.ty().ndim != 2) {
            return Err(LanError::node_construction(self.name(), "inputs must be matrices"));
        }
        Ok(vec![matrix_type()])
    }

    fn perform(&self, _: &Apply, inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<(), LanError> {
        single_output(outputs, Self::compute(&self.operation, inputs)?)
    }

    fn grad(&self, inputs: &[Variable], output_grads: &[Variable]) -> Result<Vec<InputGrad>, LanError> {
        let mut operands: Vec<Input> = inputs.iter().map(Input::from).collect();
        operands.push(Input::from(&output_grads[0]));
        let grad_op: Arc<dyn Op> = Arc::clone(&self.grad_op) as Arc<dyn Op>;
        let node = apply(grad_op, operands)?;
        Ok(node.outputs().into_iter().map(InputGrad::Grad).collect())
    }

    fn lower(&self) -> Option<Kernel> {
        let operation = self.operation.clone();
        Some(Arc::new(move |inputs: &[Value]| Self::compute(&operation, inputs).map(|v| vec![v])))
    }
}

/// Vector-Jacobian product of a [`NetworkNode`]: `(inputs..., g) -> (dinput...)`.
#[derive(Debug)]
struct NetworkNodeGrad {
    id: OpId,
    operation: Operation,
}

impl NetworkNodeGrad {
    fn compute(operation: &Operation, inputs: &[Value]) -> Result<Vec<Value>, LanError> {
        let Some((g, operands)) = inputs.split_last() else {
            return Err(LanError::evaluation("missing output gradient"));
        };
        let device = Default::default();
        let leaves = operands
            .iter()
            .map(|v| to_matrix::<Autodiff<Host>>(operation.node(), v, &device).map(|t| t.require_grad()))
            .collect::<Result<Vec<_>, _>>()?;
        let output = operation.eval::<Autodiff<Host>>(&leaves, &device)?;
        let g = to_matrix::<Autodiff<Host>>(operation.node(), g, &device)?;
        if output.dims() != g.dims() {
            return Err(LanError::ShapeMismatch {
                expected: output.dims().iter().product(),
                actual: g.dims().iter().product(),
            });
        }

        let grads = output.mul(g).sum().backward();
        leaves
            .iter()
            .map(|leaf| match leaf.grad(&grads) {
                Some(grad) => from_matrix(grad),
                None => from_matrix(Tensor::<Host, 2>::zeros(leaf.dims(), &device)),
            })
            .collect()
    }
}

impl Op for NetworkNodeGrad {
    fn id(&self) -> OpId {
        self.id
    }

    fn name(&self) -> &str {
        "network_node_grad"
    }

    fn make_node(&self, inputs: &[Variable]) -> Result<Vec<TensorType>, LanError> {
        let expected = self.operation.inputs().len() + 1;
        if inputs.len() != expected {
            return Err(LanError::node_construction(
                self.name(),
                format!("expected {expected} inputs, got {}", inputs.len()),
            ));
        }
        Ok(vec![matrix_type(); expected - 1])
    }

    fn perform(&self, _: &Apply, inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<(), LanError> {
        fill_outputs(outputs, Self::compute(&self.operation, inputs)?);
        Ok(())
    }

    fn lower(&self) -> Option<Kernel> {
        let operation = self.operation.clone();
        Some(Arc::new(move |inputs: &[Value]| Self::compute(&operation, inputs)))
    }
}

/// Sum of a one-column network output.
#[derive(Debug)]
struct TotalLogp {
    id: OpId,
}

impl TotalLogp {
    fn compute(inputs: &[Value]) -> Result<Value, LanError> {
        let output = &inputs[0];
        match *output.shape() {
            [_, 1] => Ok(Value::scalar(output.data().iter().sum())),
            [_, cols] => Err(LanError::ShapeMismatch {
                expected: 1,
                actual: cols,
            }),
            _ => Err(LanError::evaluation("lan_total expects a matrix")),
        }
    }
}

impl Op for TotalLogp {
    fn id(&self) -> OpId {
        self.id
    }

    fn name(&self) -> &str {
        "lan_total"
    }

    fn make_node(&self, inputs: &[Variable]) -> Result<Vec<TensorType>, LanError> {
        match inputs {
            [output] if output.ty().ndim == 2 => Ok(vec![TensorType::scalar(DType::Float64)]),
            _ => Err(LanError::node_construction(self.name(), "expected one matrix input")),
        }
    }

    fn perform(&self, _: &Apply, inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<(), LanError> {
        single_output(outputs, Self::compute(inputs)?)
    }

    fn grad(&self, inputs: &[Variable], output_grads: &[Variable]) -> Result<Vec<InputGrad>, LanError> {
        let ones = fill_like(&inputs[0], 1.0)?;
        Ok(vec![InputGrad::Grad(mul(&output_grads[0], &ones)?)])
    }

    fn lower(&self) -> Option<Kernel> {
        Some(Arc::new(|inputs: &[Value]| Self::compute(inputs).map(|v| vec![v])))
    }
}

/// A network ready to be expanded into symbolic log-likelihood graphs.
#[derive(Debug)]
pub struct SymbolicLogp {
    graph: Arc<InterchangeGraph>,
    operations: Vec<Operation>,
    n_params: usize,
}

impl SymbolicLogp {
    /// Builds `sum(network([params..., rt, choice]))` for `data` and `params`.
    ///
    /// The result is a `Float64` scalar. Its gradient with respect to a
    /// parameter has that parameter's type; the gradient with respect to the
    /// data is not implemented.
    pub fn call(&self, data: impl Into<Input>, params: Vec<Input>) -> Result<Variable, LanError> {
        let mut inputs = Vec::with_capacity(params.len() + 1);
        inputs.push(as_tensor_variable(data.into(), "lan_input")?);
        for param in params {
            inputs.push(as_tensor_variable(param, "lan_input")?);
        }
        let assemble = Arc::new(AssembleInput {
            id: next_op_id(),
            n_params: self.n_params,
        });
        let input = apply(assemble, inputs.into_iter().map(Input::from).collect())?.output(0)?;

        let mut values: HashMap<&str, Variable> = HashMap::new();
        values.insert(self.graph.input(), input);
        for init in self.graph.initializers() {
            let shape = init.matrix_shape()?;
            let value = Value::new(DType::Float64, shape.to_vec(), init.data().to_vec())?;
            values.insert(init.name(), Variable::constant(value));
        }

        for operation in &self.operations {
            let output = match operation.kind() {
                OpKind::Constant(init) => {
                    let shape = init.matrix_shape()?;
                    Variable::constant(Value::new(DType::Float64, shape.to_vec(), init.data().to_vec())?)
                }
                _ => {
                    let operands = operation
                        .inputs()
                        .iter()
                        .map(|name| {
                            values.get(name.as_str()).map(Input::from).ok_or_else(|| {
                                LanError::InvalidGraph(format!(
                                    "node `{}` consumes undefined value `{name}`",
                                    operation.node()
                                ))
                            })
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    let node = Arc::new(NetworkNode::new(operation.clone()));
                    apply(node, operands)?.output(0)?
                }
            };
            values.insert(operation.output(), output);
        }

        let output = values.remove(self.graph.output()).ok_or_else(|| {
            LanError::InvalidGraph(format!("graph output `{}` was not produced", self.graph.output()))
        })?;
        apply(Arc::new(TotalLogp { id: next_op_id() }), vec![output.into()])?.output(0)
    }

    pub fn n_params(&self) -> usize {
        self.n_params
    }

    pub fn graph(&self) -> &Arc<InterchangeGraph> {
        &self.graph
    }
}

/// Loads a network and prepares it for symbolic expansion.
///
/// Every node is parsed up front, so an unsupported operator fails here
/// rather than when the graph is built.
pub fn make_symbolic_logp(source: impl Into<ModelSource>, n_params: usize) -> Result<SymbolicLogp, LanError> {
    let graph = source.into().load()?;
    if let Some(width) = graph.input_width() {
        if width != n_params + 2 {
            return Err(LanError::ShapeMismatch {
                expected: n_params + 2,
                actual: width,
            });
        }
    }
    let operations = graph
        .nodes()
        .iter()
        .map(|node| Operation::parse(node, &graph))
        .collect::<Result<Vec<_>, _>>()?;
    log::info!(
        "Prepared symbolic logp for `{}` ({} nodes, {} parameters)",
        graph.name(),
        operations.len(),
        n_params
    );
    Ok(SymbolicLogp {
        graph,
        operations,
        n_params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphConfig, Initializer, Node};
    use crate::layers::Activation;
    use crate::likelihood::{LanConfig, ParamValue, build_likelihood};
    use crate::symbolic::{DispatchRegistry, Function, grad, lower};

    type TestBackend = Autodiff<NdArray<f64>>;

    fn network() -> InterchangeGraph {
        GraphConfig::with_feature_size(4)
            .dense(
                vec![
                    vec![0.3, -0.2, 0.5, 0.1],
                    vec![-0.4, 0.7, 0.2, -0.6],
                    vec![0.05, 0.1, -0.3, 0.8],
                ],
                vec![0.1, 0.0, -0.1],
                Activation::Tanh,
            )
            .dense(vec![vec![1.0, -2.0, 0.5]], vec![0.25], Activation::None)
            .build()
            .unwrap()
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-10,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn test_matches_network_functions() {
        let graph = Arc::new(network());
        let symbolic = make_symbolic_logp(Arc::clone(&graph), 2).unwrap();
        let device = Default::default();
        let functions = build_likelihood::<TestBackend>(graph, 2, &LanConfig::new(), &device).unwrap();

        let data_values = vec![0.81, -1.23, 0.44];
        let a_values = vec![0.2, 0.4, 0.9];
        let params = vec![ParamValue::Scalar(0.5), ParamValue::Batched(a_values.clone())];
        let expected_logp = functions.forward().logp(&data_values, &params).unwrap();
        let expected_grads = functions.grad().grad_logp(&data_values, &params).unwrap();

        let data = Variable::vector("data");
        let v = Variable::scalar("v");
        let a = Variable::vector("a");
        let logp = symbolic.call(&data, vec![(&v).into(), (&a).into()]).unwrap();
        let grads = grad(&logp, &[v.clone(), a.clone()]).unwrap();
        assert_eq!(grads[0].ty().ndim, 0);
        assert_eq!(grads[1].ty().ndim, 1);

        let mut outputs = vec![logp];
        outputs.extend(grads);
        let f = Function::new(vec![data, v, a], outputs).unwrap();
        let out = f
            .call(&[
                Value::vector(data_values),
                Value::scalar(0.5),
                Value::vector(a_values),
            ])
            .unwrap();

        assert_close(out[0].as_scalar().unwrap(), expected_logp);
        assert_close(out[1].as_scalar().unwrap(), expected_grads[0].values()[0]);
        for (actual, expected) in out[2].data().iter().zip(expected_grads[1].values()) {
            assert_close(*actual, *expected);
        }
    }

    #[test]
    fn test_lowers_without_registered_kernels() {
        let symbolic = make_symbolic_logp(network(), 2).unwrap();
        let data = Variable::vector("data");
        let v = Variable::scalar("v");
        let logp = symbolic.call(&data, vec![(&v).into(), 1.5.into()]).unwrap();
        let dv = grad(&logp, std::slice::from_ref(&v)).unwrap();

        let inputs = vec![data, v];
        let mut outputs = vec![logp];
        outputs.extend(dv);
        let args = [Value::vector(vec![0.5, -0.7]), Value::scalar(0.3)];
        let evaluated = Function::new(inputs.clone(), outputs.clone()).unwrap().call(&args).unwrap();
        let lowered = lower(inputs, outputs, &DispatchRegistry::new())
            .unwrap()
            .call(&args)
            .unwrap();
        assert_eq!(lowered, evaluated);
    }

    #[test]
    fn test_gradient_accumulates_over_shared_values() {
        // y = w * (x + x), so dy/dv = 2 * w_v per row
        let w = Initializer::new("w", vec![3, 1], vec![3.0, 0.0, 0.0]).unwrap();
        let nodes = vec![
            Node::new("double", "Add", vec!["x".to_string(), "x".to_string()], vec!["h".to_string()]),
            Node::new("proj", "MatMul", vec!["h".to_string(), "w".to_string()], vec!["y".to_string()]),
        ];
        let graph = InterchangeGraph::new("shared", "x", Some(3), nodes, vec![w], "y").unwrap();
        let symbolic = make_symbolic_logp(graph, 1).unwrap();

        let data = Variable::vector("data");
        let v = Variable::scalar("v");
        let logp = symbolic.call(&data, vec![(&v).into()]).unwrap();
        let dv = grad(&logp, std::slice::from_ref(&v)).unwrap();
        let f = Function::new(vec![data, v], vec![logp, dv[0].clone()]).unwrap();
        let out = f
            .call(&[Value::vector(vec![1.0, -2.0]), Value::scalar(0.5)])
            .unwrap();
        assert_eq!(out[0].as_scalar(), Some(6.0));
        assert_eq!(out[1].as_scalar(), Some(12.0));
    }

    #[test]
    fn test_construction_errors() {
        assert!(matches!(
            make_symbolic_logp(network(), 3),
            Err(LanError::ShapeMismatch { expected: 5, actual: 4 })
        ));

        let nodes = vec![Node::new("sm", "Softmax", vec!["x".to_string()], vec!["y".to_string()])];
        let graph = InterchangeGraph::new("net", "x", None, nodes, vec![], "y").unwrap();
        assert!(matches!(
            make_symbolic_logp(graph, 1),
            Err(LanError::UnsupportedOperator { .. })
        ));

        let symbolic = make_symbolic_logp(network(), 2).unwrap();
        let data = Variable::vector("data");
        assert!(matches!(
            symbolic.call(&data, vec![1.0.into()]),
            Err(LanError::ParameterArity { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_grad_wrt_data_not_implemented() {
        let symbolic = make_symbolic_logp(network(), 2).unwrap();
        let data = Variable::vector("data");
        let logp = symbolic.call(&data, vec![1.0.into(), 0.5.into()]).unwrap();
        assert!(matches!(
            grad(&logp, &[data]),
            Err(LanError::GradientNotImplemented { ref op, input: 0 }) if op == "lan_input"
        ));
    }
}
