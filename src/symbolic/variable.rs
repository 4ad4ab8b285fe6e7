//! Symbolic variables and the nodes that produce them.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::errors::LanError;

use super::op::Op;
use super::value::{DType, TensorType, Value};

/// Unique identifier for a variable.
pub type VariableId = usize;

/// Unique identifier for an Apply node.
pub type ApplyId = usize;

static VARIABLE_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);
static APPLY_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn next_variable_id() -> VariableId {
    VARIABLE_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn next_apply_id() -> ApplyId {
    APPLY_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// How a variable came to exist.
#[derive(Debug, Clone)]
pub enum Origin {
    /// A free input, bound when a function is called.
    Input,
    /// A literal folded into the graph.
    Constant(Value),
    /// Output `index` of an Apply node.
    Output { node: Arc<Apply>, index: usize },
}

struct VariableInner {
    id: VariableId,
    ty: TensorType,
    name: Option<String>,
    origin: Origin,
}

/// A typed symbolic tensor. Clones share identity.
#[derive(Clone)]
pub struct Variable {
    inner: Arc<VariableInner>,
}

impl Variable {
    fn from_parts(id: VariableId, ty: TensorType, name: Option<String>, origin: Origin) -> Self {
        Self {
            inner: Arc::new(VariableInner {
                id,
                ty,
                name,
                origin,
            }),
        }
    }

    /// A free input variable.
    pub fn input(name: impl Into<String>, ty: TensorType) -> Self {
        Self::from_parts(next_variable_id(), ty, Some(name.into()), Origin::Input)
    }

    /// A free `Float64` scalar input.
    pub fn scalar(name: impl Into<String>) -> Self {
        Self::input(name, TensorType::scalar(DType::Float64))
    }

    /// A free `Float64` vector input.
    pub fn vector(name: impl Into<String>) -> Self {
        Self::input(name, TensorType::vector(DType::Float64))
    }

    /// A constant holding `value`.
    pub fn constant(value: Value) -> Self {
        let ty = value.tensor_type();
        Self::from_parts(next_variable_id(), ty, None, Origin::Constant(value))
    }

    pub fn id(&self) -> VariableId {
        self.inner.id
    }

    pub fn ty(&self) -> TensorType {
        self.inner.ty
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn origin(&self) -> &Origin {
        &self.inner.origin
    }

    /// The node that produced this variable, if any.
    pub fn owner(&self) -> Option<&Arc<Apply>> {
        match &self.inner.origin {
            Origin::Output { node, .. } => Some(node),
            _ => None,
        }
    }

    pub fn is_input(&self) -> bool {
        matches!(self.inner.origin, Origin::Input)
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match (&self.inner.name, &self.inner.origin) {
            (Some(name), _) => name.clone(),
            (None, Origin::Constant(v)) => format!("const{:?}", v.data()),
            (None, Origin::Output { node, index }) => format!("{}.{}", node.op().name(), index),
            (None, Origin::Input) => "input".to_string(),
        };
        write!(
            f,
            "Variable#{}({label}: {:?}[{}])",
            self.inner.id, self.inner.ty.dtype, self.inner.ty.ndim
        )
    }
}

/// One application of an op to input variables.
#[derive(Debug)]
pub struct Apply {
    id: ApplyId,
    op: Arc<dyn Op>,
    inputs: Vec<Variable>,
    output_ids: Vec<VariableId>,
    output_types: Vec<TensorType>,
}

impl Apply {
    pub fn id(&self) -> ApplyId {
        self.id
    }

    pub fn op(&self) -> &Arc<dyn Op> {
        &self.op
    }

    pub fn inputs(&self) -> &[Variable] {
        &self.inputs
    }

    pub fn output_types(&self) -> &[TensorType] {
        &self.output_types
    }

    pub(crate) fn output_ids(&self) -> &[VariableId] {
        &self.output_ids
    }

    pub fn num_outputs(&self) -> usize {
        self.output_ids.len()
    }

    /// Output variable `index`. Repeated calls return the same identity.
    pub fn output(self: &Arc<Self>, index: usize) -> Result<Variable, LanError> {
        let (Some(&id), Some(&ty)) = (self.output_ids.get(index), self.output_types.get(index)) else {
            return Err(LanError::InvalidGraph(format!(
                "`{}` has {} outputs, requested output {index}",
                self.op.name(),
                self.output_ids.len()
            )));
        };
        Ok(Variable::from_parts(
            id,
            ty,
            None,
            Origin::Output {
                node: Arc::clone(self),
                index,
            },
        ))
    }

    /// All output variables.
    pub fn outputs(self: &Arc<Self>) -> Vec<Variable> {
        (0..self.output_ids.len())
            .filter_map(|index| self.output(index).ok())
            .collect()
    }
}

/// Anything that can be coerced into an op input.
#[derive(Debug, Clone)]
pub enum Input {
    Var(Variable),
    Scalar(f64),
    Array(Value),
}

impl From<Variable> for Input {
    fn from(value: Variable) -> Self {
        Input::Var(value)
    }
}

impl From<&Variable> for Input {
    fn from(value: &Variable) -> Self {
        Input::Var(value.clone())
    }
}

impl From<f64> for Input {
    fn from(value: f64) -> Self {
        Input::Scalar(value)
    }
}

impl From<Value> for Input {
    fn from(value: Value) -> Self {
        Input::Array(value)
    }
}

impl From<Vec<f64>> for Input {
    fn from(value: Vec<f64>) -> Self {
        Input::Array(Value::vector(value))
    }
}

/// Coerces `input` into a graph variable for an `op` node.
///
/// Literals become constants. Only scalars and vectors are accepted.
pub fn as_tensor_variable(input: Input, op: &str) -> Result<Variable, LanError> {
    match input {
        Input::Var(var) => Ok(var),
        Input::Scalar(v) => Ok(Variable::constant(Value::scalar(v))),
        Input::Array(value) => {
            if value.ndim() > 1 {
                return Err(LanError::node_construction(
                    op,
                    format!("expected a scalar or vector, got rank {}", value.ndim()),
                ));
            }
            Ok(Variable::constant(value))
        }
    }
}

/// Applies `op` to `inputs`, validating them with [`Op::make_node`].
pub fn apply(op: Arc<dyn Op>, inputs: Vec<Input>) -> Result<Arc<Apply>, LanError> {
    let inputs = inputs
        .into_iter()
        .map(|input| as_tensor_variable(input, op.name()))
        .collect::<Result<Vec<_>, _>>()?;
    let output_types = op.make_node(&inputs)?;
    let output_ids = output_types.iter().map(|_| next_variable_id()).collect();
    Ok(Arc::new(Apply {
        id: next_apply_id(),
        op,
        inputs,
        output_ids,
        output_types,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolic::basic::Add;

    #[test]
    fn test_output_identity_is_stable() {
        let x = Variable::scalar("x");
        let node = apply(Arc::new(Add::new()), vec![x.into(), 1.0.into()]).unwrap();
        assert_eq!(node.output(0).unwrap().id(), node.output(0).unwrap().id());
        assert!(node.output(1).is_err());
    }

    #[test]
    fn test_literals_become_constants() {
        let var = as_tensor_variable(Input::from(vec![1.0, 2.0]), "test").unwrap();
        assert_eq!(var.ty(), TensorType::vector(DType::Float64));
        assert!(matches!(var.origin(), Origin::Constant(_)));
    }

    #[test]
    fn test_rank_two_literal_rejected() {
        let matrix = Value::new(DType::Float64, vec![2, 2], vec![0.0; 4]).unwrap();
        let err = as_tensor_variable(matrix.into(), "lan_logp").unwrap_err();
        assert!(matches!(err, LanError::NodeConstruction { ref op, .. } if op == "lan_logp"));
    }
}
