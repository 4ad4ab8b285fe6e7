//! Elementary ops used to assemble gradient expressions.

use std::sync::Arc;

use crate::errors::LanError;

use super::op::{InputGrad, Kernel, Op, OpId, next_op_id};
use super::value::{DType, TensorType, Value};
use super::variable::{Apply, Input, Variable, apply};

fn expect_arity(op: &str, inputs: &[Variable], expected: usize) -> Result<(), LanError> {
    if inputs.len() != expected {
        return Err(LanError::node_construction(
            op,
            format!("expected {expected} inputs, got {}", inputs.len()),
        ));
    }
    Ok(())
}

fn expect_rank(op: &str, var: &Variable) -> Result<(), LanError> {
    if var.ty().ndim > 1 {
        return Err(LanError::node_construction(
            op,
            format!("expected a scalar or vector, got rank {}", var.ty().ndim),
        ));
    }
    Ok(())
}

/// Elementwise binary result type with scalar broadcasting.
///
/// Scalars and vectors combine freely; higher ranks only combine with a
/// scalar or an operand of the same rank.
fn binary_type(op: &str, inputs: &[Variable]) -> Result<Vec<TensorType>, LanError> {
    expect_arity(op, inputs, 2)?;
    let (a, b) = (inputs[0].ty(), inputs[1].ty());
    if a.ndim.max(b.ndim) > 1 && a.ndim != b.ndim && a.ndim.min(b.ndim) != 0 {
        return Err(LanError::node_construction(
            op,
            format!("cannot broadcast rank {} with rank {}", a.ndim, b.ndim),
        ));
    }
    Ok(vec![TensorType::new(a.dtype.promote(b.dtype), a.ndim.max(b.ndim))])
}

fn elementwise(lhs: &Value, rhs: &Value, f: impl Fn(f64, f64) -> f64) -> Result<Value, LanError> {
    let dtype = lhs.dtype().promote(rhs.dtype());
    let (template, data) = match (lhs.as_scalar(), rhs.as_scalar()) {
        (Some(a), Some(b)) => (lhs, vec![f(a, b)]),
        (Some(a), None) => (rhs, rhs.data().iter().map(|&b| f(a, b)).collect()),
        (None, Some(b)) => (lhs, lhs.data().iter().map(|&a| f(a, b)).collect()),
        (None, None) => {
            if lhs.shape() != rhs.shape() {
                return Err(LanError::ShapeMismatch {
                    expected: lhs.len(),
                    actual: rhs.len(),
                });
            }
            let data = lhs.data().iter().zip(rhs.data()).map(|(&a, &b)| f(a, b)).collect();
            (lhs, data)
        }
    };
    template.with_data(DType::Float64, data).cast(dtype)
}

/// Reduces `grad` to a scalar when `input` was broadcast.
fn unbroadcast(grad: Variable, input: &Variable) -> Result<InputGrad, LanError> {
    if input.ty().ndim < grad.ty().ndim {
        Ok(InputGrad::Grad(sum(&grad)?))
    } else {
        Ok(InputGrad::Grad(grad))
    }
}

fn single(op: &str, outputs: &mut [Option<Value>], value: Value) -> Result<(), LanError> {
    match outputs.first_mut() {
        Some(slot) => {
            *slot = Some(value);
            Ok(())
        }
        None => Err(LanError::InvalidGraph(format!("`{op}` has no output slot"))),
    }
}

fn kernel(f: fn(&[Value]) -> Result<Value, LanError>) -> Kernel {
    Arc::new(move |inputs| f(inputs).map(|v| vec![v]))
}

/// Elementwise addition.
#[derive(Debug)]
pub struct Add {
    id: OpId,
}

impl Add {
    pub fn new() -> Self {
        Self { id: next_op_id() }
    }

    fn compute(inputs: &[Value]) -> Result<Value, LanError> {
        elementwise(&inputs[0], &inputs[1], |a, b| a + b)
    }
}

impl Default for Add {
    fn default() -> Self {
        Self::new()
    }
}

impl Op for Add {
    fn id(&self) -> OpId {
        self.id
    }

    fn name(&self) -> &str {
        "add"
    }

    fn make_node(&self, inputs: &[Variable]) -> Result<Vec<TensorType>, LanError> {
        binary_type(self.name(), inputs)
    }

    fn perform(&self, _: &Apply, inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<(), LanError> {
        single(self.name(), outputs, Self::compute(inputs)?)
    }

    fn grad(&self, inputs: &[Variable], output_grads: &[Variable]) -> Result<Vec<InputGrad>, LanError> {
        let g = &output_grads[0];
        inputs.iter().map(|x| unbroadcast(g.clone(), x)).collect()
    }

    fn lower(&self) -> Option<Kernel> {
        Some(kernel(Self::compute))
    }
}

/// Elementwise multiplication.
#[derive(Debug)]
pub struct Mul {
    id: OpId,
}

impl Mul {
    pub fn new() -> Self {
        Self { id: next_op_id() }
    }

    fn compute(inputs: &[Value]) -> Result<Value, LanError> {
        elementwise(&inputs[0], &inputs[1], |a, b| a * b)
    }
}

impl Default for Mul {
    fn default() -> Self {
        Self::new()
    }
}

impl Op for Mul {
    fn id(&self) -> OpId {
        self.id
    }

    fn name(&self) -> &str {
        "mul"
    }

    fn make_node(&self, inputs: &[Variable]) -> Result<Vec<TensorType>, LanError> {
        binary_type(self.name(), inputs)
    }

    fn perform(&self, _: &Apply, inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<(), LanError> {
        single(self.name(), outputs, Self::compute(inputs)?)
    }

    fn grad(&self, inputs: &[Variable], output_grads: &[Variable]) -> Result<Vec<InputGrad>, LanError> {
        let g = &output_grads[0];
        Ok(vec![
            unbroadcast(mul(g, &inputs[1])?, &inputs[0])?,
            unbroadcast(mul(g, &inputs[0])?, &inputs[1])?,
        ])
    }

    fn lower(&self) -> Option<Kernel> {
        Some(kernel(Self::compute))
    }
}

/// Sum of all elements.
#[derive(Debug)]
pub struct Sum {
    id: OpId,
}

impl Sum {
    pub fn new() -> Self {
        Self { id: next_op_id() }
    }

    fn compute(inputs: &[Value]) -> Result<Value, LanError> {
        let x = &inputs[0];
        Value::scalar(x.data().iter().sum()).cast(x.dtype())
    }
}

impl Default for Sum {
    fn default() -> Self {
        Self::new()
    }
}

impl Op for Sum {
    fn id(&self) -> OpId {
        self.id
    }

    fn name(&self) -> &str {
        "sum"
    }

    fn make_node(&self, inputs: &[Variable]) -> Result<Vec<TensorType>, LanError> {
        expect_arity(self.name(), inputs, 1)?;
        expect_rank(self.name(), &inputs[0])?;
        Ok(vec![TensorType::scalar(inputs[0].ty().dtype)])
    }

    fn perform(&self, _: &Apply, inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<(), LanError> {
        single(self.name(), outputs, Self::compute(inputs)?)
    }

    fn grad(&self, inputs: &[Variable], output_grads: &[Variable]) -> Result<Vec<InputGrad>, LanError> {
        let ones = fill_like(&inputs[0], 1.0)?;
        Ok(vec![InputGrad::Grad(mul(&output_grads[0], &ones)?)])
    }

    fn lower(&self) -> Option<Kernel> {
        Some(kernel(Self::compute))
    }
}

/// A tensor shaped like its input, filled with a constant.
#[derive(Debug)]
pub struct FillLike {
    id: OpId,
    value: f64,
}

impl FillLike {
    pub fn new(value: f64) -> Self {
        Self {
            id: next_op_id(),
            value,
        }
    }

    fn compute(value: f64, inputs: &[Value]) -> Result<Value, LanError> {
        let x = &inputs[0];
        x.with_data(DType::Float64, vec![value; x.len()]).cast(x.dtype())
    }
}

impl Op for FillLike {
    fn id(&self) -> OpId {
        self.id
    }

    fn name(&self) -> &str {
        "fill_like"
    }

    fn make_node(&self, inputs: &[Variable]) -> Result<Vec<TensorType>, LanError> {
        expect_arity(self.name(), inputs, 1)?;
        Ok(vec![inputs[0].ty()])
    }

    fn perform(&self, _: &Apply, inputs: &[Value], outputs: &mut [Option<Value>]) -> Result<(), LanError> {
        single(self.name(), outputs, Self::compute(self.value, inputs)?)
    }

    fn grad(&self, _: &[Variable], _: &[Variable]) -> Result<Vec<InputGrad>, LanError> {
        Ok(vec![InputGrad::Disconnected])
    }

    fn lower(&self) -> Option<Kernel> {
        let value = self.value;
        Some(Arc::new(move |inputs| Self::compute(value, inputs).map(|v| vec![v])))
    }
}

fn apply_single(op: Arc<dyn Op>, inputs: Vec<Input>) -> Result<Variable, LanError> {
    apply(op, inputs)?.output(0)
}

/// `a + b`.
pub fn add(a: impl Into<Input>, b: impl Into<Input>) -> Result<Variable, LanError> {
    apply_single(Arc::new(Add::new()), vec![a.into(), b.into()])
}

/// `a * b`.
pub fn mul(a: impl Into<Input>, b: impl Into<Input>) -> Result<Variable, LanError> {
    apply_single(Arc::new(Mul::new()), vec![a.into(), b.into()])
}

/// Sum of all elements of `x`.
pub fn sum(x: impl Into<Input>) -> Result<Variable, LanError> {
    apply_single(Arc::new(Sum::new()), vec![x.into()])
}

/// `x`-shaped tensor of `value`.
pub fn fill_like(x: impl Into<Input>, value: f64) -> Result<Variable, LanError> {
    apply_single(Arc::new(FillLike::new(value)), vec![x.into()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolic::Function;

    #[test]
    fn test_add_broadcasts_scalar() {
        let x = Variable::vector("x");
        let y = add(&x, 10.0).unwrap();
        assert_eq!(y.ty(), TensorType::vector(DType::Float64));

        let f = Function::new(vec![x], vec![y]).unwrap();
        let out = f.call(&[Value::vector(vec![1.0, 2.0])]).unwrap();
        assert_eq!(out[0].data(), &[11.0, 12.0]);
    }

    #[test]
    fn test_vector_length_mismatch() {
        let a = Value::vector(vec![1.0, 2.0]);
        let b = Value::vector(vec![1.0, 2.0, 3.0]);
        assert!(matches!(
            Mul::compute(&[a, b]),
            Err(LanError::ShapeMismatch { expected: 2, actual: 3 })
        ));
    }

    #[test]
    fn test_sum_and_fill_like() {
        let x = Variable::vector("x");
        let total = sum(&x).unwrap();
        let zeros = fill_like(&x, 0.0).unwrap();
        let f = Function::new(vec![x], vec![total, zeros]).unwrap();
        let out = f.call(&[Value::vector(vec![1.5, 2.5, -1.0])]).unwrap();
        assert_eq!(out[0].as_scalar(), Some(3.0));
        assert_eq!(out[1].data(), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_rank_check() {
        let m = Variable::input("m", TensorType::new(DType::Float64, 2));
        assert!(matches!(sum(&m), Err(LanError::NodeConstruction { .. })));
        assert!(matches!(add(&m, Variable::vector("v")), Err(LanError::NodeConstruction { .. })));
    }

    #[test]
    fn test_matrices_add_elementwise() {
        let m = Variable::input("m", TensorType::new(DType::Float64, 2));
        let doubled = add(&m, &m).unwrap();
        let scaled = mul(2.0, &m).unwrap();
        let f = Function::new(vec![m], vec![doubled, scaled]).unwrap();
        let value = Value::new(DType::Float64, vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = f.call(&[value]).unwrap();
        assert_eq!(out[0].shape(), &[2, 2]);
        assert_eq!(out[0].data(), &[2.0, 4.0, 6.0, 8.0]);
        assert_eq!(out[1], out[0]);
    }
}
