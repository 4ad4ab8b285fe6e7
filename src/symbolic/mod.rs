//! A small symbolic tensor-graph framework.
//!
//! Graphs are built from [`Variable`]s and [`Apply`] nodes of [`Op`]s. A
//! [`Function`] evaluates them with each op's `perform`; [`grad`] extends a
//! graph with its reverse-mode gradient; [`lower`] resolves every node to a
//! [`Kernel`] through a [`DispatchRegistry`] for direct execution.

mod basic;
mod dispatch;
mod function;
mod gradient;
mod op;
mod value;
mod variable;

pub use basic::{Add, FillLike, Mul, Sum, add, fill_like, mul, sum};
pub use dispatch::{DispatchRegistry, LoweredFunction, lower};
pub use function::Function;
pub use gradient::grad;
pub use op::{InputGrad, Kernel, Op, OpId, next_op_id};
pub use value::{DType, TensorType, Value};
pub use variable::{Apply, ApplyId, Input, Origin, Variable, VariableId, apply, as_tensor_variable};
