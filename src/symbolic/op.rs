//! The `Op` trait: what a node computes and how it differentiates.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::errors::LanError;

use super::value::{TensorType, Value};
use super::variable::{Apply, Variable};

/// Unique identifier for an op instance.
pub type OpId = usize;

/// Global counter for unique op IDs.
static OP_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Generates a new unique op ID.
pub fn next_op_id() -> OpId {
    OP_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// An executable implementation of one node: input values in, output values out.
pub type Kernel = Arc<dyn Fn(&[Value]) -> Result<Vec<Value>, LanError> + Send + Sync>;

/// Gradient contribution of one op input.
#[derive(Debug, Clone)]
pub enum InputGrad {
    Grad(Variable),
    /// The output does not depend on this input.
    Disconnected,
    /// The dependency exists but has no gradient.
    NotImplemented,
}

/// A node type in a symbolic graph.
pub trait Op: fmt::Debug + Send + Sync {
    /// Identity of this instance; dispatch tables are keyed by it.
    fn id(&self) -> OpId;

    fn name(&self) -> &str;

    /// Validates `inputs` and declares the output types.
    fn make_node(&self, inputs: &[Variable]) -> Result<Vec<TensorType>, LanError>;

    /// Computes the node's outputs into `outputs`, one slot per output.
    fn perform(
        &self,
        node: &Apply,
        inputs: &[Value],
        outputs: &mut [Option<Value>],
    ) -> Result<(), LanError>;

    /// Symbolic gradient of the cost with respect to each input, given the
    /// gradients with respect to each output.
    fn grad(
        &self,
        inputs: &[Variable],
        _output_grads: &[Variable],
    ) -> Result<Vec<InputGrad>, LanError> {
        Ok(inputs.iter().map(|_| InputGrad::NotImplemented).collect())
    }

    /// A kernel usable when the graph is lowered, if the op provides one.
    fn lower(&self) -> Option<Kernel> {
        None
    }
}
