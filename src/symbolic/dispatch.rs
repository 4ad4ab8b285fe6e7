//! Lowering symbolic graphs to kernels through an explicit dispatch table.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::errors::LanError;

use super::function::{bind, check_bound, lookup, store, toposort};
use super::op::{Kernel, Op, OpId};
use super::value::Value;
use super::variable::{Apply, Variable};

/// Maps op instances to the kernels that replace them when lowered.
///
/// Filled while ops are constructed, then passed by reference to [`lower`].
#[derive(Clone, Default)]
pub struct DispatchRegistry {
    kernels: HashMap<OpId, Kernel>,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `kernel` for the op instance `op`, replacing any previous entry.
    pub fn register(&mut self, op: &dyn Op, kernel: Kernel) {
        log::debug!("Registered dispatch for `{}` (op id {})", op.name(), op.id());
        self.kernels.insert(op.id(), kernel);
    }

    pub fn get(&self, id: OpId) -> Option<&Kernel> {
        self.kernels.get(&id)
    }

    pub fn contains(&self, id: OpId) -> bool {
        self.kernels.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

impl fmt::Debug for DispatchRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&OpId> = self.kernels.keys().collect();
        ids.sort();
        f.debug_struct("DispatchRegistry").field("ops", &ids).finish()
    }
}

/// A graph whose every node has been resolved to a kernel.
pub struct LoweredFunction {
    inputs: Vec<Variable>,
    outputs: Vec<Variable>,
    steps: Vec<(Arc<Apply>, Kernel)>,
}

impl LoweredFunction {
    /// Runs the kernels in order. `Op::perform` is never called.
    pub fn call(&self, args: &[Value]) -> Result<Vec<Value>, LanError> {
        let mut env = bind(&self.inputs, args)?;
        for (node, kernel) in &self.steps {
            let values = node
                .inputs()
                .iter()
                .map(|v| lookup(&env, v))
                .collect::<Result<Vec<_>, _>>()?;
            let outputs = kernel(&values)?.into_iter().map(Some).collect();
            store(&mut env, node, outputs)?;
        }
        self.outputs.iter().map(|v| lookup(&env, v)).collect()
    }

    pub fn num_steps(&self) -> usize {
        self.steps.len()
    }
}

impl fmt::Debug for LoweredFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ops: Vec<&str> = self.steps.iter().map(|(node, _)| node.op().name()).collect();
        f.debug_struct("LoweredFunction")
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("steps", &ops)
            .finish()
    }
}

/// Lowers the graph from `inputs` to `outputs`.
///
/// Each node takes the kernel registered for its op instance, else the op's
/// own lowering, else lowering fails with [`LanError::MissingDispatch`].
pub fn lower(
    inputs: Vec<Variable>,
    outputs: Vec<Variable>,
    registry: &DispatchRegistry,
) -> Result<LoweredFunction, LanError> {
    let nodes = toposort(&outputs);
    check_bound(&inputs, &outputs, &nodes)?;

    let steps = nodes
        .into_iter()
        .map(|node| {
            let op = node.op();
            let kernel = match registry.get(op.id()) {
                Some(kernel) => Arc::clone(kernel),
                None => op.lower().ok_or_else(|| LanError::MissingDispatch {
                    op: op.name().to_string(),
                    id: op.id(),
                })?,
            };
            Ok((node, kernel))
        })
        .collect::<Result<Vec<_>, LanError>>()?;

    Ok(LoweredFunction {
        inputs,
        outputs,
        steps,
    })
}
