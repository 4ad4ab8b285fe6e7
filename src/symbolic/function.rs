//! Callable symbolic functions evaluated with `Op::perform`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::errors::LanError;

use super::value::Value;
use super::variable::{Apply, Origin, Variable, VariableId};

/// Nodes needed to compute `outputs`, in dependency order.
pub(crate) fn toposort(outputs: &[Variable]) -> Vec<Arc<Apply>> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    // Iterative post-order DFS; (node, expanded)
    let mut stack: Vec<(Arc<Apply>, bool)> = outputs
        .iter()
        .rev()
        .filter_map(|v| v.owner().cloned())
        .map(|node| (node, false))
        .collect();

    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            order.push(node);
            continue;
        }
        if !visited.insert(node.id()) {
            continue;
        }
        stack.push((Arc::clone(&node), true));
        for input in node.inputs().iter().rev() {
            if let Some(owner) = input.owner() {
                if !visited.contains(&owner.id()) {
                    stack.push((Arc::clone(owner), false));
                }
            }
        }
    }
    order
}

/// Checks that every free input reachable from `outputs` is in `inputs`.
pub(crate) fn check_bound(
    inputs: &[Variable],
    outputs: &[Variable],
    nodes: &[Arc<Apply>],
) -> Result<(), LanError> {
    let bound: HashSet<VariableId> = inputs.iter().map(|v| v.id()).collect();
    let reachable = nodes
        .iter()
        .flat_map(|node| node.inputs().iter())
        .chain(outputs.iter());
    for var in reachable {
        if var.is_input() && !bound.contains(&var.id()) {
            return Err(LanError::InvalidGraph(format!(
                "free input {var:?} is not bound by the function"
            )));
        }
    }
    Ok(())
}

/// Binds `args` to `inputs`, checking count, dtype and rank.
pub(crate) fn bind(
    inputs: &[Variable],
    args: &[Value],
) -> Result<HashMap<VariableId, Value>, LanError> {
    if args.len() != inputs.len() {
        return Err(LanError::ParameterArity {
            expected: inputs.len(),
            actual: args.len(),
        });
    }
    let mut env = HashMap::new();
    for (position, (var, arg)) in inputs.iter().zip(args).enumerate() {
        if arg.tensor_type() != var.ty() {
            return Err(LanError::node_construction(
                "function",
                format!(
                    "argument {position} has type {:?}[{}], expected {:?}[{}]",
                    arg.dtype(),
                    arg.ndim(),
                    var.ty().dtype,
                    var.ty().ndim
                ),
            ));
        }
        env.insert(var.id(), arg.clone());
    }
    Ok(env)
}

pub(crate) fn lookup(env: &HashMap<VariableId, Value>, var: &Variable) -> Result<Value, LanError> {
    if let Origin::Constant(value) = var.origin() {
        return Ok(value.clone());
    }
    env.get(&var.id())
        .cloned()
        .ok_or_else(|| LanError::InvalidGraph(format!("{var:?} has no value")))
}

/// Stores a node's computed outputs under their variable ids.
pub(crate) fn store(
    env: &mut HashMap<VariableId, Value>,
    node: &Apply,
    outputs: Vec<Option<Value>>,
) -> Result<(), LanError> {
    if outputs.len() != node.num_outputs() {
        return Err(LanError::InvalidGraph(format!(
            "`{}` produced {} outputs, expected {}",
            node.op().name(),
            outputs.len(),
            node.num_outputs()
        )));
    }
    for (index, (id, value)) in node.output_ids().iter().zip(outputs).enumerate() {
        let value = value.ok_or_else(|| {
            LanError::InvalidGraph(format!(
                "`{}` left output {index} unset",
                node.op().name()
            ))
        })?;
        env.insert(*id, value);
    }
    Ok(())
}

/// A compiled symbolic graph from `inputs` to `outputs`.
#[derive(Debug)]
pub struct Function {
    inputs: Vec<Variable>,
    outputs: Vec<Variable>,
    nodes: Vec<Arc<Apply>>,
}

impl Function {
    /// Orders the graph and checks that every free input is listed.
    pub fn new(inputs: Vec<Variable>, outputs: Vec<Variable>) -> Result<Self, LanError> {
        let nodes = toposort(&outputs);
        check_bound(&inputs, &outputs, &nodes)?;
        Ok(Self {
            inputs,
            outputs,
            nodes,
        })
    }

    /// Evaluates the outputs for `args`, one per input.
    pub fn call(&self, args: &[Value]) -> Result<Vec<Value>, LanError> {
        let mut env = bind(&self.inputs, args)?;
        for node in &self.nodes {
            let values = node
                .inputs()
                .iter()
                .map(|v| lookup(&env, v))
                .collect::<Result<Vec<_>, _>>()?;
            let mut outputs = vec![None; node.num_outputs()];
            node.op().perform(node, &values, &mut outputs)?;
            store(&mut env, node, outputs)?;
        }
        self.outputs.iter().map(|v| lookup(&env, v)).collect()
    }

    pub fn inputs(&self) -> &[Variable] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Variable] {
        &self.outputs
    }

    /// Nodes in evaluation order.
    pub fn nodes(&self) -> &[Arc<Apply>] {
        &self.nodes
    }
}
