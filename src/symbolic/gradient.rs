//! Reverse-mode symbolic differentiation.

use std::collections::{HashMap, HashSet};

use crate::errors::LanError;

use super::basic::{add, fill_like};
use super::function::toposort;
use super::op::InputGrad;
use super::value::Value;
use super::variable::{Variable, VariableId};

/// Builds the gradient of scalar `cost` with respect to each of `wrt`.
///
/// Only inputs connected to some `wrt` variable are differentiated, so an op
/// whose gradient is unavailable on an unrelated input (for example observed
/// data) does not block the result. A `wrt` variable the cost does not depend
/// on gets a zero gradient.
pub fn grad(cost: &Variable, wrt: &[Variable]) -> Result<Vec<Variable>, LanError> {
    if cost.ty().ndim != 0 {
        return Err(LanError::InvalidGraph(format!(
            "gradient cost must be a scalar, got rank {}",
            cost.ty().ndim
        )));
    }

    let nodes = toposort(std::slice::from_ref(cost));

    // Forward sweep: which variables depend on some `wrt`.
    let mut connected: HashSet<VariableId> = wrt.iter().map(|v| v.id()).collect();
    for node in &nodes {
        if node.inputs().iter().any(|v| connected.contains(&v.id())) {
            connected.extend(node.output_ids().iter().copied());
        }
    }

    let mut grads: HashMap<VariableId, Variable> = HashMap::new();
    grads.insert(
        cost.id(),
        Variable::constant(Value::scalar(1.0).cast(cost.ty().dtype)?),
    );

    for node in nodes.iter().rev() {
        if !node.inputs().iter().any(|v| connected.contains(&v.id())) {
            continue;
        }
        let outputs = node.outputs();
        if !outputs.iter().any(|v| grads.contains_key(&v.id())) {
            continue;
        }
        let output_grads = outputs
            .iter()
            .map(|v| match grads.get(&v.id()) {
                Some(g) => Ok(g.clone()),
                None => fill_like(v, 0.0),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let input_grads = node.op().grad(node.inputs(), &output_grads)?;
        if input_grads.len() != node.inputs().len() {
            return Err(LanError::InvalidGraph(format!(
                "`{}` returned {} input gradients for {} inputs",
                node.op().name(),
                input_grads.len(),
                node.inputs().len()
            )));
        }

        for (index, (input, input_grad)) in node.inputs().iter().zip(input_grads).enumerate() {
            if !connected.contains(&input.id()) {
                continue;
            }
            match input_grad {
                InputGrad::Grad(g) => {
                    let total = match grads.remove(&input.id()) {
                        Some(existing) => add(&existing, &g)?,
                        None => g,
                    };
                    grads.insert(input.id(), total);
                }
                InputGrad::Disconnected => {}
                InputGrad::NotImplemented => {
                    return Err(LanError::GradientNotImplemented {
                        op: node.op().name().to_string(),
                        input: index,
                    });
                }
            }
        }
    }

    wrt.iter()
        .map(|v| match grads.get(&v.id()) {
            Some(g) => Ok(g.clone()),
            None => fill_like(v, 0.0),
        })
        .collect()
}
