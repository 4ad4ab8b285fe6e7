//! Direct execution of an interchange graph, node by node.

use std::collections::HashMap;

use burn::tensor::{Tensor, backend::Backend};

use crate::errors::LanError;

use super::core::InterchangeGraph;
use super::operation::Operation;

/// Parses every node of `graph`, failing on the first unsupported one.
pub(crate) fn parse_operations(graph: &InterchangeGraph) -> Result<Vec<Operation>, LanError> {
    graph
        .nodes()
        .iter()
        .map(|node| Operation::parse(node, graph))
        .collect()
}

pub(crate) fn check_input_width(graph: &InterchangeGraph, cols: usize) -> Result<(), LanError> {
    match graph.input_width() {
        Some(width) if width != cols => Err(LanError::ShapeMismatch {
            expected: width,
            actual: cols,
        }),
        _ => Ok(()),
    }
}

/// Evaluates `graph` on `input` and returns the graph output.
///
/// Weights are materialized on the input's device on every call. All nodes
/// are parsed before the first one runs.
pub fn interpret<B: Backend>(
    graph: &InterchangeGraph,
    input: Tensor<B, 2>,
) -> Result<Tensor<B, 2>, LanError> {
    let operations = parse_operations(graph)?;
    check_input_width(graph, input.dims()[1])?;

    let device = input.device();
    let mut env: HashMap<&str, Tensor<B, 2>> = HashMap::new();
    env.insert(graph.input(), input);
    for init in graph.initializers() {
        env.insert(init.name(), init.to_tensor(&device)?);
    }

    for op in &operations {
        let operands = op
            .inputs()
            .iter()
            .map(|name| {
                env.get(name.as_str()).cloned().ok_or_else(|| {
                    LanError::InvalidGraph(format!("value `{name}` is not available"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let value = op.eval(&operands, &device)?;
        env.insert(op.output(), value);
    }

    env.remove(graph.output())
        .ok_or_else(|| LanError::InvalidGraph(format!("output `{}` was not produced", graph.output())))
}
