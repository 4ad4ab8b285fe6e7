//! CompiledGraph - an interchange graph lowered once into a step plan.
//!
//! Lowering parses every node, assigns each named value a dense slot, uploads
//! all weights to the device, and folds `Gemm` nodes with constant operands
//! into ready-made [`Dense`] layers. An activation that is the sole consumer
//! of such a `Gemm` is fused into the layer. `forward` then only moves tensors
//! between slots.

use std::collections::HashMap;

use burn::tensor::{Tensor, backend::Backend};

use crate::errors::LanError;
use crate::layers::{Activation, Dense};

use super::core::{GraphId, InterchangeGraph};
use super::interpret::parse_operations;
use super::operation::{OpKind, Operation};

/// Index into the slot table.
type Slot = usize;

/// Execution step in the forward pass.
#[derive(Debug, Clone)]
enum Step {
    /// A `Gemm` whose weight and bias were resolved at lowering time, plus
    /// any activation fused into it.
    Dense {
        layer: usize,
        input: Slot,
        output: Slot,
    },
    /// Any other operation, evaluated on its operand slots.
    Op {
        operation: usize,
        inputs: Vec<Slot>,
        output: Slot,
    },
}

/// An interchange graph prepared for repeated evaluation on one device.
#[derive(Debug)]
pub struct CompiledGraph<B: Backend> {
    graph_id: GraphId,
    input_slot: Slot,
    output_slot: Slot,
    slot_count: usize,
    input_width: Option<usize>,
    constants: Vec<(Slot, Tensor<B, 2>)>,
    dense_layers: Vec<Dense<B>>,
    operations: Vec<Operation>,
    steps: Vec<Step>,
    device: B::Device,
}

impl<B: Backend> CompiledGraph<B> {
    /// Lowers `graph` for execution on `device`.
    pub fn new(graph: &InterchangeGraph, device: &B::Device) -> Result<Self, LanError> {
        let operations = parse_operations(graph)?;

        let mut builder = PlanBuilder::new();
        let input_slot = builder.slot(graph.input());

        let mut constants: HashMap<Slot, Tensor<B, 2>> = HashMap::new();
        for init in graph.initializers() {
            constants.insert(builder.slot(init.name()), init.to_tensor(device)?);
        }

        let fusions = activation_fusions(&operations, graph.output());
        let mut fused = vec![false; operations.len()];
        let mut dense_layers = Vec::new();
        let mut kept = Vec::new();
        let mut steps = Vec::new();

        for (index, op) in operations.iter().enumerate() {
            if fused[index] {
                continue;
            }
            let output = builder.slot(op.output());
            let inputs: Vec<Slot> = op.inputs().iter().map(|name| builder.slot(name)).collect();

            let folded_gemm = match op.kind() {
                OpKind::Gemm(attrs) if inputs[1..].iter().all(|s| constants.contains_key(s)) => {
                    Some(*attrs)
                }
                _ => None,
            };

            if let Some(attrs) = folded_gemm {
                let weight = constants[&inputs[1]].clone();
                let bias = inputs.get(2).map(|s| constants[s].clone());
                let mut layer = Dense::from_gemm(weight, bias, &attrs);
                let mut output = output;
                if let Some(&(activation_index, activation)) = fusions.get(&index) {
                    fused[activation_index] = true;
                    layer = layer.with_activation(activation);
                    output = builder.slot(operations[activation_index].output());
                }
                dense_layers.push(layer);
                steps.push(Step::Dense {
                    layer: dense_layers.len() - 1,
                    input: inputs[0],
                    output,
                });
            } else if matches!(op.kind(), OpKind::Constant(_)) {
                constants.insert(output, op.eval::<B>(&[], device)?);
            } else {
                kept.push(op.clone());
                steps.push(Step::Op {
                    operation: kept.len() - 1,
                    inputs,
                    output,
                });
            }
        }

        let output_slot = builder.slot(graph.output());
        log::debug!(
            "Compiled graph `{}`: {} steps, {} dense layers, {} constants",
            graph.name(),
            steps.len(),
            dense_layers.len(),
            constants.len()
        );

        Ok(Self {
            graph_id: graph.id(),
            input_slot,
            output_slot,
            slot_count: builder.next_slot,
            input_width: graph.input_width(),
            constants: constants.into_iter().collect(),
            dense_layers,
            operations: kept,
            steps,
            device: device.clone(),
        })
    }

    /// Performs forward pass through the plan.
    pub fn forward(&self, input: Tensor<B, 2>) -> Result<Tensor<B, 2>, LanError> {
        let cols = input.dims()[1];
        if let Some(width) = self.input_width {
            if width != cols {
                return Err(LanError::ShapeMismatch {
                    expected: width,
                    actual: cols,
                });
            }
        }

        let mut slots: Vec<Option<Tensor<B, 2>>> = vec![None; self.slot_count];
        for (slot, tensor) in &self.constants {
            slots[*slot] = Some(tensor.clone());
        }
        slots[self.input_slot] = Some(input);

        for step in &self.steps {
            match step {
                Step::Dense {
                    layer,
                    input,
                    output,
                } => {
                    let value = read(&slots, *input)?;
                    slots[*output] = Some(self.dense_layers[*layer].forward(value)?);
                }
                Step::Op {
                    operation,
                    inputs,
                    output,
                } => {
                    let operands = inputs
                        .iter()
                        .map(|slot| read(&slots, *slot))
                        .collect::<Result<Vec<_>, _>>()?;
                    let value = self.operations[*operation].eval(&operands, &self.device)?;
                    slots[*output] = Some(value);
                }
            }
        }

        slots[self.output_slot]
            .take()
            .ok_or_else(|| LanError::InvalidGraph("graph output was not produced".to_string()))
    }

    /// ID of the graph this plan was lowered from.
    pub fn graph_id(&self) -> GraphId {
        self.graph_id
    }

    /// Number of steps executed per forward pass.
    pub fn num_steps(&self) -> usize {
        self.steps.len()
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }
}

/// Maps each `Gemm` to the activation node that alone consumes its output.
///
/// The graph output itself is never fused away.
fn activation_fusions(operations: &[Operation], graph_output: &str) -> HashMap<usize, (usize, Activation)> {
    let mut consumers: HashMap<&str, Vec<usize>> = HashMap::new();
    for (index, op) in operations.iter().enumerate() {
        for input in op.inputs() {
            consumers.entry(input.as_str()).or_default().push(index);
        }
    }

    let mut fusions = HashMap::new();
    for (index, op) in operations.iter().enumerate() {
        if !matches!(op.kind(), OpKind::Gemm(_)) || op.output() == graph_output {
            continue;
        }
        if let Some([consumer]) = consumers.get(op.output()).map(Vec::as_slice) {
            if let OpKind::Activation(activation) = operations[*consumer].kind() {
                fusions.insert(index, (*consumer, *activation));
            }
        }
    }
    fusions
}

fn read<B: Backend>(slots: &[Option<Tensor<B, 2>>], slot: Slot) -> Result<Tensor<B, 2>, LanError> {
    slots[slot]
        .clone()
        .ok_or_else(|| LanError::InvalidGraph(format!("slot {slot} read before it was written")))
}

/// Builder for the slot table.
struct PlanBuilder {
    slot_index: HashMap<String, Slot>,
    next_slot: usize,
}

impl PlanBuilder {
    fn new() -> Self {
        Self {
            slot_index: HashMap::new(),
            next_slot: 0,
        }
    }

    fn slot(&mut self, name: &str) -> Slot {
        if let Some(&slot) = self.slot_index.get(name) {
            return slot;
        }
        let slot = self.next_slot;
        self.slot_index.insert(name.to_string(), slot);
        self.next_slot += 1;
        slot
    }
}
