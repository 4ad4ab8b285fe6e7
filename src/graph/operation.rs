//! Operators for the interchange graph.
//!
//! Uses a simple enum instead of trait objects for clarity. Every node is
//! parsed into an [`Operation`] before anything executes, so an unsupported
//! operator is reported before any tensor work happens.

use burn::tensor::{Tensor, backend::Backend};

use crate::errors::LanError;
use crate::layers::{Activation, Dense, GemmAttributes};

use super::core::{Attribute, InterchangeGraph, Initializer, Node};

/// Elementwise binary arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// The kind of computation a node performs.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// `alpha * A' * B' + beta * C`.
    Gemm(GemmAttributes),
    /// Plain matrix product.
    MatMul,
    /// Elementwise arithmetic with row/column broadcasting.
    Binary(BinaryOp),
    /// Elementwise nonlinearity.
    Activation(Activation),
    Identity,
    /// Collapse to rank 2 around `axis`.
    Flatten { axis: i64 },
    /// Rank-2 reshape; `0` copies a dim, `-1` infers it.
    Reshape { shape: [i64; 2] },
    /// A constant tensor held in the node itself.
    Constant(Initializer),
}

impl OpKind {
    /// Accepted number of data inputs, inclusive.
    fn arity(&self) -> (usize, usize) {
        match self {
            OpKind::Gemm(_) => (2, 3),
            OpKind::MatMul | OpKind::Binary(_) => (2, 2),
            OpKind::Activation(_) | OpKind::Identity | OpKind::Flatten { .. } => (1, 1),
            // The shape operand is folded into the kind at parse time.
            OpKind::Reshape { .. } => (1, 1),
            OpKind::Constant(_) => (0, 0),
        }
    }
}

/// A parsed, executable node.
#[derive(Debug, Clone)]
pub struct Operation {
    node: String,
    kind: OpKind,
    inputs: Vec<String>,
    output: String,
}

impl Operation {
    /// Parses a node of `graph` into an operation.
    pub fn parse(node: &Node, graph: &InterchangeGraph) -> Result<Self, LanError> {
        let mut inputs: Vec<String> = node
            .inputs()
            .iter()
            .filter(|name| !name.is_empty())
            .cloned()
            .collect();

        let kind = match node.op_type() {
            "Gemm" => OpKind::Gemm(GemmAttributes {
                alpha: node.float_attribute("alpha", 1.0),
                beta: node.float_attribute("beta", 1.0),
                trans_a: node.int_attribute("transA", 0) != 0,
                trans_b: node.int_attribute("transB", 0) != 0,
            }),
            "MatMul" => OpKind::MatMul,
            "Add" => OpKind::Binary(BinaryOp::Add),
            "Sub" => OpKind::Binary(BinaryOp::Sub),
            "Mul" => OpKind::Binary(BinaryOp::Mul),
            "Div" => OpKind::Binary(BinaryOp::Div),
            "Identity" => OpKind::Identity,
            "Flatten" => OpKind::Flatten {
                axis: node.int_attribute("axis", 1),
            },
            "Reshape" => {
                if inputs.len() != 2 {
                    return Err(arity_error(node, 2, 2, inputs.len()));
                }
                let shape = reshape_target(node, graph, &inputs[1])?;
                inputs.truncate(1);
                OpKind::Reshape { shape }
            }
            "Constant" => OpKind::Constant(constant_value(node)?),
            other => match Activation::from_op_type(other) {
                Some(activation) => OpKind::Activation(activation),
                None => {
                    return Err(LanError::UnsupportedOperator {
                        node: node.name().to_string(),
                        op_type: other.to_string(),
                    });
                }
            },
        };

        let (min, max) = kind.arity();
        if inputs.len() < min || inputs.len() > max {
            return Err(arity_error(node, min, max, inputs.len()));
        }

        let output = node
            .outputs()
            .first()
            .cloned()
            .ok_or_else(|| LanError::InvalidGraph(format!("node `{}` has no output", node.name())))?;

        Ok(Self {
            node: node.name().to_string(),
            kind,
            inputs,
            output,
        })
    }

    /// Name of the node this operation was parsed from.
    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    /// Names of the values consumed, in operand order.
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    /// Name of the value produced.
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Evaluates the operation on already-computed operands, one per name in
    /// [`inputs`](Self::inputs).
    pub fn eval<B: Backend>(
        &self,
        inputs: &[Tensor<B, 2>],
        device: &B::Device,
    ) -> Result<Tensor<B, 2>, LanError> {
        if inputs.len() != self.inputs.len() {
            return Err(LanError::InvalidGraph(format!(
                "node `{}` takes {} operands, got {}",
                self.node,
                self.inputs.len(),
                inputs.len()
            )));
        }
        match &self.kind {
            OpKind::Gemm(attrs) => {
                let bias = inputs.get(2).cloned();
                Dense::from_gemm(inputs[1].clone(), bias, attrs).forward(inputs[0].clone())
            }
            OpKind::MatMul => {
                let [_, inner] = inputs[0].dims();
                let [rows, _] = inputs[1].dims();
                if inner != rows {
                    return Err(LanError::ShapeMismatch {
                        expected: inner,
                        actual: rows,
                    });
                }
                Ok(inputs[0].clone().matmul(inputs[1].clone()))
            }
            OpKind::Binary(op) => {
                let lhs = inputs[0].clone();
                let rhs = inputs[1].clone();
                check_broadcast(lhs.dims(), rhs.dims())?;
                Ok(match op {
                    BinaryOp::Add => lhs.add(rhs),
                    BinaryOp::Sub => lhs.sub(rhs),
                    BinaryOp::Mul => lhs.mul(rhs),
                    BinaryOp::Div => lhs.div(rhs),
                })
            }
            OpKind::Activation(activation) => Ok(activation.apply(inputs[0].clone())),
            OpKind::Identity => Ok(inputs[0].clone()),
            OpKind::Flatten { axis } => {
                let [rows, cols] = inputs[0].dims();
                let axis = if *axis < 0 { axis + 2 } else { *axis };
                let shape = match axis {
                    0 => [1, rows * cols],
                    1 => [rows, cols],
                    2 => [rows * cols, 1],
                    _ => {
                        return Err(LanError::InvalidGraph(format!(
                            "node `{}`: Flatten axis out of range for rank 2",
                            self.node
                        )));
                    }
                };
                Ok(inputs[0].clone().reshape(shape))
            }
            OpKind::Reshape { shape } => {
                let dims = inputs[0].dims();
                let target = resolve_shape(&self.node, dims, *shape)?;
                Ok(inputs[0].clone().reshape(target))
            }
            OpKind::Constant(value) => value.to_tensor(device),
        }
    }
}

fn arity_error(node: &Node, min: usize, max: usize, actual: usize) -> LanError {
    let expected = if min == max {
        min.to_string()
    } else {
        format!("{min} to {max}")
    };
    LanError::InvalidGraph(format!(
        "node `{}` ({}) takes {expected} inputs, got {actual}",
        node.name(),
        node.op_type()
    ))
}

fn reshape_target(node: &Node, graph: &InterchangeGraph, name: &str) -> Result<[i64; 2], LanError> {
    let Some(shape) = graph.initializer(name) else {
        return Err(LanError::InvalidGraph(format!(
            "node `{}`: Reshape shape `{name}` must be an initializer",
            node.name()
        )));
    };
    match shape.data() {
        [rows, cols] => Ok([*rows as i64, *cols as i64]),
        other => Err(LanError::InvalidGraph(format!(
            "node `{}`: only rank-2 Reshape is supported, got {} dims",
            node.name(),
            other.len()
        ))),
    }
}

fn constant_value(node: &Node) -> Result<Initializer, LanError> {
    let name = node.outputs().first().cloned().unwrap_or_default();
    match node.attribute("value") {
        Some(Attribute::Tensor(t)) => Ok(t.clone()),
        _ => match (node.attribute("value_float"), node.attribute("value_floats")) {
            (Some(Attribute::Float(f)), _) => Initializer::new(name, vec![], vec![*f]),
            (_, Some(Attribute::Floats(fs))) => Initializer::new(name, vec![fs.len()], fs.clone()),
            _ => Err(LanError::InvalidGraph(format!(
                "node `{}`: Constant without a tensor value",
                node.name()
            ))),
        },
    }
}

fn check_broadcast(lhs: [usize; 2], rhs: [usize; 2]) -> Result<(), LanError> {
    for (l, r) in lhs.into_iter().zip(rhs) {
        if l != r && l != 1 && r != 1 {
            return Err(LanError::ShapeMismatch {
                expected: l,
                actual: r,
            });
        }
    }
    Ok(())
}

fn resolve_shape(node: &str, dims: [usize; 2], shape: [i64; 2]) -> Result<[usize; 2], LanError> {
    let total = dims[0] * dims[1];
    let mut target = [0usize; 2];
    let mut inferred = None;
    for (i, &s) in shape.iter().enumerate() {
        target[i] = match s {
            0 => dims[i],
            -1 if inferred.is_none() => {
                inferred = Some(i);
                1
            }
            s if s > 0 => s as usize,
            _ => {
                return Err(LanError::InvalidGraph(format!(
                    "node `{node}`: invalid Reshape target {shape:?}"
                )));
            }
        };
    }
    if let Some(i) = inferred {
        let known: usize = target.iter().product();
        if known == 0 || total % known != 0 {
            return Err(LanError::ShapeMismatch {
                expected: total,
                actual: known,
            });
        }
        target[i] = total / known;
    }
    let product = target[0] * target[1];
    if product != total {
        return Err(LanError::ShapeMismatch {
            expected: total,
            actual: product,
        });
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f64>;

    fn s(v: &str) -> String {
        v.to_string()
    }

    fn graph_with(nodes: Vec<Node>, initializers: Vec<Initializer>, output: &str) -> InterchangeGraph {
        InterchangeGraph::new("test", "x", None, nodes, initializers, output).unwrap()
    }

    fn eval_single(node: Node, initializers: Vec<Initializer>, input: [[f64; 2]; 2]) -> Vec<f64> {
        let output = node.outputs()[0].clone();
        let graph = graph_with(vec![node.clone()], initializers, &output);
        let op = Operation::parse(&node, &graph).unwrap();
        let device = Default::default();
        let mut operands = vec![Tensor::<TestBackend, 2>::from_floats(input, &device)];
        for name in &op.inputs()[1..] {
            operands.push(graph.initializer(name).unwrap().to_tensor(&device).unwrap());
        }
        op.eval(&operands, &device).unwrap().to_data().to_vec().unwrap()
    }

    #[test]
    fn test_eval_checks_operand_count() {
        let node = Node::new("add", "Add", vec![s("x"), s("b")], vec![s("y")]);
        let b = Initializer::new("b", vec![2], vec![1.0, 2.0]).unwrap();
        let graph = graph_with(vec![node.clone()], vec![b], "y");
        let op = Operation::parse(&node, &graph).unwrap();
        let device = Default::default();
        let x = Tensor::<TestBackend, 2>::from_floats([[1.0, 1.0]], &device);

        let err = op.eval(&[x.clone()], &device).unwrap_err();
        assert!(matches!(err, LanError::InvalidGraph(ref msg) if msg.contains("2 operands, got 1")));
        let err = op.eval(&[x.clone(), x.clone(), x], &device).unwrap_err();
        assert!(matches!(err, LanError::InvalidGraph(_)));
        assert!(op.eval::<TestBackend>(&[], &device).is_err());
    }

    #[test]
    fn test_unsupported_operator_names_node() {
        let node = Node::new("conv_1", "Conv", vec![s("x")], vec![s("y")]);
        let graph = graph_with(vec![node.clone()], vec![], "y");
        let err = Operation::parse(&node, &graph).unwrap_err();
        assert!(matches!(
            err,
            LanError::UnsupportedOperator { ref node, ref op_type } if node == "conv_1" && op_type == "Conv"
        ));
    }

    #[test]
    fn test_wrong_arity_is_invalid_graph() {
        let node = Node::new("act", "Tanh", vec![s("x"), s("x")], vec![s("y")]);
        let graph = graph_with(vec![node.clone()], vec![], "y");
        assert!(matches!(
            Operation::parse(&node, &graph),
            Err(LanError::InvalidGraph(_))
        ));
    }

    #[test]
    fn test_gemm_attributes_parsed() {
        let w = Initializer::new("w", vec![1, 2], vec![1.0, 1.0]).unwrap();
        let node = Node::new("fc", "Gemm", vec![s("x"), s("w"), s("")], vec![s("y")])
            .with_attribute("transB", Attribute::Int(1))
            .with_attribute("alpha", Attribute::Float(0.5));
        let graph = graph_with(vec![node.clone()], vec![w], "y");
        let op = Operation::parse(&node, &graph).unwrap();
        assert_eq!(op.inputs(), &[s("x"), s("w")]);
        assert_eq!(
            op.kind(),
            &OpKind::Gemm(GemmAttributes {
                alpha: 0.5,
                beta: 1.0,
                trans_a: false,
                trans_b: true,
            })
        );
    }

    #[test]
    fn test_binary_broadcasts_row_vector() {
        let b = Initializer::new("b", vec![2], vec![10.0, 20.0]).unwrap();
        let node = Node::new("add", "Add", vec![s("x"), s("b")], vec![s("y")]);
        let result = eval_single(node, vec![b], [[1.0, 2.0], [3.0, 4.0]]);
        assert_eq!(result, vec![11.0, 22.0, 13.0, 24.0]);
    }

    #[test]
    fn test_reshape_infers_dimension() {
        let shape = Initializer::new("shape", vec![2], vec![-1.0, 1.0]).unwrap();
        let node = Node::new("r", "Reshape", vec![s("x"), s("shape")], vec![s("y")]);
        let graph = graph_with(vec![node.clone()], vec![shape], "y");
        let op = Operation::parse(&node, &graph).unwrap();
        assert_eq!(op.kind(), &OpKind::Reshape { shape: [-1, 1] });

        let device = Default::default();
        let input = Tensor::<TestBackend, 2>::from_floats([[1.0, 2.0], [3.0, 4.0]], &device);
        let output = op.eval(&[input], &device).unwrap();
        assert_eq!(output.dims(), [4, 1]);
    }

    #[test]
    fn test_reshape_rejects_bad_size() {
        assert!(matches!(
            resolve_shape("r", [2, 3], [4, 0]),
            Err(LanError::ShapeMismatch { expected: 6, .. })
        ));
    }

    #[test]
    fn test_matmul_shape_check() {
        let w = Initializer::new("w", vec![3, 1], vec![1.0, 1.0, 1.0]).unwrap();
        let node = Node::new("mm", "MatMul", vec![s("x"), s("w")], vec![s("y")]);
        let graph = graph_with(vec![node.clone()], vec![w], "y");
        let op = Operation::parse(&node, &graph).unwrap();

        let device = Default::default();
        let input = Tensor::<TestBackend, 2>::zeros([4, 2], &device);
        let weight = graph.initializer("w").unwrap().to_tensor(&device).unwrap();
        assert!(matches!(
            op.eval(&[input, weight], &device),
            Err(LanError::ShapeMismatch { expected: 2, actual: 3 })
        ));
    }

    #[test]
    fn test_constant_value_float() {
        let node = Node::new("c", "Constant", vec![], vec![s("k")])
            .with_attribute("value_float", Attribute::Float(2.5));
        let graph = graph_with(vec![node.clone()], vec![], "k");
        let op = Operation::parse(&node, &graph).unwrap();
        let device = Default::default();
        let value: Vec<f64> = op
            .eval::<TestBackend>(&[], &device)
            .unwrap()
            .to_data()
            .to_vec()
            .unwrap();
        assert_eq!(value, vec![2.5]);
    }
}
