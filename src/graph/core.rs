//! InterchangeGraph - the immutable description of a trained network.
//!
//! A graph is an ordered list of [`Node`]s connected by named values, plus
//! the named weight tensors ([`Initializer`]s) they read. It is loaded once
//! and shared read-only (behind an `Arc`) by every likelihood function built
//! from it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use burn::tensor::{Tensor, backend::Backend};

use super::proto::{
    AttributeProto, Bytes, DATA_TYPE_DOUBLE, DATA_TYPE_FLOAT, DATA_TYPE_INT64, DimensionProto, GraphProto,
    Int64, ModelProto, NodeProto, TensorProto, TensorShapeProto, TensorTypeProto, TypeProto,
    ValueInfoProto,
};
use super::wire;
use crate::errors::LanError;

/// Global counter for unique graph IDs.
static GRAPH_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Unique identifier for an InterchangeGraph.
pub type GraphId = usize;

fn next_graph_id() -> GraphId {
    GRAPH_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// A named, dense weight tensor stored row-major as `f64`.
#[derive(Debug, Clone, PartialEq)]
pub struct Initializer {
    name: String,
    dims: Vec<usize>,
    data: Vec<f64>,
}

impl Initializer {
    /// Creates an initializer, checking that `data` fills `dims` exactly.
    pub fn new(name: impl Into<String>, dims: Vec<usize>, data: Vec<f64>) -> Result<Self, LanError> {
        let name = name.into();
        let expected: usize = dims.iter().product();
        if expected != data.len() {
            return Err(LanError::InvalidGraph(format!(
                "initializer `{name}` has dims {dims:?} but {} values",
                data.len()
            )));
        }
        Ok(Self { name, dims, data })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Returns the tensor as a rank-2 `[rows, cols]` shape.
    ///
    /// Scalars become `[1, 1]` and vectors `[1, n]` so they broadcast across
    /// the batch dimension.
    pub fn matrix_shape(&self) -> Result<[usize; 2], LanError> {
        match self.dims.as_slice() {
            [] => Ok([1, 1]),
            [n] => Ok([1, *n]),
            [rows, cols] => Ok([*rows, *cols]),
            dims => Err(LanError::InvalidGraph(format!(
                "initializer `{}` has rank {}; only rank <= 2 is supported",
                self.name,
                dims.len()
            ))),
        }
    }

    /// Materializes the initializer on `device` as a rank-2 tensor.
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Result<Tensor<B, 2>, LanError> {
        let shape = self.matrix_shape()?;
        Ok(Tensor::<B, 1>::from_floats(self.data.as_slice(), device).reshape(shape))
    }

    fn from_proto(proto: &TensorProto) -> Result<Self, String> {
        let dims = proto
            .dims
            .iter()
            .map(|d| usize::try_from(d.0).map_err(|_| format!("negative dim {}", d.0)))
            .collect::<Result<Vec<_>, _>>()?;

        let data: Vec<f64> = if let Some(raw) = &proto.raw_data {
            decode_raw(&raw.0, proto.data_type)
                .ok_or_else(|| format!("tensor `{}`: unsupported dataType {}", proto.name, proto.data_type))?
        } else {
            match proto.data_type {
                DATA_TYPE_FLOAT => proto.float_data.iter().map(|&v| v as f64).collect(),
                DATA_TYPE_DOUBLE => proto.double_data.clone(),
                DATA_TYPE_INT64 => proto.int64_data.iter().map(|v| v.0 as f64).collect(),
                other => return Err(format!("tensor `{}`: unsupported dataType {other}", proto.name)),
            }
        };

        Self::new(proto.name.clone(), dims, data).map_err(|e| e.to_string())
    }

    fn to_proto(&self) -> TensorProto {
        TensorProto {
            name: self.name.clone(),
            dims: self.dims.iter().map(|&d| Int64(d as i64)).collect(),
            data_type: DATA_TYPE_DOUBLE,
            double_data: self.data.clone(),
            ..TensorProto::default()
        }
    }
}

fn decode_raw(bytes: &[u8], data_type: i32) -> Option<Vec<f64>> {
    match data_type {
        DATA_TYPE_FLOAT => Some(
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
                .collect(),
        ),
        DATA_TYPE_DOUBLE => Some(
            bytes
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        ),
        DATA_TYPE_INT64 => Some(
            bytes
                .chunks_exact(8)
                .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f64)
                .collect(),
        ),
        _ => None,
    }
}

/// A node attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Float(f64),
    Int(i64),
    String(String),
    Tensor(Initializer),
    Floats(Vec<f64>),
    Ints(Vec<i64>),
}

impl Attribute {
    fn from_proto(proto: &AttributeProto) -> Result<Option<Self>, String> {
        let floats = || proto.floats.iter().map(|&f| f as f64).collect::<Vec<_>>();
        let ints = || proto.ints.iter().map(|i| i.0).collect::<Vec<_>>();
        let string = |s: &Bytes| String::from_utf8_lossy(&s.0).into_owned();

        // JSON printers omit zero values, so the type tag decides first.
        match proto.attr_type.as_deref() {
            Some("FLOAT") => return Ok(Some(Attribute::Float(proto.f.unwrap_or(0.0) as f64))),
            Some("INT") => return Ok(Some(Attribute::Int(proto.i.map_or(0, |i| i.0)))),
            Some("STRING") => {
                return Ok(Some(Attribute::String(proto.s.as_ref().map(string).unwrap_or_default())));
            }
            Some("FLOATS") => return Ok(Some(Attribute::Floats(floats()))),
            Some("INTS") => return Ok(Some(Attribute::Ints(ints()))),
            _ => {}
        }

        if let Some(t) = &proto.t {
            return Initializer::from_proto(t).map(|t| Some(Attribute::Tensor(t)));
        }
        if let Some(f) = proto.f {
            return Ok(Some(Attribute::Float(f as f64)));
        }
        if let Some(i) = proto.i {
            return Ok(Some(Attribute::Int(i.0)));
        }
        if let Some(s) = &proto.s {
            return Ok(Some(Attribute::String(string(s))));
        }
        if !proto.floats.is_empty() {
            return Ok(Some(Attribute::Floats(floats())));
        }
        if !proto.ints.is_empty() {
            return Ok(Some(Attribute::Ints(ints())));
        }
        Ok(None)
    }

    fn to_proto(&self, name: &str) -> AttributeProto {
        let mut proto = AttributeProto {
            name: name.to_string(),
            ..AttributeProto::default()
        };
        match self {
            Attribute::Float(f) => {
                proto.attr_type = Some("FLOAT".to_string());
                proto.f = Some(*f as f32);
            }
            Attribute::Int(i) => {
                proto.attr_type = Some("INT".to_string());
                proto.i = Some(Int64(*i));
            }
            Attribute::String(s) => {
                proto.attr_type = Some("STRING".to_string());
                proto.s = Some(Bytes(s.clone().into_bytes()));
            }
            Attribute::Tensor(t) => {
                proto.attr_type = Some("TENSOR".to_string());
                proto.t = Some(t.to_proto());
            }
            Attribute::Floats(fs) => {
                proto.attr_type = Some("FLOATS".to_string());
                proto.floats = fs.iter().map(|&f| f as f32).collect();
            }
            Attribute::Ints(is) => {
                proto.attr_type = Some("INTS".to_string());
                proto.ints = is.iter().map(|&i| Int64(i)).collect();
            }
        }
        proto
    }
}

/// One operator application in the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    name: String,
    op_type: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    attributes: BTreeMap<String, Attribute>,
}

impl Node {
    pub fn new(
        name: impl Into<String>,
        op_type: impl Into<String>,
        inputs: Vec<String>,
        outputs: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            op_type: op_type.into(),
            inputs,
            outputs,
            attributes: BTreeMap::new(),
        }
    }

    /// Adds an attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, value: Attribute) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    /// Names of the values this node consumes. Empty names mark omitted
    /// optional inputs.
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    /// Integer attribute, or `default` when absent.
    pub fn int_attribute(&self, name: &str, default: i64) -> i64 {
        match self.attributes.get(name) {
            Some(Attribute::Int(i)) => *i,
            _ => default,
        }
    }

    /// Float attribute, or `default` when absent.
    pub fn float_attribute(&self, name: &str, default: f64) -> f64 {
        match self.attributes.get(name) {
            Some(Attribute::Float(f)) => *f,
            Some(Attribute::Int(i)) => *i as f64,
            _ => default,
        }
    }
}

/// An immutable, validated feed-forward network description.
#[derive(Debug)]
pub struct InterchangeGraph {
    id: GraphId,
    name: String,
    nodes: Vec<Node>,
    initializers: Vec<Initializer>,
    initializer_index: HashMap<String, usize>,
    input: String,
    input_width: Option<usize>,
    output: String,
}

impl InterchangeGraph {
    /// Creates a graph, checking that it is a DAG in declaration order.
    ///
    /// Every node input must be the graph input, an initializer, or the
    /// output of an earlier node; no value may be defined twice; and the
    /// declared output must be defined.
    pub fn new(
        name: impl Into<String>,
        input: impl Into<String>,
        input_width: Option<usize>,
        nodes: Vec<Node>,
        initializers: Vec<Initializer>,
        output: impl Into<String>,
    ) -> Result<Self, LanError> {
        let input = input.into();
        let output = output.into();

        let mut defined: HashSet<&str> = HashSet::new();
        defined.insert(input.as_str());
        let mut initializer_index = HashMap::new();
        for (idx, init) in initializers.iter().enumerate() {
            if !defined.insert(init.name()) {
                return Err(LanError::InvalidGraph(format!(
                    "value `{}` is defined twice",
                    init.name()
                )));
            }
            initializer_index.insert(init.name().to_string(), idx);
        }

        for node in &nodes {
            if node.outputs().is_empty() {
                return Err(LanError::InvalidGraph(format!(
                    "node `{}` declares no outputs",
                    node.name()
                )));
            }
            for value in node.inputs().iter().filter(|v| !v.is_empty()) {
                if !defined.contains(value.as_str()) {
                    return Err(LanError::InvalidGraph(format!(
                        "node `{}` consumes undefined value `{value}`",
                        node.name()
                    )));
                }
            }
            for value in node.outputs() {
                if !defined.insert(value.as_str()) {
                    return Err(LanError::InvalidGraph(format!(
                        "value `{value}` is defined twice"
                    )));
                }
            }
        }

        if !defined.contains(output.as_str()) {
            return Err(LanError::InvalidGraph(format!(
                "graph output `{output}` is never produced"
            )));
        }

        Ok(Self {
            id: next_graph_id(),
            name: name.into(),
            nodes,
            initializers,
            initializer_index,
            input,
            input_width,
            output,
        })
    }

    /// Converts a parsed ONNX model into a validated graph.
    pub fn from_proto(model: ModelProto) -> Result<Self, LanError> {
        let graph = model.graph;

        let initializers = graph
            .initializer
            .iter()
            .map(Initializer::from_proto)
            .collect::<Result<Vec<_>, _>>()
            .map_err(LanError::InvalidGraph)?;
        let initializer_names: HashSet<&str> = initializers.iter().map(|i| i.name()).collect();

        // Older exporters also list initializers as graph inputs.
        let inputs: Vec<&ValueInfoProto> = graph
            .input
            .iter()
            .filter(|v| !initializer_names.contains(v.name.as_str()))
            .collect();
        let [input] = inputs.as_slice() else {
            return Err(LanError::InvalidGraph(format!(
                "expected exactly one graph input, found {}",
                inputs.len()
            )));
        };

        let Some(output) = graph.output.first() else {
            return Err(LanError::InvalidGraph("graph declares no outputs".to_string()));
        };
        if graph.output.len() > 1 {
            log::warn!(
                "Graph declares {} outputs; using the first (`{}`)",
                graph.output.len(),
                output.name
            );
        }

        let nodes = graph
            .node
            .iter()
            .enumerate()
            .map(|(idx, proto)| node_from_proto(idx, proto))
            .collect::<Result<Vec<_>, _>>()
            .map_err(LanError::InvalidGraph)?;

        Self::new(
            graph.name.unwrap_or_default(),
            input.name.clone(),
            input.last_dim(),
            nodes,
            initializers,
            output.name.clone(),
        )
    }

    /// Converts the graph back into the ONNX wire schema.
    pub fn to_proto(&self) -> ModelProto {
        let input_dims = vec![
            DimensionProto {
                dim_value: None,
                dim_param: Some("N".to_string()),
            },
            DimensionProto {
                dim_value: self.input_width.map(|w| Int64(w as i64)),
                dim_param: None,
            },
        ];
        let input = ValueInfoProto {
            name: self.input.clone(),
            value_type: Some(TypeProto {
                tensor_type: Some(TensorTypeProto {
                    elem_type: DATA_TYPE_DOUBLE,
                    shape: Some(TensorShapeProto { dim: input_dims }),
                }),
            }),
        };

        let node = self
            .nodes
            .iter()
            .map(|n| NodeProto {
                name: Some(n.name.clone()),
                op_type: n.op_type.clone(),
                input: n.inputs.clone(),
                output: n.outputs.clone(),
                attribute: n
                    .attributes
                    .iter()
                    .map(|(name, attr)| attr.to_proto(name))
                    .collect(),
            })
            .collect();

        ModelProto {
            ir_version: Some(Int64(8)),
            producer_name: Some("hssm-lan".to_string()),
            opset_import: Vec::new(),
            graph: GraphProto {
                name: Some(self.name.clone()),
                node,
                initializer: self.initializers.iter().map(Initializer::to_proto).collect(),
                input: vec![input],
                output: vec![ValueInfoProto {
                    name: self.output.clone(),
                    value_type: None,
                }],
            },
        }
    }

    /// Serializes the graph as ONNX protobuf-JSON.
    pub fn to_json(&self) -> Result<String, LanError> {
        Ok(serde_json::to_string_pretty(&self.to_proto())?)
    }

    /// Serializes the graph as a binary `.onnx` model.
    pub fn to_onnx(&self) -> Vec<u8> {
        wire::encode_model(&self.to_proto())
    }

    /// Returns the unique ID of this graph.
    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nodes in declaration (topological) order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn initializers(&self) -> &[Initializer] {
        &self.initializers
    }

    pub fn initializer(&self, name: &str) -> Option<&Initializer> {
        self.initializer_index.get(name).map(|&idx| &self.initializers[idx])
    }

    /// Name of the input matrix value.
    pub fn input(&self) -> &str {
        &self.input
    }

    /// Declared number of input columns, when the graph states it.
    pub fn input_width(&self) -> Option<usize> {
        self.input_width
    }

    /// Name of the value returned by the graph.
    pub fn output(&self) -> &str {
        &self.output
    }
}

fn node_from_proto(idx: usize, proto: &NodeProto) -> Result<Node, String> {
    let name = proto
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| format!("{}_{idx}", proto.op_type));

    let mut node = Node::new(name, proto.op_type.clone(), proto.input.clone(), proto.output.clone());
    for attr in &proto.attribute {
        if let Some(value) = Attribute::from_proto(attr)? {
            node = node.with_attribute(attr.name.clone(), value);
        }
    }
    Ok(node)
}
