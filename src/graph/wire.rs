//! Binary protobuf encoding of ONNX models.
//!
//! The messages carry the `onnx.proto` field numbers for the subset the loader
//! reads. Unknown fields (doc strings, metadata, sparse initializers) are
//! skipped by the decoder. Decoded models convert into the [`proto`] structs,
//! so both encodings share one path into [`InterchangeGraph`].
//!
//! [`InterchangeGraph`]: super::InterchangeGraph

use prost::Message;

use super::proto::{self, Bytes, Int64};

#[derive(Clone, PartialEq, Message)]
pub(crate) struct ModelProto {
    #[prost(int64, optional, tag = "1")]
    pub ir_version: Option<i64>,
    #[prost(string, optional, tag = "2")]
    pub producer_name: Option<String>,
    #[prost(message, optional, tag = "7")]
    pub graph: Option<GraphProto>,
    #[prost(message, repeated, tag = "8")]
    pub opset_import: Vec<OperatorSetIdProto>,
}

#[derive(Clone, PartialEq, Message)]
pub(crate) struct OperatorSetIdProto {
    #[prost(string, optional, tag = "1")]
    pub domain: Option<String>,
    #[prost(int64, optional, tag = "2")]
    pub version: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub(crate) struct GraphProto {
    #[prost(message, repeated, tag = "1")]
    pub node: Vec<NodeProto>,
    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,
    #[prost(message, repeated, tag = "5")]
    pub initializer: Vec<TensorProto>,
    #[prost(message, repeated, tag = "11")]
    pub input: Vec<ValueInfoProto>,
    #[prost(message, repeated, tag = "12")]
    pub output: Vec<ValueInfoProto>,
}

#[derive(Clone, PartialEq, Message)]
pub(crate) struct NodeProto {
    #[prost(string, repeated, tag = "1")]
    pub input: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub output: Vec<String>,
    #[prost(string, optional, tag = "3")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub op_type: Option<String>,
    #[prost(message, repeated, tag = "5")]
    pub attribute: Vec<AttributeProto>,
}

#[derive(Clone, PartialEq, Message)]
pub(crate) struct AttributeProto {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(float, optional, tag = "2")]
    pub f: Option<f32>,
    #[prost(int64, optional, tag = "3")]
    pub i: Option<i64>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub s: Option<Vec<u8>>,
    #[prost(message, optional, tag = "5")]
    pub t: Option<TensorProto>,
    #[prost(float, repeated, packed = "false", tag = "7")]
    pub floats: Vec<f32>,
    #[prost(int64, repeated, packed = "false", tag = "8")]
    pub ints: Vec<i64>,
    #[prost(int32, optional, tag = "20")]
    pub attr_type: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub(crate) struct TensorProto {
    #[prost(int64, repeated, packed = "false", tag = "1")]
    pub dims: Vec<i64>,
    #[prost(int32, optional, tag = "2")]
    pub data_type: Option<i32>,
    #[prost(float, repeated, tag = "4")]
    pub float_data: Vec<f32>,
    #[prost(int64, repeated, tag = "7")]
    pub int64_data: Vec<i64>,
    #[prost(string, optional, tag = "8")]
    pub name: Option<String>,
    #[prost(bytes = "vec", optional, tag = "9")]
    pub raw_data: Option<Vec<u8>>,
    #[prost(double, repeated, tag = "10")]
    pub double_data: Vec<f64>,
}

#[derive(Clone, PartialEq, Message)]
pub(crate) struct ValueInfoProto {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(message, optional, tag = "2")]
    pub value_type: Option<TypeProto>,
}

/// `TypeProto` with only the `tensor_type` member of its `value` oneof.
#[derive(Clone, PartialEq, Message)]
pub(crate) struct TypeProto {
    #[prost(message, optional, tag = "1")]
    pub tensor_type: Option<TensorTypeProto>,
}

#[derive(Clone, PartialEq, Message)]
pub(crate) struct TensorTypeProto {
    #[prost(int32, optional, tag = "1")]
    pub elem_type: Option<i32>,
    #[prost(message, optional, tag = "2")]
    pub shape: Option<TensorShapeProto>,
}

#[derive(Clone, PartialEq, Message)]
pub(crate) struct TensorShapeProto {
    #[prost(message, repeated, tag = "1")]
    pub dim: Vec<DimensionProto>,
}

/// `dim_value` and `dim_param` form a oneof on the wire.
#[derive(Clone, PartialEq, Message)]
pub(crate) struct DimensionProto {
    #[prost(int64, optional, tag = "1")]
    pub dim_value: Option<i64>,
    #[prost(string, optional, tag = "2")]
    pub dim_param: Option<String>,
}

/// `AttributeProto.AttributeType` codes and their JSON names.
const ATTRIBUTE_TYPES: [(i32, &str); 7] = [
    (1, "FLOAT"),
    (2, "INT"),
    (3, "STRING"),
    (4, "TENSOR"),
    (5, "GRAPH"),
    (6, "FLOATS"),
    (7, "INTS"),
];

fn attribute_type_name(code: i32) -> Option<String> {
    ATTRIBUTE_TYPES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| name.to_string())
}

fn attribute_type_code(name: &str) -> Option<i32> {
    ATTRIBUTE_TYPES.iter().find(|(_, n)| *n == name).map(|(c, _)| *c)
}

/// Decodes a binary `ModelProto`.
pub(crate) fn decode_model(bytes: &[u8]) -> Result<proto::ModelProto, prost::DecodeError> {
    ModelProto::decode(bytes).map(Into::into)
}

/// Encodes a model as a binary `ModelProto`.
pub(crate) fn encode_model(model: &proto::ModelProto) -> Vec<u8> {
    ModelProto::from(model).encode_to_vec()
}

impl From<ModelProto> for proto::ModelProto {
    fn from(m: ModelProto) -> Self {
        Self {
            ir_version: m.ir_version.map(Int64),
            producer_name: m.producer_name,
            opset_import: m
                .opset_import
                .into_iter()
                .map(|o| proto::OperatorSetIdProto {
                    domain: o.domain,
                    version: o.version.map(Int64),
                })
                .collect(),
            graph: m.graph.map(Into::into).unwrap_or_default(),
        }
    }
}

impl From<GraphProto> for proto::GraphProto {
    fn from(g: GraphProto) -> Self {
        Self {
            name: g.name,
            node: g.node.into_iter().map(Into::into).collect(),
            initializer: g.initializer.into_iter().map(Into::into).collect(),
            input: g.input.into_iter().map(Into::into).collect(),
            output: g.output.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<NodeProto> for proto::NodeProto {
    fn from(n: NodeProto) -> Self {
        Self {
            name: n.name.filter(|name| !name.is_empty()),
            op_type: n.op_type.unwrap_or_default(),
            input: n.input,
            output: n.output,
            attribute: n.attribute.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<AttributeProto> for proto::AttributeProto {
    fn from(a: AttributeProto) -> Self {
        Self {
            name: a.name.unwrap_or_default(),
            attr_type: a.attr_type.and_then(attribute_type_name),
            f: a.f,
            i: a.i.map(Int64),
            s: a.s.map(Bytes),
            t: a.t.map(Into::into),
            floats: a.floats,
            ints: a.ints.into_iter().map(Int64).collect(),
        }
    }
}

impl From<TensorProto> for proto::TensorProto {
    fn from(t: TensorProto) -> Self {
        Self {
            name: t.name.unwrap_or_default(),
            dims: t.dims.into_iter().map(Int64).collect(),
            data_type: t.data_type.unwrap_or_default(),
            float_data: t.float_data,
            double_data: t.double_data,
            int64_data: t.int64_data.into_iter().map(Int64).collect(),
            raw_data: t.raw_data.map(Bytes),
        }
    }
}

impl From<ValueInfoProto> for proto::ValueInfoProto {
    fn from(v: ValueInfoProto) -> Self {
        let value_type = v.value_type.map(|ty| proto::TypeProto {
            tensor_type: ty.tensor_type.map(|tt| proto::TensorTypeProto {
                elem_type: tt.elem_type.unwrap_or_default(),
                shape: tt.shape.map(|shape| proto::TensorShapeProto {
                    dim: shape
                        .dim
                        .into_iter()
                        .map(|d| proto::DimensionProto {
                            dim_value: d.dim_value.map(Int64),
                            dim_param: d.dim_param,
                        })
                        .collect(),
                }),
            }),
        });
        Self {
            name: v.name.unwrap_or_default(),
            value_type,
        }
    }
}

impl From<&proto::ModelProto> for ModelProto {
    fn from(m: &proto::ModelProto) -> Self {
        Self {
            ir_version: m.ir_version.map(|v| v.0),
            producer_name: m.producer_name.clone(),
            graph: Some((&m.graph).into()),
            opset_import: m
                .opset_import
                .iter()
                .map(|o| OperatorSetIdProto {
                    domain: o.domain.clone(),
                    version: o.version.map(|v| v.0),
                })
                .collect(),
        }
    }
}

impl From<&proto::GraphProto> for GraphProto {
    fn from(g: &proto::GraphProto) -> Self {
        Self {
            node: g.node.iter().map(Into::into).collect(),
            name: g.name.clone(),
            initializer: g.initializer.iter().map(Into::into).collect(),
            input: g.input.iter().map(Into::into).collect(),
            output: g.output.iter().map(Into::into).collect(),
        }
    }
}

impl From<&proto::NodeProto> for NodeProto {
    fn from(n: &proto::NodeProto) -> Self {
        Self {
            input: n.input.clone(),
            output: n.output.clone(),
            name: n.name.clone(),
            op_type: Some(n.op_type.clone()),
            attribute: n.attribute.iter().map(Into::into).collect(),
        }
    }
}

impl From<&proto::AttributeProto> for AttributeProto {
    fn from(a: &proto::AttributeProto) -> Self {
        Self {
            name: Some(a.name.clone()),
            f: a.f,
            i: a.i.map(|i| i.0),
            s: a.s.as_ref().map(|s| s.0.clone()),
            t: a.t.as_ref().map(Into::into),
            floats: a.floats.clone(),
            ints: a.ints.iter().map(|i| i.0).collect(),
            attr_type: a.attr_type.as_deref().and_then(attribute_type_code),
        }
    }
}

impl From<&proto::TensorProto> for TensorProto {
    fn from(t: &proto::TensorProto) -> Self {
        Self {
            dims: t.dims.iter().map(|d| d.0).collect(),
            data_type: Some(t.data_type),
            float_data: t.float_data.clone(),
            int64_data: t.int64_data.iter().map(|v| v.0).collect(),
            name: Some(t.name.clone()),
            raw_data: t.raw_data.as_ref().map(|r| r.0.clone()),
            double_data: t.double_data.clone(),
        }
    }
}

impl From<&proto::ValueInfoProto> for ValueInfoProto {
    fn from(v: &proto::ValueInfoProto) -> Self {
        let value_type = v.value_type.as_ref().map(|ty| TypeProto {
            tensor_type: ty.tensor_type.as_ref().map(|tt| TensorTypeProto {
                elem_type: Some(tt.elem_type),
                shape: tt.shape.as_ref().map(|shape| TensorShapeProto {
                    dim: shape
                        .dim
                        .iter()
                        .map(|d| DimensionProto {
                            dim_value: d.dim_value.map(|v| v.0),
                            dim_param: d.dim_param.clone(),
                        })
                        .collect(),
                }),
            }),
        });
        Self {
            name: Some(v.name.clone()),
            value_type,
        }
    }
}
