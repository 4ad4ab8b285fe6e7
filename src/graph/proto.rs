//! Wire schema for the ONNX protobuf-JSON mapping.
//!
//! Field names follow the canonical JSON mapping (camelCase). 64-bit integers
//! are written as strings by protobuf JSON printers but accepted either way,
//! and `bytes` fields are base64. Binary `.onnx` files decode into the same
//! structs.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

/// ONNX `TensorProto.DataType` codes understood by the loader.
pub const DATA_TYPE_FLOAT: i32 = 1;
pub const DATA_TYPE_INT64: i32 = 7;
pub const DATA_TYPE_DOUBLE: i32 = 11;

/// A protobuf int64, written as a JSON string and read from a string or number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Int64(pub i64);

impl Serialize for Int64 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Int64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Num(i64),
            Str(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Num(n) => Ok(Int64(n)),
            Repr::Str(s) => s.parse().map(Int64).map_err(de::Error::custom),
        }
    }
}

/// A protobuf `bytes` field, base64 in JSON.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bytes(pub Vec<u8>);

impl Serialize for Bytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Bytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map(Bytes).map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelProto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ir_version: Option<Int64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub opset_import: Vec<OperatorSetIdProto>,
    pub graph: GraphProto,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorSetIdProto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Int64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphProto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub node: Vec<NodeProto>,
    #[serde(default)]
    pub initializer: Vec<TensorProto>,
    #[serde(default)]
    pub input: Vec<ValueInfoProto>,
    #[serde(default)]
    pub output: Vec<ValueInfoProto>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeProto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub op_type: String,
    #[serde(default)]
    pub input: Vec<String>,
    #[serde(default)]
    pub output: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attribute: Vec<AttributeProto>,
}

/// A node attribute. Only the populated field carries the value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeProto {
    pub name: String,
    /// `AttributeType` enum name (`"INT"`, `"FLOAT"`, ...). JSON printers omit
    /// zero-valued fields, so this is what tells `i: 0` apart from absent.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub attr_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub f: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i: Option<Int64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<TensorProto>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub floats: Vec<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ints: Vec<Int64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TensorProto {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub dims: Vec<Int64>,
    #[serde(default)]
    pub data_type: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub float_data: Vec<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub double_data: Vec<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub int64_data: Vec<Int64>,
    /// Little-endian element bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<Bytes>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueInfoProto {
    pub name: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub value_type: Option<TypeProto>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeProto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tensor_type: Option<TensorTypeProto>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TensorTypeProto {
    #[serde(default)]
    pub elem_type: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<TensorShapeProto>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TensorShapeProto {
    #[serde(default)]
    pub dim: Vec<DimensionProto>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionProto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dim_value: Option<Int64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dim_param: Option<String>,
}

impl ValueInfoProto {
    /// Declared size of the last dimension, if static.
    pub fn last_dim(&self) -> Option<usize> {
        let shape = self.value_type.as_ref()?.tensor_type.as_ref()?.shape.as_ref()?;
        let value = shape.dim.last()?.dim_value?.0;
        usize::try_from(value).ok()
    }
}
