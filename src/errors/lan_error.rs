//! Error types for loading networks and evaluating LAN likelihoods.

use thiserror::Error;

use crate::symbolic::{DType, OpId};

/// Errors that can occur while loading, evaluating or differentiating a LAN.
#[derive(Debug, Error)]
pub enum LanError {
    #[error("Failed to load model from {origin}: {message}")]
    ModelLoad { origin: String, message: String },

    #[error("Unsupported operator `{op_type}` at node `{node}`")]
    UnsupportedOperator { node: String, op_type: String },

    #[error("Expected {expected} distribution parameters, got {actual}")]
    ParameterArity { expected: usize, actual: usize },

    #[error("Gradient of `{op}` with respect to input {input} is not implemented")]
    GradientNotImplemented { op: String, input: usize },

    #[error("Cannot construct `{op}` node: {message}")]
    NodeConstruction { op: String, message: String },

    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    #[error("No dispatch registered for operator `{op}` (op id {id})")]
    MissingDispatch { op: String, id: OpId },

    #[error("Value {value} overflows {dtype:?}")]
    PrecisionOverflow { value: f64, dtype: DType },

    #[error("Evaluation error: {message}")]
    Evaluation { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LanError {
    pub(crate) fn model_load(origin: impl Into<String>, message: impl ToString) -> Self {
        Self::ModelLoad {
            origin: origin.into(),
            message: message.to_string(),
        }
    }

    pub(crate) fn node_construction(op: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NodeConstruction {
            op: op.into(),
            message: message.into(),
        }
    }

    pub(crate) fn evaluation(message: impl ToString) -> Self {
        Self::Evaluation {
            message: message.to_string(),
        }
    }
}
