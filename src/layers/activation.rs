//! Elementwise nonlinearities found in exported LAN networks.

use burn::tensor::{Tensor, backend::Backend};
use serde::{Deserialize, Serialize};

/// Supported activation functions.
///
/// Each maps to one ONNX operator type, so an interchange node such as
/// `{"opType": "Tanh"}` is executed as [`Activation::Tanh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Activation {
    /// No activation (identity function).
    #[default]
    None,
    /// Rectified Linear Unit: f(x) = max(0, x)
    Relu,
    /// Sigmoid: f(x) = 1 / (1 + exp(-x))
    Sigmoid,
    /// Hyperbolic tangent: f(x) = tanh(x)
    Tanh,
    /// Softplus: f(x) = ln(1 + exp(x))
    Softplus,
    /// Exponential: f(x) = exp(x)
    Exp,
    /// Natural logarithm: f(x) = ln(x)
    Log,
    /// Square root: f(x) = sqrt(x)
    Sqrt,
    /// Absolute value: f(x) = |x|
    Abs,
    /// Gaussian Error Linear Unit: f(x) = x * 0.5 * (1 + erf(x / sqrt(2)))
    Gelu,
}

impl Activation {
    /// Applies the activation function to a tensor.
    pub fn apply<B: Backend, const D: usize>(&self, tensor: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Activation::None => tensor,
            Activation::Relu => burn::tensor::activation::relu(tensor),
            Activation::Sigmoid => burn::tensor::activation::sigmoid(tensor),
            Activation::Tanh => burn::tensor::activation::tanh(tensor),
            Activation::Softplus => burn::tensor::activation::softplus(tensor, 1.0),
            Activation::Exp => tensor.exp(),
            // ONNX semantics: no masking, ln/sqrt of negatives propagate NaN
            Activation::Log => tensor.log(),
            Activation::Sqrt => tensor.sqrt(),
            Activation::Abs => tensor.abs(),
            Activation::Gelu => burn::tensor::activation::gelu(tensor),
        }
    }

    /// Returns the ONNX operator type for this activation.
    pub fn op_type(&self) -> Option<&'static str> {
        match self {
            Activation::None => None,
            Activation::Relu => Some("Relu"),
            Activation::Sigmoid => Some("Sigmoid"),
            Activation::Tanh => Some("Tanh"),
            Activation::Softplus => Some("Softplus"),
            Activation::Exp => Some("Exp"),
            Activation::Log => Some("Log"),
            Activation::Sqrt => Some("Sqrt"),
            Activation::Abs => Some("Abs"),
            Activation::Gelu => Some("Gelu"),
        }
    }

    /// Creates an Activation from an ONNX operator type.
    ///
    /// Operator types are case-sensitive in ONNX; `Identity` is handled as a
    /// separate operator and is not an activation.
    pub fn from_op_type(op_type: &str) -> Option<Self> {
        match op_type {
            "Relu" => Some(Activation::Relu),
            "Sigmoid" => Some(Activation::Sigmoid),
            "Tanh" => Some(Activation::Tanh),
            "Softplus" => Some(Activation::Softplus),
            "Exp" => Some(Activation::Exp),
            "Log" => Some(Activation::Log),
            "Sqrt" => Some(Activation::Sqrt),
            "Abs" => Some(Activation::Abs),
            "Gelu" => Some(Activation::Gelu),
            _ => None,
        }
    }
}
