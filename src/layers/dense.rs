//! Affine (fully connected) layer implementation.

use burn::tensor::{Tensor, backend::Backend};

use crate::errors::LanError;
use crate::layers::Activation;

/// Attributes of an ONNX `Gemm` node: `Y = alpha * A' * B' + beta * C`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GemmAttributes {
    pub alpha: f64,
    pub beta: f64,
    pub trans_a: bool,
    pub trans_b: bool,
}

impl Default for GemmAttributes {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
            trans_a: false,
            trans_b: false,
        }
    }
}

/// An affine layer with optional activation.
///
/// It performs: output = activation(input @ weight + bias), with `weight`
/// stored as `[input_size, output_size]` and `bias` as `[1, output_size]`.
#[derive(Debug, Clone)]
pub struct Dense<B: Backend> {
    weight: Tensor<B, 2>,
    bias: Option<Tensor<B, 2>>,
    transpose_input: bool,
    activation: Activation,
}

impl<B: Backend> Dense<B> {
    /// Creates a layer from the operands of a `Gemm` node.
    ///
    /// `alpha` and `beta` are folded into the weight and bias, and `transB` is
    /// resolved here so the forward pass is a single matmul.
    pub fn from_gemm(weight: Tensor<B, 2>, bias: Option<Tensor<B, 2>>, gemm: &GemmAttributes) -> Self {
        let weight = if gemm.trans_b {
            weight.transpose()
        } else {
            weight
        };
        let weight = if gemm.alpha != 1.0 {
            weight.mul_scalar(gemm.alpha)
        } else {
            weight
        };
        let bias = bias.map(|c| {
            if gemm.beta != 1.0 {
                c.mul_scalar(gemm.beta)
            } else {
                c
            }
        });
        Self {
            weight,
            bias,
            transpose_input: gemm.trans_a,
            activation: Activation::None,
        }
    }

    /// Sets the activation applied after the affine map.
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Returns the input size of this layer.
    pub fn input_size(&self) -> usize {
        self.weight.dims()[0]
    }

    /// Returns the output size of this layer.
    pub fn output_size(&self) -> usize {
        self.weight.dims()[1]
    }

    /// Returns the activation function.
    pub fn activation(&self) -> Activation {
        self.activation
    }

    /// Performs the forward pass.
    ///
    /// Shapes are checked before the matmul so a malformed network fails with
    /// [`LanError::ShapeMismatch`] instead of a backend panic.
    pub fn forward(&self, input: Tensor<B, 2>) -> Result<Tensor<B, 2>, LanError> {
        let input = if self.transpose_input {
            input.transpose()
        } else {
            input
        };
        let [rows, cols] = input.dims();
        if cols != self.input_size() {
            return Err(LanError::ShapeMismatch {
                expected: self.input_size(),
                actual: cols,
            });
        }

        let output = input.matmul(self.weight.clone());
        let output = match &self.bias {
            Some(bias) => {
                let [bias_rows, bias_cols] = bias.dims();
                if bias_cols != self.output_size() && bias_cols != 1 {
                    return Err(LanError::ShapeMismatch {
                        expected: self.output_size(),
                        actual: bias_cols,
                    });
                }
                if bias_rows != 1 && bias_rows != rows {
                    return Err(LanError::ShapeMismatch {
                        expected: rows,
                        actual: bias_rows,
                    });
                }
                output.add(bias.clone())
            }
            None => output,
        };
        Ok(self.activation.apply(output))
    }
}
