//! GraphConfig - builds feed-forward interchange graphs in code.
//!
//! Each dense layer becomes a `Gemm` node with `transB = 1` (weights stored
//! `[output, input]`, the layout exporters use) followed by its activation
//! node, so the result loads back exactly like an exported LAN.

use burn::nn::LinearConfig;
use burn::tensor::backend::Backend;

use crate::errors::LanError;
use crate::layers::Activation;

use super::core::{Attribute, InterchangeGraph, Initializer, Node};

/// Name of the input value in built graphs.
pub const INPUT_NAME: &str = "input";

/// One dense layer with weights laid out `[output][input]`.
#[derive(Debug, Clone)]
struct DenseLayerConfig {
    weights: Vec<Vec<f64>>,
    bias: Vec<f64>,
    activation: Activation,
}

/// Configuration for building an InterchangeGraph.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    name: String,
    features: Vec<String>,
    layers: Vec<DenseLayerConfig>,
}

impl GraphConfig {
    /// Creates a new GraphConfig with the specified features.
    pub fn new(features: Vec<String>) -> Self {
        Self {
            name: "lan".to_string(),
            features,
            layers: Vec::new(),
        }
    }

    /// Creates a GraphConfig with numbered features.
    pub fn with_feature_size(size: usize) -> Self {
        Self::new((0..size).map(|i| format!("feature_{i}")).collect())
    }

    /// Sets the graph name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Adds a dense layer with explicit weights (`weights[output][input]`).
    pub fn dense(mut self, weights: Vec<Vec<f64>>, bias: Vec<f64>, activation: Activation) -> Self {
        self.layers.push(DenseLayerConfig {
            weights,
            bias,
            activation,
        });
        self
    }

    /// Adds a dense layer initialized by burn's `Linear` initializer.
    pub fn dense_init<B: Backend>(
        self,
        output_size: usize,
        activation: Activation,
        device: &B::Device,
    ) -> Self {
        let input_size = self.output_size();
        let linear = LinearConfig::new(input_size, output_size).init::<B>(device);

        // Linear stores [input, output]; transpose into [output][input].
        let flat: Vec<f64> = linear.weight.val().to_data().iter::<f64>().collect();
        let mut weights = vec![vec![0.0; input_size]; output_size];
        for (i, row) in weights.iter_mut().enumerate() {
            for (j, w) in row.iter_mut().enumerate() {
                *w = flat[i + j * output_size];
            }
        }
        let bias = match &linear.bias {
            Some(bias) => bias.val().to_data().iter::<f64>().collect(),
            None => vec![0.0; output_size],
        };

        self.dense(weights, bias, activation)
    }

    /// Returns the input feature names.
    pub fn features(&self) -> &[String] {
        &self.features
    }

    /// Returns the number of input features.
    pub fn feature_size(&self) -> usize {
        self.features.len()
    }

    /// Width of the last layer, or the feature size when there are no layers.
    pub fn output_size(&self) -> usize {
        self.layers
            .last()
            .map(|l| l.bias.len())
            .unwrap_or(self.features.len())
    }

    /// Returns the number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Builds the InterchangeGraph.
    pub fn build(&self) -> Result<InterchangeGraph, LanError> {
        if self.features.is_empty() {
            return Err(LanError::InvalidGraph("graph has no input features".to_string()));
        }
        if self.layers.is_empty() {
            return Err(LanError::InvalidGraph("graph has no layers".to_string()));
        }

        let mut nodes = Vec::new();
        let mut initializers = Vec::new();
        let mut current = INPUT_NAME.to_string();
        let mut width = self.features.len();

        for (i, layer) in self.layers.iter().enumerate() {
            let output_size = layer.weights.len();
            if layer.bias.len() != output_size {
                return Err(LanError::ShapeMismatch {
                    expected: output_size,
                    actual: layer.bias.len(),
                });
            }
            if let Some(row) = layer.weights.iter().find(|row| row.len() != width) {
                return Err(LanError::ShapeMismatch {
                    expected: width,
                    actual: row.len(),
                });
            }

            let weight_name = format!("dense_{i}.weight");
            let bias_name = format!("dense_{i}.bias");
            initializers.push(Initializer::new(
                weight_name.clone(),
                vec![output_size, width],
                layer.weights.iter().flatten().copied().collect(),
            )?);
            initializers.push(Initializer::new(
                bias_name.clone(),
                vec![output_size],
                layer.bias.clone(),
            )?);

            let gemm_out = format!("dense_{i}");
            nodes.push(
                Node::new(
                    format!("Gemm_{i}"),
                    "Gemm",
                    vec![current, weight_name, bias_name],
                    vec![gemm_out.clone()],
                )
                .with_attribute("transB", Attribute::Int(1)),
            );
            current = gemm_out;

            if let Some(op_type) = layer.activation.op_type() {
                let act_out = format!("dense_{i}_{}", op_type.to_lowercase());
                nodes.push(Node::new(
                    format!("{op_type}_{i}"),
                    op_type,
                    vec![current],
                    vec![act_out.clone()],
                ));
                current = act_out;
            }
            width = output_size;
        }

        InterchangeGraph::new(
            self.name.clone(),
            INPUT_NAME,
            Some(self.features.len()),
            nodes,
            initializers,
            current,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::interpret;
    use burn::backend::NdArray;
    use burn::tensor::Tensor;

    type TestBackend = NdArray<f64>;

    #[test]
    fn test_build_emits_gemm_and_activation_nodes() {
        let graph = GraphConfig::with_feature_size(2)
            .dense(vec![vec![1.0, 0.0], vec![0.0, 1.0]], vec![0.0, 0.0], Activation::Relu)
            .dense(vec![vec![1.0, 1.0]], vec![0.5], Activation::None)
            .build()
            .unwrap();

        let op_types: Vec<&str> = graph.nodes().iter().map(|n| n.op_type()).collect();
        assert_eq!(op_types, vec!["Gemm", "Relu", "Gemm"]);
        assert_eq!(graph.input_width(), Some(2));
        assert_eq!(graph.output(), "dense_1");
        assert_eq!(graph.initializer("dense_0.weight").unwrap().dims(), &[2, 2]);
    }

    #[test]
    fn test_built_graph_evaluates() {
        let graph = GraphConfig::with_feature_size(2)
            .dense(vec![vec![1.0, -1.0]], vec![0.5], Activation::None)
            .build()
            .unwrap();
        let device = Default::default();
        let input = Tensor::<TestBackend, 2>::from_floats([[3.0, 1.0]], &device);
        let output: Vec<f64> = interpret(&graph, input).unwrap().to_data().to_vec().unwrap();
        assert_eq!(output, vec![2.5]);
    }

    #[test]
    fn test_dense_init_shapes() {
        let device = Default::default();
        let config = GraphConfig::with_feature_size(6)
            .dense_init::<TestBackend>(8, Activation::Tanh, &device)
            .dense_init::<TestBackend>(1, Activation::None, &device);
        assert_eq!(config.num_layers(), 2);
        assert_eq!(config.output_size(), 1);

        let graph = config.build().unwrap();
        assert_eq!(graph.initializer("dense_0.weight").unwrap().dims(), &[8, 6]);
        assert_eq!(graph.initializer("dense_1.bias").unwrap().dims(), &[1]);
    }

    #[test]
    fn test_empty_configs_fail() {
        assert!(matches!(
            GraphConfig::new(vec![]).build(),
            Err(LanError::InvalidGraph(_))
        ));
        assert!(matches!(
            GraphConfig::with_feature_size(3).build(),
            Err(LanError::InvalidGraph(_))
        ));
    }

    #[test]
    fn test_wrong_row_width_fails() {
        let result = GraphConfig::with_feature_size(3)
            .dense(vec![vec![1.0, 2.0]], vec![0.0], Activation::None)
            .build();
        assert!(matches!(
            result,
            Err(LanError::ShapeMismatch { expected: 3, actual: 2 })
        ));
    }
}
