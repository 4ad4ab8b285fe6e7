//! Interchange graphs: loading (binary `.onnx` or its JSON mapping),
//! interpreting and compiling pretrained networks.
//!
//! # Example
//!
//! ```
//! use hssm_lan::graph::{CompiledGraph, GraphConfig, interpret};
//! use hssm_lan::layers::Activation;
//! use burn::backend::NdArray;
//! use burn::tensor::Tensor;
//!
//! type TestBackend = NdArray<f64>;
//! let device = Default::default();
//!
//! let graph = GraphConfig::with_feature_size(2)
//!     .dense(vec![vec![1.0, -1.0]], vec![0.0], Activation::Tanh)
//!     .build()
//!     .unwrap();
//!
//! let input = Tensor::<TestBackend, 2>::from_floats([[0.5, 0.25]], &device);
//! let direct = interpret(&graph, input.clone()).unwrap();
//! let compiled = CompiledGraph::<TestBackend>::new(&graph, &device).unwrap();
//! assert_eq!(direct.to_data(), compiled.forward(input).unwrap().to_data());
//! ```

mod builder;
mod core;
mod interpret;
mod model;
mod operation;
pub mod proto;
mod source;
mod wire;

pub use builder::{GraphConfig, INPUT_NAME};
pub use core::{Attribute, GraphId, Initializer, InterchangeGraph, Node};
pub use interpret::interpret;
pub use model::CompiledGraph;
pub use operation::{BinaryOp, OpKind, Operation};
pub use source::ModelSource;
