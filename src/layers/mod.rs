//! Neural network layer implementations.
//!
//! This module contains the building blocks the interchange interpreter
//! executes: affine layers and elementwise activation functions.

pub mod activation;
pub mod dense;

pub use activation::Activation;
pub use dense::{Dense, GemmAttributes};
