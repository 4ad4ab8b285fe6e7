//! Likelihood construction configuration.

use crate::symbolic::DType;

/// Configuration for building LAN likelihood functions.
#[derive(Debug, Clone, PartialEq)]
pub struct LanConfig {
    /// Lower the graph once into a `CompiledGraph` for `forward` and `grad`.
    pub compile: bool,
    /// Evaluate one dummy row at construction so shape errors surface early.
    pub warm_up: bool,
    /// Dtype of the symbolic op outputs.
    pub output_dtype: DType,
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            compile: true,
            warm_up: true,
            output_dtype: DType::Float64,
        }
    }
}

impl LanConfig {
    /// Creates a new LanConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to compile.
    pub fn compile(mut self, compile: bool) -> Self {
        self.compile = compile;
        self
    }

    /// Sets whether to warm up at construction.
    pub fn warm_up(mut self, warm_up: bool) -> Self {
        self.warm_up = warm_up;
        self
    }

    /// Sets the symbolic output dtype.
    pub fn output_dtype(mut self, dtype: DType) -> Self {
        self.output_dtype = dtype;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LanConfig::default();
        assert!(config.compile);
        assert!(config.warm_up);
        assert_eq!(config.output_dtype, DType::Float64);
    }

    #[test]
    fn test_config_builder() {
        let config = LanConfig::new()
            .compile(false)
            .warm_up(false)
            .output_dtype(DType::Float32);

        assert!(!config.compile);
        assert!(!config.warm_up);
        assert_eq!(config.output_dtype, DType::Float32);
    }
}
