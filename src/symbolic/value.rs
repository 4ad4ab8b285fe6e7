//! Concrete values flowing through symbolic graphs.

use serde::{Deserialize, Serialize};

use crate::errors::LanError;

/// Element precision of a symbolic tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Float32,
    #[default]
    Float64,
}

impl DType {
    /// The wider of two dtypes.
    pub fn promote(self, other: DType) -> DType {
        if self == DType::Float64 || other == DType::Float64 {
            DType::Float64
        } else {
            DType::Float32
        }
    }
}

/// Static type of a symbolic variable: dtype plus rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorType {
    pub dtype: DType,
    pub ndim: usize,
}

impl TensorType {
    pub fn new(dtype: DType, ndim: usize) -> Self {
        Self { dtype, ndim }
    }

    pub fn scalar(dtype: DType) -> Self {
        Self::new(dtype, 0)
    }

    pub fn vector(dtype: DType) -> Self {
        Self::new(dtype, 1)
    }
}

/// A dense host-side tensor. Data is stored as `f64` regardless of dtype;
/// `Float32` values hold only numbers representable in `f32`.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl Value {
    /// Creates a value, checking that `data` fills `shape`.
    pub fn new(dtype: DType, shape: Vec<usize>, data: Vec<f64>) -> Result<Self, LanError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(LanError::ShapeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { dtype, shape, data })
    }

    /// A `Float64` scalar.
    pub fn scalar(value: f64) -> Self {
        Self {
            dtype: DType::Float64,
            shape: Vec::new(),
            data: vec![value],
        }
    }

    /// A `Float64` vector.
    pub fn vector(data: Vec<f64>) -> Self {
        Self {
            dtype: DType::Float64,
            shape: vec![data.len()],
            data,
        }
    }

    /// A value shaped like `self` holding `data`.
    pub(crate) fn with_data(&self, dtype: DType, data: Vec<f64>) -> Self {
        Self {
            dtype,
            shape: self.shape.clone(),
            data,
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn tensor_type(&self) -> TensorType {
        TensorType::new(self.dtype, self.ndim())
    }

    /// The single element of a rank-0 value.
    pub fn as_scalar(&self) -> Option<f64> {
        match (self.ndim(), self.data.as_slice()) {
            (0, [v]) => Some(*v),
            _ => None,
        }
    }

    /// Converts to `dtype`.
    ///
    /// Casting to `Float32` rounds every element through `f32`. A finite
    /// element that becomes infinite fails with
    /// [`LanError::PrecisionOverflow`]; NaN and infinities pass through.
    pub fn cast(&self, dtype: DType) -> Result<Value, LanError> {
        if dtype == DType::Float64 || self.dtype == DType::Float32 {
            return Ok(self.with_data(dtype, self.data.clone()));
        }
        let data = self
            .data
            .iter()
            .map(|&v| {
                let rounded = v as f32;
                if v.is_finite() && rounded.is_infinite() {
                    Err(LanError::PrecisionOverflow { value: v, dtype })
                } else {
                    Ok(rounded as f64)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.with_data(dtype, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_checks_length() {
        assert!(Value::new(DType::Float64, vec![2, 2], vec![1.0; 4]).is_ok());
        assert!(matches!(
            Value::new(DType::Float64, vec![3], vec![1.0; 2]),
            Err(LanError::ShapeMismatch { expected: 3, actual: 2 })
        ));
    }

    #[test]
    fn test_cast_rounds_through_f32() {
        let value = Value::scalar(0.1).cast(DType::Float32).unwrap();
        assert_eq!(value.dtype(), DType::Float32);
        assert_eq!(value.as_scalar(), Some(0.1f32 as f64));
    }

    #[test]
    fn test_cast_overflow_is_an_error() {
        let err = Value::vector(vec![1.0, 1e300]).cast(DType::Float32).unwrap_err();
        assert!(matches!(err, LanError::PrecisionOverflow { dtype: DType::Float32, .. }));
    }

    #[test]
    fn test_cast_passes_non_finite_through() {
        let value = Value::vector(vec![f64::NEG_INFINITY, f64::NAN])
            .cast(DType::Float32)
            .unwrap();
        assert_eq!(value.data()[0], f64::NEG_INFINITY);
        assert!(value.data()[1].is_nan());
    }

    #[test]
    fn test_promote() {
        assert_eq!(DType::Float32.promote(DType::Float64), DType::Float64);
        assert_eq!(DType::Float32.promote(DType::Float32), DType::Float32);
    }
}
