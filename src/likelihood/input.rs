//! Assembly of the network input matrix `[params..., rt, choice]`.

use burn::tensor::{Tensor, backend::Backend};

use super::ParamValue;
use crate::errors::LanError;

/// Checks parameter count, then batched parameter lengths.
pub(crate) fn check_params(
    data: &[f64],
    params: &[ParamValue],
    n_params: usize,
) -> Result<(), LanError> {
    if params.len() != n_params {
        return Err(LanError::ParameterArity {
            expected: n_params,
            actual: params.len(),
        });
    }
    for param in params {
        if let ParamValue::Batched(values) = param {
            if values.len() != data.len() {
                return Err(LanError::ShapeMismatch {
                    expected: data.len(),
                    actual: values.len(),
                });
            }
        }
    }
    Ok(())
}

/// Splits signed response times into `(|rt|, choice)` with choice 1 for
/// positive values and 0 otherwise.
pub(crate) fn rt_choice(data: &[f64]) -> (Vec<f64>, Vec<f64>) {
    data.iter()
        .map(|&x| (x.abs(), if x > 0.0 { 1.0 } else { 0.0 }))
        .unzip()
}

/// The parameter as a column: `[1, 1]` for scalars, `[n, 1]` for batched.
pub(crate) fn param_leaf<B: Backend>(param: &ParamValue, device: &B::Device) -> Tensor<B, 2> {
    match param {
        ParamValue::Scalar(v) => Tensor::<B, 1>::from_floats([*v], device).reshape([1, 1]),
        ParamValue::Batched(values) => {
            Tensor::<B, 1>::from_floats(values.as_slice(), device).reshape([values.len(), 1])
        }
    }
}

fn column<B: Backend>(values: &[f64], device: &B::Device) -> Tensor<B, 2> {
    Tensor::<B, 1>::from_floats(values, device).reshape([values.len(), 1])
}

/// Builds the `[rows, n_params + 2]` input matrix from parameter leaves.
pub(crate) fn assemble<B: Backend>(
    leaves: &[Tensor<B, 2>],
    data: &[f64],
    device: &B::Device,
) -> Tensor<B, 2> {
    let rows = data.len();
    let (rt, choice) = rt_choice(data);

    let mut columns: Vec<Tensor<B, 2>> = leaves
        .iter()
        .map(|leaf| {
            if leaf.dims()[0] == rows {
                leaf.clone()
            } else {
                leaf.clone().repeat_dim(0, rows)
            }
        })
        .collect();
    columns.push(column(&rt, device));
    columns.push(column(&choice, device));

    Tensor::cat(columns, 1)
}
