//! Lightweight validation helpers shared across the normalisation kernels.
//!
//! Every check runs before a launch and returns a [`LayerError`] naming the
//! offending argument, so call sites propagate with `?` instead of panicking.

use candle_core::{DType, Tensor};

use crate::LayerError;

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(name: &str, tensor: &Tensor, expected: &[usize]) -> Result<(), LayerError> {
    if tensor.dims() == expected {
        Ok(())
    } else {
        Err(LayerError::shape(format!(
            "{name}: expected shape {expected:?}, got {:?}",
            tensor.dims()
        )))
    }
}

/// Splits `tensor` into `(rows, cols)` where `cols` is the product of the
/// trailing `normalized_shape` axes.
pub fn expect_trailing_shape(
    name: &str,
    tensor: &Tensor,
    normalized_shape: &[usize],
) -> Result<(usize, usize), LayerError> {
    if normalized_shape.is_empty() {
        return Err(LayerError::shape(format!("{name}: normalized_shape must not be empty")));
    }
    let dims = tensor.dims();
    if dims.len() < normalized_shape.len() || !dims.ends_with(normalized_shape) {
        return Err(LayerError::shape(format!(
            "{name}: trailing dims of {dims:?} must equal normalized_shape {normalized_shape:?}"
        )));
    }
    let cols: usize = normalized_shape.iter().product();
    if cols == 0 {
        return Err(LayerError::shape(format!(
            "{name}: normalized_shape {normalized_shape:?} has no elements"
        )));
    }
    Ok((tensor.elem_count() / cols, cols))
}

/// Checks the tensor holds exactly `expected` elements, whatever its rank.
pub fn expect_elem_count(name: &str, tensor: &Tensor, expected: usize) -> Result<(), LayerError> {
    if tensor.elem_count() == expected {
        Ok(())
    } else {
        Err(LayerError::shape(format!(
            "{name}: expected {expected} elements, got {} ({:?})",
            tensor.elem_count(),
            tensor.dims()
        )))
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(name: &str, tensor: &Tensor, allowed: &[DType]) -> Result<(), LayerError> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(LayerError::unsupported(format!(
            "{name}: expected dtype in {allowed:?}, got {dtype:?}"
        )))
    }
}

/// Checks `tensor` lives on the same device as `reference`.
pub fn expect_same_device(name: &str, tensor: &Tensor, reference: &Tensor) -> Result<(), LayerError> {
    if tensor.device().same_device(reference.device()) {
        Ok(())
    } else {
        Err(LayerError::shape(format!(
            "{name}: expected device {:?}, got {:?}",
            reference.device(),
            tensor.device()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn trailing_shape_splits_rows_and_columns() -> anyhow::Result<()> {
        let x = Tensor::zeros((2, 3, 4, 5), DType::F32, &Device::Cpu)?;
        assert_eq!(expect_trailing_shape("x", &x, &[5])?, (24, 5));
        assert_eq!(expect_trailing_shape("x", &x, &[4, 5])?, (6, 20));
        assert!(expect_trailing_shape("x", &x, &[3, 5]).is_err());
        assert!(expect_trailing_shape("x", &x, &[]).is_err());
        assert!(expect_trailing_shape("x", &x, &[1, 2, 3, 4, 5]).is_err());
        Ok(())
    }

    #[test]
    fn shape_and_dtype_mismatches_name_the_argument() -> anyhow::Result<()> {
        let w = Tensor::zeros((4,), DType::F16, &Device::Cpu)?;
        let err = expect_shape("norm.weight", &w, &[5]).unwrap_err();
        assert!(err.to_string().contains("norm.weight"));
        let err = expect_dtype_in("norm.weight", &w, &[DType::F32]).unwrap_err();
        assert!(matches!(err, LayerError::Unsupported { .. }));
        assert!(expect_elem_count("mean", &w, 4).is_ok());
        Ok(())
    }
}
