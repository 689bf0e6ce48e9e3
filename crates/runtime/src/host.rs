//! Staging between Candle tensors and host buffers read by the kernels.

use candle_core::{DType, Device, Tensor};

use crate::error::{Result, RuntimeError};
use crate::view::{contiguous_strides, StridedView};

/// Dense `f32` copy of a tensor plus the dtype/device it came from.
///
/// Kernels always compute in `f32`; [`HostTensor::to_tensor`] restores the
/// caller's dtype and device for outputs.
#[derive(Debug, Clone)]
pub struct HostTensor {
    data: Vec<f32>,
    dims: Vec<usize>,
    dtype: DType,
    device: Device,
}

impl HostTensor {
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let data = tensor
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Ok(Self {
            data,
            dims: tensor.dims().to_vec(),
            dtype: tensor.dtype(),
            device: tensor.device().clone(),
        })
    }

    /// Wraps a buffer produced by a kernel.
    pub fn from_vec(data: Vec<f32>, dims: Vec<usize>, dtype: DType, device: Device) -> Result<Self> {
        let expected: usize = dims.iter().product();
        if expected != data.len() {
            return Err(RuntimeError::layout(format!(
                "buffer of {} elements cannot back shape {dims:?}",
                data.len()
            )));
        }
        Ok(Self {
            data,
            dims,
            dtype,
            device,
        })
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Row-major view with compile-time rank `R`.
    pub fn view<const R: usize>(&self) -> Result<StridedView<'_, R>> {
        let dims: [usize; R] = self.dims.as_slice().try_into().map_err(|_| {
            RuntimeError::layout(format!("expected rank {R}, got shape {:?}", self.dims))
        })?;
        StridedView::new(&self.data, dims, contiguous_strides(dims), 0)
    }

    /// Converts back into a Candle tensor on the original device and dtype.
    pub fn to_tensor(&self) -> Result<Tensor> {
        let tensor = Tensor::from_vec(self.data.clone(), self.dims.clone(), &Device::Cpu)?;
        Ok(tensor.to_dtype(self.dtype)?.to_device(&self.device)?)
    }

    /// Like [`HostTensor::to_tensor`] but keeps `f32` regardless of the source dtype.
    pub fn to_f32_tensor(&self) -> Result<Tensor> {
        let tensor = Tensor::from_vec(self.data.clone(), self.dims.clone(), &Device::Cpu)?;
        Ok(tensor.to_device(&self.device)?)
    }
}

/// Fails unless the innermost stride of `tensor` is 1.
pub fn expect_unit_inner_stride(name: &str, tensor: &Tensor) -> Result<()> {
    match tensor.stride().last() {
        Some(&1) | None => Ok(()),
        Some(&other) => Err(RuntimeError::layout(format!(
            "{name} must have unit stride on its last dimension, got {other}"
        ))),
    }
}
