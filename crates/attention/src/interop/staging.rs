//! Host staging of `q`, `k`, `v` for the tiled kernels.
//!
//! Kernels index every input as `[batch, seq, head, dim]`. Heads-major inputs
//! are viewed through permuted strides rather than transposed copies.

use candle_core::Tensor;
use runtime::{HostTensor, StridedView};

use crate::core::AttentionError;
use crate::interop::types::QkvLayout;

#[derive(Debug)]
pub struct StagedQkv {
    layout: QkvLayout,
    q: HostTensor,
    k: HostTensor,
    v: HostTensor,
}

impl StagedQkv {
    pub fn stage(layout: QkvLayout, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Self, AttentionError> {
        Ok(Self {
            layout,
            q: HostTensor::from_tensor(q)?,
            k: HostTensor::from_tensor(k)?,
            v: HostTensor::from_tensor(v)?,
        })
    }

    /// Query view in kernel axis order.
    pub fn q(&self) -> Result<StridedView<'_, 4>, AttentionError> {
        kernel_view(&self.q, self.layout)
    }

    pub fn k(&self) -> Result<StridedView<'_, 4>, AttentionError> {
        kernel_view(&self.k, self.layout)
    }

    pub fn v(&self) -> Result<StridedView<'_, 4>, AttentionError> {
        kernel_view(&self.v, self.layout)
    }

    pub fn query(&self) -> &HostTensor {
        &self.q
    }
}

fn kernel_view(host: &HostTensor, layout: QkvLayout) -> Result<StridedView<'_, 4>, AttentionError> {
    let view = host.view::<4>()?;
    Ok(match layout {
        QkvLayout::SeqMajor => view,
        QkvLayout::HeadsMajor => view.permute([0, 2, 1, 3]),
    })
}
