//! Read-only strided views over host `f32` buffers.
//!
//! A view is the kernel-side equivalent of a tensor argument: base buffer,
//! element offset and per-axis strides. Nothing about the layout is assumed
//! beyond what the strides state, so a permuted view costs nothing.

use crate::error::{Result, RuntimeError};

#[derive(Debug, Clone, Copy)]
pub struct StridedView<'a, const R: usize> {
    data: &'a [f32],
    offset: usize,
    dims: [usize; R],
    strides: [usize; R],
}

impl<'a, const R: usize> StridedView<'a, R> {
    /// Builds a view after checking every addressable element lies inside `data`.
    pub fn new(
        data: &'a [f32],
        dims: [usize; R],
        strides: [usize; R],
        offset: usize,
    ) -> Result<Self> {
        if dims.iter().any(|&d| d == 0) {
            return Ok(Self {
                data,
                offset,
                dims,
                strides,
            });
        }
        let last = offset
            + dims
                .iter()
                .zip(strides.iter())
                .map(|(d, s)| (d - 1) * s)
                .sum::<usize>();
        if last >= data.len() {
            return Err(RuntimeError::layout(format!(
                "view dims {dims:?} strides {strides:?} offset {offset} exceed buffer of {} elements",
                data.len()
            )));
        }
        Ok(Self {
            data,
            offset,
            dims,
            strides,
        })
    }

    /// Row-major view over a densely packed buffer.
    pub fn contiguous(data: &'a [f32], dims: [usize; R]) -> Result<Self> {
        Self::new(data, dims, contiguous_strides(dims), 0)
    }

    pub fn dims(&self) -> [usize; R] {
        self.dims
    }

    pub fn strides(&self) -> [usize; R] {
        self.strides
    }

    /// Stride of the innermost axis.
    pub fn inner_stride(&self) -> usize {
        self.strides[R - 1]
    }

    /// Reorders axes; `order[i]` names the source axis that becomes axis `i`.
    pub fn permute(&self, order: [usize; R]) -> Self {
        let mut dims = [0; R];
        let mut strides = [0; R];
        for (dst, &src) in order.iter().enumerate() {
            dims[dst] = self.dims[src];
            strides[dst] = self.strides[src];
        }
        Self {
            data: self.data,
            offset: self.offset,
            dims,
            strides,
        }
    }

    #[inline]
    pub fn index(&self, idx: [usize; R]) -> usize {
        let mut linear = self.offset;
        for axis in 0..R {
            linear += idx[axis] * self.strides[axis];
        }
        linear
    }

    #[inline]
    pub fn get(&self, idx: [usize; R]) -> f32 {
        self.data[self.index(idx)]
    }

    /// Contiguous run along the innermost axis, starting at `idx`.
    ///
    /// Only valid for views with unit inner stride; callers check that once
    /// when the kernel is launched.
    #[inline]
    pub fn lane(&self, idx: [usize; R]) -> &'a [f32] {
        let start = self.index(idx);
        let len = self.dims[R - 1] - idx[R - 1];
        &self.data[start..start + len]
    }
}

/// Row-major strides for `dims`.
pub fn contiguous_strides<const R: usize>(dims: [usize; R]) -> [usize; R] {
    let mut strides = [1; R];
    for axis in (0..R.saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * dims[axis + 1];
    }
    strides
}
