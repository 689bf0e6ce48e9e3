//! Shape descriptions and validation shared by the attention entry points.

use candle_core::{DType, Tensor};

use crate::core::AttentionError;

/// Head dimensions the tiled kernels are instantiated for.
pub const SUPPORTED_HEAD_DIMS: [usize; 5] = [16, 32, 64, 128, 256];

/// Permitted data types for attention tensors.
pub type AttentionDType = DType;

/// Axis order of the `q`, `k`, `v` tensors handed to an entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QkvLayout {
    /// `[batch, n_heads, seq_len, head_dim]`.
    HeadsMajor,
    /// `[batch, seq_len, n_heads, head_dim]`.
    SeqMajor,
}

impl QkvLayout {
    fn label(self) -> &'static str {
        match self {
            QkvLayout::HeadsMajor => "[batch, heads, seq_len, head_dim]",
            QkvLayout::SeqMajor => "[batch, seq_len, heads, head_dim]",
        }
    }

    /// Splits a rank-4 shape into `(batch, heads, seq_len, head_dim)`.
    fn split(self, dims: (usize, usize, usize, usize)) -> (usize, usize, usize, usize) {
        let (a, b, c, d) = dims;
        match self {
            QkvLayout::HeadsMajor => (a, b, c, d),
            QkvLayout::SeqMajor => (a, c, b, d),
        }
    }
}

/// Logical description of one attention invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionShape {
    pub batch: usize,
    /// Query heads.
    pub num_heads: usize,
    /// Key/value heads; divides `num_heads`.
    pub num_kv_heads: usize,
    pub q_len: usize,
    pub kv_len: usize,
    pub head_dim: usize,
}

impl AttentionShape {
    /// Validates and extracts the shape of a `q`, `k`, `v` triple.
    pub fn from_qkv(
        layout: QkvLayout,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
    ) -> Result<Self, AttentionError> {
        let parse = |name: &str, t: &Tensor| {
            t.dims4().map(|dims| layout.split(dims)).map_err(|_| {
                AttentionError::shape(format!(
                    "{name} must have shape {}, got {:?}",
                    layout.label(),
                    t.dims()
                ))
            })
        };
        let (batch, num_heads, q_len, head_dim) = parse("q", q)?;
        let (kb, kh, k_len, kd) = parse("k", k)?;
        let (vb, vh, v_len, vd) = parse("v", v)?;

        if kb != batch || vb != batch {
            return Err(AttentionError::shape(format!(
                "batch mismatch: q={batch} k={kb} v={vb}"
            )));
        }
        if kd != head_dim || vd != head_dim {
            return Err(AttentionError::shape(format!(
                "head_dim mismatch: q={head_dim} k={kd} v={vd}"
            )));
        }
        if kh != vh || k_len != v_len {
            return Err(AttentionError::shape(format!(
                "k and v disagree: k heads={kh} len={k_len}, v heads={vh} len={v_len}"
            )));
        }
        if kh == 0 || num_heads % kh != 0 {
            return Err(AttentionError::shape(format!(
                "query heads ({num_heads}) must be a multiple of key/value heads ({kh})"
            )));
        }

        Ok(Self {
            batch,
            num_heads,
            num_kv_heads: kh,
            q_len,
            kv_len: k_len,
            head_dim,
        })
    }

    /// Number of query heads sharing one key/value head.
    pub fn group_size(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    /// Key/value head read by query head `head`.
    #[inline]
    pub fn kv_head(&self, head: usize) -> usize {
        head / self.group_size()
    }

    pub fn expect_supported_head_dim(&self) -> Result<(), AttentionError> {
        if SUPPORTED_HEAD_DIMS.contains(&self.head_dim) {
            Ok(())
        } else {
            Err(AttentionError::unsupported(format!(
                "head_dim {} (supported: {SUPPORTED_HEAD_DIMS:?})",
                self.head_dim
            )))
        }
    }
}

/// Checks `q`, `k`, `v` share device and dtype and that the dtype is a float
/// type the kernels accept. Returns the shared dtype.
pub fn expect_matching_inputs(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<DType, AttentionError> {
    let device = q.device();
    if !device.same_device(k.device()) || !device.same_device(v.device()) {
        return Err(AttentionError::shape("q, k, v must reside on the same device"));
    }
    let dtype = q.dtype();
    if dtype != k.dtype() || dtype != v.dtype() {
        return Err(AttentionError::shape("q, k, v must share the same dtype"));
    }
    if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("{dtype:?}"),
        });
    }
    Ok(dtype)
}
