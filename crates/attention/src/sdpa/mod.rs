//! Scaled dot-product attention over `[batch, n_heads, seq_len, head_dim]`.
//!
//! Supports an additive mask broadcast over batch and heads, top-left
//! aligned causal masking and grouped key/value heads. Dropout is not
//! implemented by this kernel; requests with `dropout_p > 0` are rejected.

pub mod config;
mod kernel;

use std::sync::OnceLock;

use candle_core::Tensor;
use runtime::host::expect_unit_inner_stride;
use runtime::{ConfigStrategy, HostTensor, StridedView};

use crate::core::{Attention, AttentionError, Config};
use crate::interop::{expect_matching_inputs, AttentionShape, QkvLayout, StagedQkv};
use crate::reference::exact::expect_additive_mask;

pub use config::{default_table, SdpaConfigTable, SdpaKey, SdpaTileConfig, SDPA_CANDIDATES};

use kernel::{run, SdpaInputs};

/// [`Attention`] implementation backed by the tiled SDPA kernel.
#[derive(Debug)]
pub struct TiledAttention {
    table: SdpaConfigTable,
    first_call: OnceLock<()>,
}

impl TiledAttention {
    pub fn new() -> Result<Self, AttentionError> {
        Ok(Self::with_table(default_table()?))
    }

    pub fn with_table(table: SdpaConfigTable) -> Self {
        Self {
            table,
            first_call: OnceLock::new(),
        }
    }

    pub fn table(&self) -> &SdpaConfigTable {
        &self.table
    }
}

impl Attention for TiledAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        let dtype = expect_matching_inputs(q, k, v)?;
        for (name, tensor) in [("q", q), ("k", k), ("v", v)] {
            expect_unit_inner_stride(name, tensor)?;
        }
        let shape = AttentionShape::from_qkv(QkvLayout::HeadsMajor, q, k, v)?;
        shape.expect_supported_head_dim()?;
        if let Some(p) = config.dropout_p {
            if p != 0.0 {
                return Err(AttentionError::unsupported(format!(
                    "sdpa only supports dropout_p = 0, got {p}"
                )));
            }
        }
        let mask_host = match mask {
            Some(mask) => {
                expect_additive_mask(mask, &shape)?;
                Some(HostTensor::from_tensor(mask)?)
            }
            None => None,
        };

        let key = SdpaKey {
            kv_len: shape.kv_len,
            head_dim: shape.head_dim,
        };
        let tile = self.table.choose_config(&key);
        let scale = config.softmax_scale(shape.head_dim);

        if self.first_call.set(()).is_ok() {
            log::info!("attention::sdpa init candidates={}", self.table.candidates().len());
        }
        log::debug!(
            "attention::sdpa forward batch={} heads={}/{} q_len={} kv_len={} head_dim={} causal={} mask={} tile={:?}",
            shape.batch,
            shape.num_heads,
            shape.num_kv_heads,
            shape.q_len,
            shape.kv_len,
            shape.head_dim,
            config.causal,
            mask.is_some(),
            tile
        );

        let staged = StagedQkv::stage(QkvLayout::HeadsMajor, q, k, v)?;
        let inputs = SdpaInputs {
            q: staged.q()?,
            k: staged.k()?,
            v: staged.v()?,
            mask: mask_host
                .as_ref()
                .map(|host| broadcast_mask_view(host, &shape))
                .transpose()?,
        };

        let (b, h, sq, d) = (shape.batch, shape.num_heads, shape.q_len, shape.head_dim);
        let mut out = vec![0.0f32; b * h * sq * d];
        for block in run(&inputs, &shape, scale, config.causal, &tile) {
            let dst = ((block.batch * h + block.head) * sq + block.row_start) * d;
            let src = &block.result.output;
            out[dst..dst + src.len()].copy_from_slice(src);
        }

        let output = HostTensor::from_vec(out, vec![b, h, sq, d], dtype, q.device().clone())?;
        Ok(output.to_tensor()?)
    }
}

/// Views a `[batch | 1, heads | 1, q_len, k_len]` mask as `[batch, heads,
/// q_len, k_len]` with zero strides on the broadcast axes.
fn broadcast_mask_view<'a>(
    host: &'a HostTensor,
    shape: &AttentionShape,
) -> Result<StridedView<'a, 4>, AttentionError> {
    let dims = host.dims();
    let plane = shape.q_len * shape.kv_len;
    let head_stride = if dims[1] == 1 { 0 } else { plane };
    let batch_stride = if dims[0] == 1 { 0 } else { dims[1] * plane };
    Ok(StridedView::new(
        host.data(),
        [shape.batch, shape.num_heads, shape.q_len, shape.kv_len],
        [batch_stride, head_stride, shape.kv_len, 1],
        0,
    )?)
}

/// Runs the tiled SDPA kernel with the default tile table.
pub fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
    config: &Config,
) -> Result<Tensor, AttentionError> {
    TiledAttention::new()?.attend(q, k, v, mask, config)
}
