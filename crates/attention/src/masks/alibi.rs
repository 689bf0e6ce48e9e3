//! Alibi positional bias.
//!
//! Alibi is a soft penalty rather than a hard mask: the score of key `col`
//! for query `row` drops by `slope * |col - row|` in the softmax domain.

use candle_core::{DType, Tensor};

use crate::core::AttentionError;
use crate::tile::ScoreTile;

/// Per-head (optionally per-batch) alibi slopes.
#[derive(Debug, Clone, PartialEq)]
pub struct AlibiSlopes {
    slopes: Vec<f32>,
    heads: usize,
    per_batch: bool,
}

impl AlibiSlopes {
    /// Slopes shared by every batch element.
    pub fn per_head(slopes: Vec<f32>) -> Self {
        let heads = slopes.len();
        Self {
            slopes,
            heads,
            per_batch: false,
        }
    }

    /// Accepts `(heads,)` or `(batch, heads)` tensors.
    pub fn from_tensor(tensor: &Tensor, batch: usize, heads: usize) -> Result<Self, AttentionError> {
        let per_batch = match tensor.dims() {
            [h] if *h == heads => false,
            [b, h] if *b == batch && *h == heads => true,
            other => {
                return Err(AttentionError::shape(format!(
                    "alibi slopes must be ({heads},) or ({batch}, {heads}), got {other:?}"
                )))
            }
        };
        let slopes = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        Ok(Self {
            slopes,
            heads,
            per_batch,
        })
    }

    /// The geometric sequence `2^(-8 i / n)` used by the alibi paper, for
    /// `n` a power of two.
    pub fn geometric(heads: usize) -> Self {
        let ratio = 2f32.powf(-8.0 / heads.max(1) as f32);
        Self::per_head((1..=heads).map(|i| ratio.powi(i as i32)).collect())
    }

    #[inline]
    pub fn slope(&self, batch: usize, head: usize) -> f32 {
        if self.per_batch {
            self.slopes[batch * self.heads + head]
        } else {
            self.slopes[head]
        }
    }
}

/// Subtracts `penalty * |col - row|` from every score of the tile.
///
/// Callers pass `slope / softmax_scale` because kernels scale scores after
/// the bias is applied.
pub fn apply_alibi(tile: &mut ScoreTile, penalty: f32, row_start: usize, col_start: usize) {
    for r in 0..tile.rows() {
        let row = row_start + r;
        for (c, score) in tile.row_mut(r).iter_mut().enumerate() {
            let distance = (col_start + c).abs_diff(row) as f32;
            *score -= penalty * distance;
        }
    }
}
