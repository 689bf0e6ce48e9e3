//! Row-by-row flash forward in `f64`.
//!
//! Evaluates every score of a row, applies alibi, the hard mask and the
//! dropout decisions, and normalises once. Used to check the tiled kernels,
//! which never see a full row at once. Dropout decisions are re-derived from
//! the raw Philox words here rather than through [`DropoutParams::keep`].

use candle_core::Tensor;
use runtime::philox::{philox, DROPOUT_ROUNDS};

use crate::core::AttentionError;
use crate::dropout::DropoutParams;
use crate::flash::FlashProblem;
use crate::interop::{QkvLayout, StagedQkv};
use crate::masks::AlibiSlopes;
use crate::tile::dot;

/// Dense outputs in the flash layouts.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseAttention {
    /// `(batch, seq_len_q, heads, head_dim)`, row-major.
    pub output: Vec<f32>,
    /// `(batch, heads, seq_len_q)`.
    pub lse: Vec<f32>,
}

pub fn dense_flash_forward(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    problem: &FlashProblem,
    alibi: Option<&AlibiSlopes>,
    dropout: Option<&DropoutParams>,
) -> Result<DenseAttention, AttentionError> {
    let staged = StagedQkv::stage(QkvLayout::SeqMajor, q, k, v)?;
    let (qv, kv, vv) = (staged.q()?, staged.k()?, staged.v()?);
    let shape = &problem.shape;
    let (sq, sk, d, heads) = (shape.q_len, shape.kv_len, shape.head_dim, shape.num_heads);
    let scale = f64::from(problem.softmax_scale);

    let mut output = vec![0.0f32; shape.batch * sq * heads * d];
    let mut lse = vec![f32::NEG_INFINITY; shape.batch * heads * sq];
    let mut scores = vec![f64::NEG_INFINITY; sk];
    let mut acc = vec![0.0f64; d];

    for b in 0..shape.batch {
        for h in 0..heads {
            let hk = shape.kv_head(h);
            let slope = alibi.map_or(0.0, |a| f64::from(a.slope(b, h)));
            for row in 0..sq {
                let window = problem.mask.row_window(row);
                let q_row = qv.lane([b, row, h, 0]);
                for (col, score) in scores.iter_mut().enumerate() {
                    *score = if window.contains(col) {
                        let raw = f64::from(dot(q_row, kv.lane([b, col, hk, 0])));
                        raw * scale - slope * col.abs_diff(row) as f64
                    } else {
                        f64::NEG_INFINITY
                    };
                }
                let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                if max == f64::NEG_INFINITY {
                    continue;
                }
                let sum: f64 = scores.iter().map(|s| (s - max).exp()).sum();
                lse[(b * heads + h) * sq + row] = (max + sum.ln()) as f32;

                acc.iter_mut().for_each(|a| *a = 0.0);
                for (col, score) in scores.iter().enumerate() {
                    let mut weight = (score - max).exp() / sum;
                    if let Some(dropout) = dropout {
                        weight = if philox_keeps(dropout, b * heads + h, row, col) {
                            weight * f64::from(dropout.rp_keep())
                        } else {
                            0.0
                        };
                    }
                    if weight == 0.0 {
                        continue;
                    }
                    for (a, &x) in acc.iter_mut().zip(vv.lane([b, col, hk, 0])) {
                        *a += weight * f64::from(x);
                    }
                }
                let dst = ((b * sq + row) * heads + h) * d;
                for (o, a) in output[dst..dst + d].iter_mut().zip(&acc) {
                    *o = *a as f32;
                }
            }
        }
    }

    Ok(DenseAttention { output, lse })
}

/// Keep decision for `(row, col)` of head `batch_head`: byte `row % 16` of
/// the draw at subsequence `(row / 16) | (col / 32) << 32` and offset
/// `base + batch_head * 32 + col % 32`, kept when below `floor((1 - p) * 255)`.
fn philox_keeps(dropout: &DropoutParams, batch_head: usize, row: usize, col: usize) -> bool {
    let subsequence = ((col as u64 / 32) << 32) | (row as u64 / 16);
    let offset = dropout.offset() + (batch_head as u64) * 32 + (col as u64 % 32);
    let words = philox::<DROPOUT_ROUNDS>(dropout.seed(), subsequence, offset);
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    let threshold = ((1.0 - dropout.p()) * 255.0).floor() as u8;
    bytes[row % 16] < threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime::PhiloxReservation;

    fn params(p: f32, seed: u64, offset: u64) -> DropoutParams {
        DropoutParams::new(p, PhiloxReservation { seed, offset, len: 128 }).unwrap()
    }

    #[test]
    fn raw_philox_decisions_match_pinned_values() {
        let dropout = params(0.5, 0x5eed, 64);
        assert!(philox_keeps(&dropout, 0, 0, 0));
        assert!(!philox_keeps(&dropout, 0, 1, 0));
        assert!(philox_keeps(&dropout, 0, 17, 40));
        assert!(!philox_keeps(&dropout, 1, 31, 33));
        assert!(philox_keeps(&dropout, 3, 15, 31));
    }

    #[test]
    fn raw_philox_decisions_agree_with_kernel_rule() {
        let dropout = params(0.3, 17, 32);
        for batch_head in 0..3 {
            for row in (0..70).step_by(3) {
                for col in (0..100).step_by(7) {
                    assert_eq!(
                        philox_keeps(&dropout, batch_head, row, col),
                        dropout.keep(batch_head, row, col),
                        "({batch_head}, {row}, {col})"
                    );
                }
            }
        }
    }
}
