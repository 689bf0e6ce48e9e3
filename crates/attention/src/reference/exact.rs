//! Reference attention built from dense Candle ops.
//!
//! Mirrors the semantics of the [`Attention`](crate::core::Attention) trait:
//! heads-major inputs, grouped key/value heads, top-left causal masking and
//! an optional additive mask broadcast over batch and heads.

use std::sync::OnceLock;

use candle_core::{DType, Tensor};
use candle_nn::ops::{dropout, softmax_last_dim};

use crate::core::{Attention, AttentionError, Config};
use crate::interop::{expect_matching_inputs, AttentionShape, QkvLayout};
use crate::masks::{build_causal_mask, MASK_DTYPE};

#[derive(Debug, Default)]
pub struct ExactAttention {
    first_call: OnceLock<()>,
}

impl ExactAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        let dtype = expect_matching_inputs(q, k, v)?;
        let shape = AttentionShape::from_qkv(QkvLayout::HeadsMajor, q, k, v)?;

        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init causal={} dropout={:?} scale={:?}",
                config.causal,
                config.dropout_p,
                config.scale
            );
        }

        let group = shape.group_size();
        let q_work = q.to_dtype(DType::F32)?.contiguous()?;
        let k_work = repeat_kv(&k.to_dtype(DType::F32)?, group)?;
        let v_work = repeat_kv(&v.to_dtype(DType::F32)?, group)?;

        let scale = config.softmax_scale(shape.head_dim);
        let k_t = k_work.t()?.contiguous()?;
        let mut scores = q_work.matmul(&k_t)?.affine(f64::from(scale), 0.0)?;

        if config.causal {
            let causal = build_causal_mask(q.device(), 1, 1, shape.q_len, shape.kv_len)?;
            scores = scores.broadcast_add(&causal)?;
        }
        if let Some(mask) = mask {
            expect_additive_mask(mask, &shape)?;
            scores = scores.broadcast_add(&mask.to_device(q.device())?)?;
        }

        let mut probs = softmax_last_dim(&scores.contiguous()?)?;
        if let Some(p) = config.dropout_p {
            if !(0.0..1.0).contains(&p) {
                return Err(AttentionError::unsupported(format!(
                    "dropout probability must be in [0, 1), got {p}"
                )));
            }
            if p > 0.0 {
                probs = dropout(&probs, p)?;
            }
        }

        Ok(probs.matmul(&v_work)?.to_dtype(dtype)?)
    }
}

/// Expands `[batch, kv_heads, seq, dim]` to `[batch, kv_heads * group, seq, dim]`
/// so query head `h` reads key/value head `h / group`.
pub(crate) fn repeat_kv(t: &Tensor, group: usize) -> candle_core::Result<Tensor> {
    if group == 1 {
        return t.contiguous();
    }
    let (b, hk, s, d) = t.dims4()?;
    t.unsqueeze(2)?
        .broadcast_as((b, hk, group, s, d))?
        .reshape((b, hk * group, s, d))
}

/// Additive masks are `[batch | 1, heads | 1, q_len, k_len]` in [`MASK_DTYPE`].
pub(crate) fn expect_additive_mask(mask: &Tensor, shape: &AttentionShape) -> Result<(), AttentionError> {
    if mask.dtype() != MASK_DTYPE {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("mask expects dtype {MASK_DTYPE:?}, got {:?}", mask.dtype()),
        });
    }
    let (mb, mh, mq, mk) = mask.dims4().map_err(|_| {
        AttentionError::shape("mask must have shape [batch|1, heads|1, q_len, k_len]")
    })?;
    let batch_ok = mb == 1 || mb == shape.batch;
    let heads_ok = mh == 1 || mh == shape.num_heads;
    if !batch_ok || !heads_ok || mq != shape.q_len || mk != shape.kv_len {
        return Err(AttentionError::shape(format!(
            "mask shape mismatch: expected [1|{}, 1|{}, {}, {}] got [{mb}, {mh}, {mq}, {mk}]",
            shape.batch, shape.num_heads, shape.q_len, shape.kv_len
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::padding_mask_from_lengths;
    use candle_core::{Device, Result as CandleResult};

    fn build_inputs(device: &Device) -> CandleResult<(Tensor, Tensor, Tensor)> {
        let data: Vec<f32> = (0..64).map(|i| ((i * 7) % 13) as f32 * 0.05).collect();
        let q = Tensor::from_vec(data.clone(), (1, 2, 4, 8), device)?;
        let k = Tensor::from_vec(data.iter().rev().copied().collect::<Vec<_>>(), (1, 2, 4, 8), device)?;
        let v = Tensor::from_vec(data, (1, 2, 4, 8), device)?;
        Ok((q, k, v))
    }

    fn naive_attention(
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        causal: bool,
    ) -> CandleResult<Tensor> {
        let (batch, heads, q_len, head_dim) = q.dims4()?;
        let (_, kv_heads, k_len, _) = k.dims4()?;
        let group = heads / kv_heads;
        let mut output = vec![0f32; batch * heads * q_len * head_dim];

        let q_vec = q.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let k_vec = k.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let v_vec = v.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let mask_vec = match mask {
            Some(m) => Some(m.flatten_all()?.to_vec1::<f32>()?),
            None => None,
        };
        let scale = 1.0 / (head_dim as f32).sqrt();

        for b in 0..batch {
            for h in 0..heads {
                let hk = h / group;
                for q_idx in 0..q_len {
                    let mut row = vec![f32::NEG_INFINITY; k_len];
                    for (k_idx, slot) in row.iter_mut().enumerate() {
                        if causal && k_idx > q_idx {
                            continue;
                        }
                        let mut dot = 0f32;
                        for d in 0..head_dim {
                            let qi = ((b * heads + h) * q_len + q_idx) * head_dim + d;
                            let ki = ((b * kv_heads + hk) * k_len + k_idx) * head_dim + d;
                            dot += q_vec[qi] * k_vec[ki];
                        }
                        dot *= scale;
                        if let Some(mask_vec) = &mask_vec {
                            dot += mask_vec[(b * q_len + q_idx) * k_len + k_idx];
                        }
                        *slot = dot;
                    }
                    let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    let weights: Vec<f32> = row.iter().map(|s| (s - max_val).exp()).collect();
                    let denom: f32 = weights.iter().sum();
                    for d in 0..head_dim {
                        let mut acc = 0f32;
                        for (k_idx, w) in weights.iter().enumerate() {
                            let vi = ((b * kv_heads + hk) * k_len + k_idx) * head_dim + d;
                            acc += w / denom * v_vec[vi];
                        }
                        output[((b * heads + h) * q_len + q_idx) * head_dim + d] = acc;
                    }
                }
            }
        }

        Tensor::from_vec(output, (batch, heads, q_len, head_dim), q.device())
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> CandleResult<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    #[test]
    fn exact_attention_matches_naive() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let attention = ExactAttention::default();

        let output = attention.attend(&q, &k, &v, None, &Config::causal()).unwrap();
        let expected = naive_attention(&q, &k, &v, None, true)?;
        assert!(max_diff(&output, &expected)? < 1e-4);

        let mask = padding_mask_from_lengths(&device, &[3], 1, 4, 4)?;
        let output = attention.attend(&q, &k, &v, Some(&mask), &Config::default()).unwrap();
        let expected = naive_attention(&q, &k, &v, Some(&mask), false)?;
        assert!(max_diff(&output, &expected)? < 1e-4);
        Ok(())
    }

    #[test]
    fn grouped_heads_share_key_value_heads() -> CandleResult<()> {
        let device = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (1, 4, 3, 8), &device)?;
        let k = Tensor::randn(0f32, 1.0, (1, 2, 5, 8), &device)?;
        let v = Tensor::randn(0f32, 1.0, (1, 2, 5, 8), &device)?;
        let output = ExactAttention::default()
            .attend(&q, &k, &v, None, &Config::default())
            .unwrap();
        let expected = naive_attention(&q, &k, &v, None, false)?;
        assert!(max_diff(&output, &expected)? < 1e-4);
        Ok(())
    }

    #[test]
    fn mismatched_shapes_error() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let k = Tensor::zeros((1, 2, 5, 8), DType::F32, &device).unwrap();
        let v = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let err = ExactAttention::default()
            .attend(&q, &k, &v, None, &Config::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }

    #[test]
    fn mask_shape_validation() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let k = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let v = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let mask = Tensor::zeros((1, 3, 4, 4), DType::F32, &device).unwrap();
        let err = ExactAttention::default()
            .attend(&q, &k, &v, Some(&mask), &Config::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }

    #[test]
    fn dtype_matrix() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let reference = ExactAttention::default()
            .attend(&q, &k, &v, None, &Config::causal())
            .unwrap();
        for dtype in [DType::F32, DType::BF16, DType::F16] {
            let out = ExactAttention::default()
                .attend(
                    &q.to_dtype(dtype)?,
                    &k.to_dtype(dtype)?,
                    &v.to_dtype(dtype)?,
                    None,
                    &Config::causal(),
                )
                .unwrap();
            assert_eq!(out.dtype(), dtype);
            let max = max_diff(&out, &reference)?;
            assert!(max < 5e-2, "dtype {dtype:?} diverged by {max}");
        }
        Ok(())
    }

    #[test]
    fn dropout_zero_probability_is_noop() {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device).unwrap();
        let config = Config {
            dropout_p: Some(0.0),
            ..Config::default()
        };
        let out = ExactAttention::default().attend(&q, &k, &v, None, &config).unwrap();
        let reference = ExactAttention::default()
            .attend(&q, &k, &v, None, &Config::default())
            .unwrap();
        assert!(max_diff(&out, &reference).unwrap() < 1e-6);
    }
}
