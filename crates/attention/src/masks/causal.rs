//! Dense additive masks for causal and windowed attention.
//!
//! The resulting tensors have dtype [`MASK_DTYPE`](super::MASK_DTYPE) and shape
//! `[batch, num_heads, q_len, k_len]`. Entries are `0.0` where attention is
//! permitted and `f32::NEG_INFINITY` otherwise.

use candle_core::{Device, Result, Tensor};

use super::window::MaskPolicy;

/// Top-left aligned causal mask: query `i` sees keys `0..=i`.
///
/// This is the convention of the SDPA entry point. Flash attention aligns
/// queries to the end of the key sequence instead; use
/// [`build_policy_mask`] for that.
pub fn build_causal_mask(
    device: &Device,
    batch: usize,
    num_heads: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    fill(device, batch, num_heads, q_len, k_len, |q, k| k <= q)
}

/// Dense rendering of a [`MaskPolicy`], including its bottom-right alignment.
pub fn build_policy_mask(
    device: &Device,
    batch: usize,
    num_heads: usize,
    policy: &MaskPolicy,
) -> Result<Tensor> {
    fill(
        device,
        batch,
        num_heads,
        policy.seqlen_q(),
        policy.seqlen_k(),
        |q, k| policy.row_window(q).contains(k),
    )
}

fn fill<F>(
    device: &Device,
    batch: usize,
    num_heads: usize,
    q_len: usize,
    k_len: usize,
    visible: F,
) -> Result<Tensor>
where
    F: Fn(usize, usize) -> bool,
{
    let plane: Vec<f32> = (0..q_len)
        .flat_map(|q| (0..k_len).map(move |k| (q, k)))
        .map(|(q, k)| if visible(q, k) { 0.0 } else { f32::NEG_INFINITY })
        .collect();
    let mut data = Vec::with_capacity(batch * num_heads * plane.len());
    for _ in 0..batch * num_heads {
        data.extend_from_slice(&plane);
    }
    Tensor::from_vec(data, (batch, num_heads, q_len, k_len), device)
}
