//! Key padding masks for the SDPA additive-mask argument.
//!
//! Padding depends only on `(batch, key)`, so every query row of a batch
//! element carries the same pattern. Masks are materialised per head to keep
//! the `[batch, num_heads, q_len, k_len]` contract of [`super::MASK_DTYPE`].

use candle_core::{Device, Error, Result, Tensor};

/// Masks keys `len..k_len` of each batch element.
pub fn padding_mask_from_lengths(
    device: &Device,
    key_lengths: &[usize],
    num_heads: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    key_mask(device, key_lengths.len(), num_heads, q_len, k_len, |b, key| {
        key >= key_lengths[b]
    })
}

/// Masks keys flagged `true`. Every batch element must flag the same number
/// of keys.
pub fn padding_mask_from_booleans(
    device: &Device,
    padding: &[Vec<bool>],
    num_heads: usize,
    q_len: usize,
) -> Result<Tensor> {
    let k_len = padding.first().map_or(0, Vec::len);
    if let Some(b) = padding.iter().position(|flags| flags.len() != k_len) {
        return Err(Error::Msg(format!(
            "padding flags for batch {b} cover {} keys, expected {k_len}",
            padding[b].len()
        )));
    }
    key_mask(device, padding.len(), num_heads, q_len, k_len, |b, key| {
        padding[b][key]
    })
}

fn key_mask<F>(
    device: &Device,
    batch: usize,
    num_heads: usize,
    q_len: usize,
    k_len: usize,
    masked: F,
) -> Result<Tensor>
where
    F: Fn(usize, usize) -> bool,
{
    let mut data = Vec::with_capacity(batch * num_heads * q_len * k_len);
    for b in 0..batch {
        let row: Vec<f32> = (0..k_len)
            .map(|key| if masked(b, key) { f32::NEG_INFINITY } else { 0.0 })
            .collect();
        for _ in 0..num_heads * q_len {
            data.extend_from_slice(&row);
        }
    }
    Tensor::from_vec(data, (batch, num_heads, q_len, k_len), device)
}
