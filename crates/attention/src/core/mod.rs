//! Core traits and types shared across attention implementations.
//!
//! Implementations operate on tensors with layout
//! `[batch, n_heads, seq_len, head_dim]`. The output tensor mirrors the query
//! layout, and reductions accumulate in `f32` regardless of the incoming
//! dtype (`bf16`, `f16`, or `f32`).

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::Config;
pub use errors::AttentionError;

/// Unified interface for attention kernels.
///
/// * `q` is `[batch, n_heads, q_len, head_dim]`; `k` and `v` are
///   `[batch, n_kv_heads, k_len, head_dim]` with `n_heads % n_kv_heads == 0`.
/// * The returned tensor mirrors the layout and dtype of `q`.
/// * Masks, when present, are additive and shaped
///   `[batch | 1, n_heads | 1, q_len, k_len]`.
/// * Causal masking and dropout are controlled through [`Config`].
pub trait Attention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError>;
}
