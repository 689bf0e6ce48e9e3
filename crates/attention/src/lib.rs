//! Tiled attention kernels for the gems workspace.
//!
//! Two public entry points live here:
//!
//! * [`sdpa::scaled_dot_product_attention`] takes tensors laid out as
//!   `[batch, n_heads, seq_len, head_dim]`, supports an additive mask and
//!   top-left aligned causal masking, and is also exposed through the
//!   [`Attention`] trait as [`sdpa::TiledAttention`].
//! * [`flash::flash_attention_forward`] takes `[batch, seq_len, n_heads,
//!   head_dim]` tensors and supports bottom-right causal alignment, sliding
//!   windows, alibi slopes, Philox dropout and split-KV parallelism. It also
//!   returns the per-row log-sum-exp and the generator state it consumed.
//!
//! Both kernels accumulate in `f32` with an online softmax, so the key axis
//! is never materialised in full. Reduced precision inputs (`bf16`, `f16`)
//! are promoted on load and outputs are cast back to the input dtype.
//!
//! [`reference::ExactAttention`] computes the same quantities with dense
//! Candle ops and serves as the oracle for tests and the correctness bench.

pub mod core;
pub mod dropout;
pub mod flash;
pub mod interop;
pub mod masks;
pub mod reference;
pub mod sdpa;
pub mod softmax;
pub mod tile;

pub use core::{Attention, AttentionError, Config};
pub use flash::{flash_attention_forward, FlashOutput, FlashParams};
pub use sdpa::{scaled_dot_product_attention, TiledAttention};
