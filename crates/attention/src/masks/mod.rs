//! Mask utilities shared by attention implementations.
//!
//! Two flavours live here. The dense builders produce additive tensors with
//! dtype `f32`, shaped `[batch, num_heads, q_len, k_len]`, holding `0.0`
//! (keep) or `f32::NEG_INFINITY` (discard); they feed the additive-mask
//! argument of the SDPA path. [`MaskPolicy`] and [`apply_alibi`] are the
//! in-kernel forms used by the flash kernels, evaluated tile by tile.

pub mod alibi;
pub mod causal;
pub mod padding;
pub mod window;

use candle_core::DType;

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

pub use alibi::{apply_alibi, AlibiSlopes};
pub use causal::{build_causal_mask, build_policy_mask};
pub use padding::{padding_mask_from_booleans, padding_mask_from_lengths};
pub use window::{apply_row_window, MaskPolicy, RowWindow};
