//! Dense implementations used as oracles for the tiled kernels.
//!
//! These paths favour clarity over performance and materialise the full
//! score matrix.

pub mod dense;
pub mod exact;

pub use dense::{dense_flash_forward, DenseAttention};
pub use exact::ExactAttention;
