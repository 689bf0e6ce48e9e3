//! Bridges between Candle tensors and the host views read by the kernels.

pub mod staging;
pub mod types;

pub use staging::StagedQkv;
pub use types::{
    expect_matching_inputs, AttentionDType, AttentionShape, QkvLayout, SUPPORTED_HEAD_DIMS,
};
