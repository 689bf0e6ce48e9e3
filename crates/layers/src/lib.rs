//! Layer normalisation kernels.
//!
//! [`norm::layer_norm_forward`] normalises every row of the trailing
//! `normalized_shape` axes and returns the `f32` per-row mean and reciprocal
//! standard deviation alongside the output. [`norm::layer_norm_backward`]
//! consumes those statistics and returns the input, weight and bias gradients.
//!
//! Both directions pick a kernel variant by row width: narrow rows are kept
//! whole inside a persistent program, wide rows are walked in column tiles.
//! The thresholds come from [`runtime::settings::LayerNormSettings`].

pub mod checks;
pub mod dtypes;
pub mod norm;

use runtime::RuntimeError;
use thiserror::Error;

pub use norm::{
    layer_norm_backward, layer_norm_forward, LayerNorm, LayerNormGrads, LayerNormKernels,
    LayerNormOutput, NormConfig,
};

/// Errors raised while validating or running the layer norm kernels.
#[derive(Debug, Error)]
pub enum LayerError {
    #[error("invalid shape: {context}")]
    Shape { context: String },

    #[error("unsupported: {context}")]
    Unsupported { context: String },

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl LayerError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::Shape {
            context: context.into(),
        }
    }

    pub(crate) fn unsupported(context: impl Into<String>) -> Self {
        Self::Unsupported {
            context: context.into(),
        }
    }
}
