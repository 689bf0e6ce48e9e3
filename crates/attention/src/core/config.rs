//! Configuration options shared by all attention implementations.
//!
//! The [`Config`] struct captures run-time knobs that callers can tune
//! without swapping implementations.

/// Configuration driving attention behaviour.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    /// Probability for dropout applied to attention weights during training.
    ///
    /// When `None`, dropout is disabled and the computation is deterministic.
    pub dropout_p: Option<f32>,
    /// Restrict each query row `i` to keys `0..=i` (top-left alignment).
    pub causal: bool,
    /// Softmax scale; defaults to `1 / sqrt(head_dim)`.
    pub scale: Option<f32>,
}

impl Config {
    pub fn causal() -> Self {
        Self {
            causal: true,
            ..Self::default()
        }
    }

    /// Scale applied to `q · k` before the softmax.
    pub fn softmax_scale(&self, head_dim: usize) -> f32 {
        self.scale
            .unwrap_or_else(|| 1.0 / (head_dim as f32).sqrt())
    }
}
