//! Request parameters and their normalisation into a launchable problem.

use candle_core::Tensor;
use runtime::SplitKvPolicy;

use crate::core::AttentionError;
use crate::interop::AttentionShape;
use crate::masks::MaskPolicy;

/// Options of one flash forward call.
///
/// Windows are measured in keys relative to the query's diagonal; `None`
/// leaves a side unbounded. Sequences are aligned bottom-right, so with
/// `seqlen_k > seqlen_q` the last query row sees the last key.
#[derive(Debug, Clone, Default)]
pub struct FlashParams {
    pub dropout_p: f32,
    pub causal: bool,
    pub window_left: Option<usize>,
    pub window_right: Option<usize>,
    pub softmax_scale: Option<f32>,
    /// `(heads,)` or `(batch, heads)` slopes.
    pub alibi_slopes: Option<Tensor>,
    /// Also return the per-block probabilities with dropped entries negated.
    pub return_debug_probs: bool,
    /// Cumulative query lengths for packed variable-length batches.
    pub cum_seqlens_q: Option<Tensor>,
    pub cum_seqlens_k: Option<Tensor>,
    pub split_kv: SplitKvPolicy,
}

impl FlashParams {
    pub fn causal() -> Self {
        Self {
            causal: true,
            ..Self::default()
        }
    }

    pub fn with_dropout(mut self, p: f32) -> Self {
        self.dropout_p = p;
        self
    }

    pub fn with_window(mut self, left: Option<usize>, right: Option<usize>) -> Self {
        self.window_left = left;
        self.window_right = right;
        self
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.softmax_scale = Some(scale);
        self
    }

    pub fn with_alibi(mut self, slopes: Tensor) -> Self {
        self.alibi_slopes = Some(slopes);
        self
    }

    pub fn with_debug_probs(mut self) -> Self {
        self.return_debug_probs = true;
        self
    }

    pub fn with_split_kv(mut self, policy: SplitKvPolicy) -> Self {
        self.split_kv = policy;
        self
    }
}

/// Fully resolved problem handed to the configuration strategy and kernels.
#[derive(Debug, Clone, PartialEq)]
pub struct FlashProblem {
    pub shape: AttentionShape,
    pub softmax_scale: f32,
    pub mask: MaskPolicy,
    pub has_alibi: bool,
    pub dropout_p: f32,
    pub return_debug_probs: bool,
}

impl FlashProblem {
    /// Checks preconditions and applies the window/causal adjustments:
    ///
    /// * windows at least `seqlen_k` wide are unbounded;
    /// * a single query row without alibi needs no causal mask;
    /// * causal with a left window becomes a local window with no right side.
    pub fn resolve(shape: AttentionShape, params: &FlashParams) -> Result<Self, AttentionError> {
        if params.cum_seqlens_q.is_some() || params.cum_seqlens_k.is_some() {
            return Err(AttentionError::unsupported(
                "variable-length batching through cumulative sequence lengths",
            ));
        }
        shape.expect_supported_head_dim()?;

        let p = params.dropout_p;
        if !(0.0..1.0).contains(&p) {
            return Err(AttentionError::unsupported(format!(
                "dropout probability must be in [0, 1), got {p}"
            )));
        }
        if params.return_debug_probs && p == 0.0 {
            return Err(AttentionError::unsupported(
                "debug probabilities are only produced when dropout_p > 0",
            ));
        }
        if let Some(scale) = params.softmax_scale {
            if !scale.is_finite() || scale <= 0.0 {
                return Err(AttentionError::unsupported(format!(
                    "softmax scale must be positive and finite, got {scale}"
                )));
            }
        }

        let seqlen_k = shape.kv_len;
        let left = params.window_left.filter(|&w| w < seqlen_k);
        let right = params.window_right.filter(|&w| w < seqlen_k);
        let has_alibi = params.alibi_slopes.is_some();
        let causal = params.causal && !(shape.q_len == 1 && !has_alibi);

        let base = MaskPolicy::new(shape.q_len, seqlen_k);
        let mask = match (causal, left) {
            (true, None) => base.with_causal(true),
            (true, Some(left)) => base.with_window(Some(left), Some(0)),
            (false, _) => base.with_window(left, right),
        };

        Ok(Self {
            softmax_scale: params
                .softmax_scale
                .unwrap_or_else(|| 1.0 / (shape.head_dim as f32).sqrt()),
            shape,
            mask,
            has_alibi,
            dropout_p: p,
            return_debug_probs: params.return_debug_probs,
        })
    }

    pub fn is_dropout(&self) -> bool {
        self.dropout_p > 0.0
    }
}
