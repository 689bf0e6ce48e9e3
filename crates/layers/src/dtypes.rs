//! Precision policy of the normalisation kernels.
//!
//! Inputs and parameters may be stored in `f16`/`bf16`, but every kernel
//! promotes on load and accumulates in `f32`. Statistics (`mean`, `rstd`)
//! stay in the reduction dtype; outputs and gradients are cast back to the
//! storage dtype of the tensor they mirror.

use candle_core::DType;

/// Floating point dtypes accepted by the normalisation kernels.
pub const NORM_DTYPES: [DType; 3] = [DType::F32, DType::F16, DType::BF16];

/// Epsilon values used for comparisons at different stages of a computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrecisionEpsilons {
    /// Tolerance for values rounded to the storage dtype.
    pub storage: f32,
    /// Tolerance for statistics computed during reductions.
    pub reduction: f32,
}

/// Describes how tensors are cast around a kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    /// Builds a policy from the dtype of the incoming activations.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        Self {
            storage,
            reduction: DType::F32,
        }
    }

    /// Returns the dtype used for outputs and gradients.
    pub fn storage(&self) -> DType {
        self.storage
    }

    /// Returns the dtype of the per-row statistics.
    pub fn reduction(&self) -> DType {
        self.reduction
    }

    /// Indicates whether the policy performs mixed precision work.
    pub fn is_mixed_precision(&self) -> bool {
        self.storage != self.reduction
    }

    /// Tolerance values derived from the configured dtypes.
    pub fn epsilons(&self) -> PrecisionEpsilons {
        PrecisionEpsilons {
            storage: epsilon_for(self.storage),
            reduction: epsilon_for(self.reduction),
        }
    }
}

fn epsilon_for(dtype: DType) -> f32 {
    match dtype {
        DType::BF16 => 2e-2,
        DType::F16 => 5e-3,
        DType::F32 => 1e-5,
        DType::F64 => 1e-7,
        _ => 0.0,
    }
}
