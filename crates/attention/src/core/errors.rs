//! Error types emitted by attention implementations.

use runtime::RuntimeError;
use thiserror::Error;

/// Attention-specific error category.
///
/// Every precondition is checked on the host before a kernel is launched, so
/// an error never leaves partially written outputs behind.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape for {context}")]
    InvalidShape { context: String },
    /// The kernel does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// The request combines features the kernels do not implement.
    #[error("unsupported configuration: {context}")]
    Unsupported { context: String },
    /// A backend-specific failure propagated to the caller.
    #[error("{message}")]
    Backend { message: String },
}

impl AttentionError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::InvalidShape {
            context: context.into(),
        }
    }

    pub(crate) fn unsupported(context: impl Into<String>) -> Self {
        Self::Unsupported {
            context: context.into(),
        }
    }
}

impl From<candle_core::Error> for AttentionError {
    fn from(err: candle_core::Error) -> Self {
        Self::Backend {
            message: err.to_string(),
        }
    }
}

impl From<RuntimeError> for AttentionError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::InvalidLayout { context } => Self::InvalidShape { context },
            other => Self::Backend {
                message: other.to_string(),
            },
        }
    }
}
