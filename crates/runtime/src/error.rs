//! Error type shared by the runtime helpers.

use thiserror::Error;

/// Failures raised while staging tensors, selecting configurations or loading
/// settings.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A view or host buffer does not match the documented layout.
    #[error("invalid layout: {context}")]
    InvalidLayout { context: String },
    /// A configuration table was queried without any candidates.
    #[error("configuration table `{table}` has no candidates")]
    EmptyConfigTable { table: &'static str },
    /// Settings failed validation.
    #[error("invalid settings: {}", .0.join("; "))]
    Validation(Vec<String>),
    /// Settings file has an extension we cannot parse.
    #[error("unsupported settings format: {0}")]
    ConfigFormat(String),
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML settings: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to parse JSON settings: {0}")]
    Json(#[from] serde_json::Error),
    /// Error bubbled up from Candle while moving tensors to or from the host.
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl RuntimeError {
    pub fn layout(context: impl Into<String>) -> Self {
        Self::InvalidLayout {
            context: context.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
