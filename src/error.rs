//! Error types for the dynamics model.

use thiserror::Error;

/// Errors raised by the dynamics core.
#[derive(Debug, Error)]
pub enum DynamicsError {
    /// Tensor dimensions disagree with the model or with each other.
    #[error("Shape mismatch for {what}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Training forward pass called without target indices.
    #[error("Target indices are required when training mode is active")]
    MissingTargets,

    /// Configuration error
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Argument outside the accepted domain
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Horizon cells still masked after the finalization pass.
    #[error("{remaining} horizon positions remain masked after decoding")]
    UnresolvedPositions { remaining: usize },

    /// Categorical sampling failed
    #[error("Sampling error: {0}")]
    Sampling(String),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

/// Result type for dynamics operations
pub type Result<T> = std::result::Result<T, DynamicsError>;

impl DynamicsError {
    pub(crate) fn shape(what: &'static str, expected: &[usize], got: &[usize]) -> Self {
        Self::ShapeMismatch {
            what,
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}
