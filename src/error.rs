//! Error types for groupq-rs.

use thiserror::Error;

/// Result type alias for groupq-rs operations.
pub type Result<T> = std::result::Result<T, GroupQuantError>;

/// Errors that can occur in groupq-rs operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GroupQuantError {
    /// The group size does not fit the matrix or the 4-codes-per-word packing.
    #[error("invalid group size {group_size} for {columns} columns: {reason}")]
    InvalidGroupSize {
        /// Column count of the matrix being compressed
        columns: usize,
        /// Requested group size
        group_size: usize,
        /// Which constraint was violated
        reason: &'static str,
    },

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Shape mismatch.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// A NaN or infinity in the input matrix.
    #[error("non-finite value at row {row}, column {column}")]
    NonFiniteValue {
        /// Row of the offending value
        row: usize,
        /// Column of the offending value
        column: usize,
    },

    /// Group metadata that cannot be represented in f16.
    #[error("value out of range: {0}")]
    ValueOutOfRange(String),

    /// A tensor was requested by name and not found.
    #[error("missing tensor: {0}")]
    MissingTensor(String),

    /// Native packed-checkpoint format error.
    #[error("native format error: {0}")]
    NativeFormat(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML configuration error.
    #[error("config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl GroupQuantError {
    /// Whether this error is the group-size validation failure.
    #[must_use]
    pub fn is_invalid_group_size(&self) -> bool {
        matches!(self, Self::InvalidGroupSize { .. })
    }
}
