//! Error types for tensor_grad.

use thiserror::Error;

/// Errors raised by tensor construction, operations and the backward pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TensorError {
    /// Incompatible shapes, bad axes, out-of-bounds indexing or a non-scalar backward seed.
    #[error("shape error: {0}")]
    Shape(String),

    /// `backward` was requested on a tensor that is not part of any computation graph.
    #[error("gradient tracking disabled: {0}")]
    GradientTrackingDisabled(String),

    /// Gradients were requested for a tensor whose element type is not floating point.
    #[error("dtype error: {0}")]
    Dtype(String),

    /// A malformed argument that is not a shape problem (zero step, k = 0, non-binary mask).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl TensorError {
    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        TensorError::Shape(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        TensorError::InvalidArgument(msg.into())
    }
}

impl From<ndarray::ShapeError> for TensorError {
    fn from(e: ndarray::ShapeError) -> Self {
        TensorError::Shape(e.to_string())
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, TensorError>;
