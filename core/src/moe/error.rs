use crate::tensor::TensorError;
use thiserror::Error;

/// Errors raised by the MoE layer.
///
/// Configuration and shape problems are reported before any routing happens. Capacity overflow
/// and dropped tokens are not errors.
#[derive(Error, Debug)]
pub enum MoeError {
    /// A configuration value is out of range or inconsistent with another one.
    #[error("Invalid MoE configuration: {0}")]
    InvalidConfig(String),
    /// An input or parameter does not have the width the layer was built for.
    #[error("Dimension mismatch in {context}: expected {expected}, got {got}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        got: usize,
    },
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error("Failed to parse MoE configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to read MoE configuration: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MoeError>;

pub(crate) fn check_dim(context: &'static str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(MoeError::DimensionMismatch {
            context,
            expected,
            got,
        });
    }
    Ok(())
}
