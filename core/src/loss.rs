//! Task losses and their combination with MoE auxiliary losses.

use crate::autograd::Variable;
use crate::tensor::{FloatElem, Result};

/// Mean squared error: `mean((pred - target)^2)`.
///
/// # Errors
///
/// `ShapeMismatch` if the shapes differ.
pub fn mse_loss<T: FloatElem + 'static, const RANK: usize>(
    pred: &Variable<T, RANK>,
    target: &Variable<T, RANK>,
) -> Result<Variable<T, 0>> {
    let diff = (pred - target)?;
    Ok((&diff * &diff)?.mean())
}

/// Adds an auxiliary loss to the task loss so one `backward` trains both.
pub fn with_aux<T: FloatElem + 'static>(
    primary: &Variable<T, 0>,
    aux: &Variable<T, 0>,
) -> Result<Variable<T, 0>> {
    primary + aux
}
