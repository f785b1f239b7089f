//! Optimizers.
//!
//! Parameters of different ranks are updated one tensor at a time through
//! [`Optimizer::update`]; [`crate::nn::Module::apply_gradients`] drives the loop.

pub mod sgd;
pub use sgd::Sgd;

use crate::tensor::{Cpu, Result, Tensor, TensorElem};

/// A rule for turning a gradient into a parameter update.
pub trait Optimizer<T: TensorElem> {
    /// Updates a single parameter tensor in place.
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` if `param` and `grad` differ in shape.
    fn update<const RANK: usize>(
        &self,
        param: &mut Tensor<T, RANK, Cpu>,
        grad: &Tensor<T, RANK, Cpu>,
    ) -> Result<()>;
}
