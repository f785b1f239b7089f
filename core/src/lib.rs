//! # moe-rs
//!
//! Capacity-constrained Mixture-of-Experts routing on a small CPU tensor and autograd stack.
//!
//! ## Modules
//!
//! - [`mod@tensor`]: N-dimensional tensors with compile-time rank.
//! - [`autograd`]: define-by-run reverse-mode differentiation over [`Variable`]s.
//! - [`nn`]: trainable building blocks (`Linear`, activations, initialization, `Module`).
//! - [`moe`]: gate, token-choice and expert-choice routers, dispatcher, expert FF,
//!   balancing losses, and the assembled [`moe::MoeLayer`].
//! - [`optim`] and [`loss`]: SGD and the losses used to train a layer.
//!
//! ## Example
//!
//! ```rust
//! use moe_rs::moe::{MoeConfig, RoutingMode, compute_capacity};
//!
//! let mut config = MoeConfig::new(16, 8, 32);
//! config.routing = RoutingMode::ExpertChoice;
//! config.validate().unwrap();
//!
//! // 64 tokens, 8 experts, one slot per token on average, 25% headroom.
//! assert_eq!(compute_capacity(config.capacity_factor, 64, config.top_k, 8), 10);
//! ```

/// Macro for creating a Tensor with compile-time shape checking.
///
/// # Examples
///
/// ```rust
/// use moe_rs::tensor;
/// use moe_rs::tensor::Tensor;
///
/// // Works
/// let t = tensor!([0.1, 0.9, 0.6, 0.4], [2, 2]);
///
/// // Fails to compile:
/// // let t = tensor!([0.1, 0.9, 0.6], [2, 2]);
/// ```
#[macro_export]
macro_rules! tensor {
    ($data:expr, $shape:expr) => {{
        const DATA_LEN: usize = (&$data as &[_]).len();
        const SHAPE: [usize; (&$shape as &[_]).len()] = $shape;
        const EXPECTED_SIZE: usize = {
            let mut size = 1;
            let mut i = 0;
            while i < (&SHAPE as &[_]).len() {
                size *= SHAPE[i];
                i += 1;
            }
            size
        };

        const _: () = assert!(
            DATA_LEN == EXPECTED_SIZE,
            "Shape mismatch: data length does not match shape product"
        );

        // Checked at compile time above.
        $crate::tensor::Tensor::new($data.to_vec(), $shape).unwrap()
    }};
}

pub mod autograd;
pub mod loss;
pub mod moe;
pub mod nn;
pub mod optim;
pub mod tensor;

pub use autograd::Variable;
pub use moe::{MoeConfig, MoeError, MoeLayer};
pub use tensor::{Cpu, Device, Storage, Tensor, TensorElem, TensorError, TensorOps};
