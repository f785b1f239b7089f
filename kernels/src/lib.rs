//! Flat-slice CPU kernels used by `moe-rs` tensors.
//!
//! Everything here works on contiguous row-major buffers plus an explicit shape, so the
//! tensor crate can swap any of them for an accelerated implementation without touching
//! the routing code built on top.

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod cpu_gather;
pub mod cpu_matmul;
pub mod cpu_topk;
pub mod cpu_transpose;

pub use cpu_gather::{cpu_index_add, cpu_index_select};
pub use cpu_matmul::cpu_matmul;
pub use cpu_topk::cpu_topk;
pub use cpu_transpose::cpu_transpose;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Index {index} out of bounds for axis of length {bound}")]
    IndexOutOfBounds { index: usize, bound: usize },
    #[error("Cannot take top-{k} along an axis of length {len}")]
    InvalidTopK { k: usize, len: usize },
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Trait bound for elements that can be processed by kernels.
/// This mirrors `TensorElem` in the main crate to avoid circular dependencies.
pub trait KernelElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> KernelElem for T where
    T: Num
        + NumAssign
        + Copy
        + Clone
        + Debug
        + Send
        + Sync
        + FromPrimitive
        + ToPrimitive
        + PartialOrd
{
}
