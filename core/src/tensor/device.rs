//! Device abstraction for Tensor storage.
//!
//! A `Device` decides where tensor data is allocated and which kernels run on it. Only the
//! host CPU is implemented; the routing and dispatch code is written against the trait so an
//! accelerator backend only needs to supply its own storage and kernels.

use crate::tensor::{Storage, TensorElem};
use std::fmt::Debug;

/// A backend that owns tensor memory.
pub trait Device: Clone + Debug + PartialEq + Send + Sync {
    /// The type of storage used by this device.
    type Storage<T>: Storage<T>
    where
        T: TensorElem;

    /// Returns the name of the device.
    ///
    /// ```rust
    /// use moe_rs::tensor::{Cpu, Device};
    /// assert_eq!(Cpu.name(), "CPU");
    /// ```
    fn name(&self) -> &'static str;

    /// Swaps the last two axes of `data` laid out as `shape`.
    fn transpose<T: TensorElem, const RANK: usize>(
        data: &Self::Storage<T>,
        shape: &[usize; RANK],
    ) -> crate::tensor::Result<Self::Storage<T>>;
}

/// The host CPU. Data lives in a `Vec<T>` and kernels fan out over the rayon pool.
#[derive(Clone, Debug, PartialEq)]
pub struct Cpu;

impl Device for Cpu {
    type Storage<T>
        = Vec<T>
    where
        T: TensorElem;

    fn name(&self) -> &'static str {
        "CPU"
    }

    fn transpose<T: TensorElem, const RANK: usize>(
        data: &Self::Storage<T>,
        shape: &[usize; RANK],
    ) -> crate::tensor::Result<Self::Storage<T>> {
        if RANK < 2 {
            return Err(crate::tensor::TensorError::Unsupported(
                "Transpose requires rank >= 2".into(),
            ));
        }
        Ok(moe_rs_kernels::cpu_transpose(data, shape)?)
    }
}
