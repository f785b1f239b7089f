//! Storage abstraction for Tensors.
//!
//! A `Tensor` owns its shape and strides; the `Storage` owns the elements. The only thing a
//! backend has to provide is a contiguous slice view.

use crate::tensor::TensorElem;
use std::fmt::Debug;

/// A contiguous element buffer backing a tensor.
pub trait Storage<T>: Clone + Debug + Send + Sync {
    /// Returns the data as an immutable slice.
    fn as_slice(&self) -> &[T];

    /// Returns the data as a mutable slice.
    fn as_mut_slice(&mut self) -> &mut [T];

    /// Returns the number of elements in the storage.
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Returns `true` if the storage contains no elements.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: TensorElem> Storage<T> for Vec<T> {
    fn as_slice(&self) -> &[T] {
        self
    }
    fn as_mut_slice(&mut self) -> &mut [T] {
        self
    }
}
