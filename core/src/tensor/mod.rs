//! Core Tensor implementation.
//!
//! # What is a Tensor here?
//!
//! A **Tensor** is a dense, row-major N-dimensional array. Every stage of the MoE pipeline
//! consumes and produces them:
//!
//! - **Token batch**: `[batch, seq, hidden]`, flattened to `[tokens, hidden]` for routing.
//! - **Gate scores**: `[tokens, experts]`.
//! - **Routing decision**: `[capacity, experts]` token indices (a `Tensor<usize, 2>`) and weights.
//! - **Expert batches**: `[experts, capacity, hidden]`.
//!
//! The rank is part of the type (`const RANK`), the extents are checked at runtime. That keeps
//! variable batch and sequence lengths cheap while still catching "passed a 2D tensor where a
//! 3D batch was expected" at compile time.
//!
//! ## Example
//!
//! ```rust
//! use moe_rs::tensor::Tensor;
//!
//! let gate = Tensor::<f32, 2>::new(vec![0.1, 0.9, 0.6, 0.4], [2, 2]).unwrap();
//! assert_eq!(gate.shape(), &[2, 2]);
//! assert_eq!(gate.data(), &[0.1, 0.9, 0.6, 0.4]);
//! ```
//!
//! > [!TIP]
//! > **Strides**: the layout is always contiguous, so `strides()` is derived from the shape. The
//! > last axis moves fastest, which is why gather/scatter kernels operate on whole rows.

use num_traits::{Float, FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod device;
pub mod ops;
pub mod storage;

pub use device::{Cpu, Device};
pub use ops::TensorOps;
pub use storage::Storage;

/// Error type for Tensor operations.
#[derive(Error, Debug)]
pub enum TensorError {
    /// The shape of the data does not match the expected shape.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// An index is out of bounds for the given shape.
    #[error("Index out of bounds: index {index:?} for shape {shape:?}")]
    IndexOutOfBounds {
        index: Vec<usize>,
        shape: Vec<usize>,
    },
    /// The requested operation is not supported (e.g., for a specific rank or type).
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl From<moe_rs_kernels::KernelError> for TensorError {
    fn from(err: moe_rs_kernels::KernelError) -> Self {
        use moe_rs_kernels::KernelError;
        match err {
            KernelError::ShapeMismatch { expected, got } => {
                TensorError::ShapeMismatch { expected, got }
            }
            KernelError::IndexOutOfBounds { index, bound } => TensorError::IndexOutOfBounds {
                index: vec![index],
                shape: vec![bound],
            },
            e @ KernelError::InvalidTopK { .. } => TensorError::Unsupported(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TensorError>;

/// Trait bound for elements that can be stored in a Tensor.
///
/// `usize` satisfies it too, which is how routing indices travel as `Tensor<usize, 2>`.
pub trait TensorElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> TensorElem for T where
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

/// Floating-point tensor elements (`f32`, `f64`).
///
/// Anything that needs `exp`, `ln` or `tanh` (softmax, GELU, losses) is bounded on this.
pub trait FloatElem: TensorElem + Float {}

impl<T> FloatElem for T where T: TensorElem + Float {}

/// Converts an `f64` literal or count into `T`, yielding NaN if it is not representable.
pub fn scalar<T: FloatElem>(value: f64) -> T {
    <T as FromPrimitive>::from_f64(value).unwrap_or_else(T::nan)
}

/// The core Tensor struct.
///
/// # Generics
///
/// - `T`: The element type (must implement `TensorElem`).
/// - `RANK`: The number of dimensions (const generic).
/// - `D`: The device where data is stored (defaults to `Cpu`).
#[derive(Clone)]
pub struct Tensor<T, const RANK: usize, D: Device = Cpu>
where
    T: TensorElem,
{
    shape: [usize; RANK],
    strides: [usize; RANK],
    data: D::Storage<T>,
    device: D,
}

impl<T, const RANK: usize> Tensor<T, RANK, Cpu>
where
    T: TensorElem,
{
    /// Creates a new Tensor from a vector of data and a shape.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the length of `data` does not match the product of `shape`.
    pub fn new(data: Vec<T>, shape: [usize; RANK]) -> Result<Self> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![size],
                got: vec![data.len()],
            });
        }

        Ok(Self {
            shape,
            strides: compute_strides(&shape),
            data,
            device: Cpu,
        })
    }

    /// Creates a new Tensor with every element set to `value`.
    pub fn full(value: T, shape: [usize; RANK]) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape,
            strides: compute_strides(&shape),
            data: vec![value; size],
            device: Cpu,
        }
    }

    /// Creates a new Tensor filled with zeros.
    pub fn zeros(shape: [usize; RANK]) -> Self {
        Self::full(T::zero(), shape)
    }

    /// Creates a new Tensor filled with ones.
    pub fn ones(shape: [usize; RANK]) -> Self {
        Self::full(T::one(), shape)
    }

    /// Creates a new Tensor whose element at flat (row-major) position `i` is `f(i)`.
    pub fn from_fn<F: FnMut(usize) -> T>(shape: [usize; RANK], f: F) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape,
            strides: compute_strides(&shape),
            data: (0..size).map(f).collect(),
            device: Cpu,
        }
    }

    /// Reshapes the tensor, possibly changing its rank.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the element counts differ.
    pub fn reshape<const NEW_RANK: usize>(
        self,
        new_shape: [usize; NEW_RANK],
    ) -> Result<Tensor<T, NEW_RANK, Cpu>> {
        let current_size: usize = self.shape.iter().product();
        let new_size: usize = new_shape.iter().product();

        if current_size != new_size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![current_size],
                got: vec![new_size],
            });
        }

        Ok(Tensor {
            shape: new_shape,
            strides: compute_strides(&new_shape),
            data: self.data,
            device: self.device,
        })
    }

    /// Consumes the tensor and returns its flat buffer.
    pub fn into_vec(self) -> Vec<T> {
        self.data
    }
}

/// Row-major strides for `shape`.
const fn compute_strides<const RANK: usize>(shape: &[usize; RANK]) -> [usize; RANK] {
    let mut strides = [0; RANK];
    let mut stride = 1;
    let mut i = RANK;
    while i > 0 {
        i -= 1;
        strides[i] = stride;
        stride *= shape[i];
    }
    strides
}

impl<T, const RANK: usize, D: Device> Tensor<T, RANK, D>
where
    T: TensorElem,
{
    /// Returns the shape of the tensor.
    pub const fn shape(&self) -> &[usize; RANK] {
        &self.shape
    }

    /// Returns the strides of the tensor.
    pub const fn strides(&self) -> &[usize; RANK] {
        &self.strides
    }

    /// Returns a reference to the underlying data as a slice.
    pub fn data(&self) -> &[T] {
        self.data.as_slice()
    }

    /// Returns a mutable reference to the underlying data as a slice.
    pub fn data_mut(&mut self) -> &mut [T] {
        self.data.as_mut_slice()
    }

    /// Returns the total number of elements in the tensor.
    pub const fn size(&self) -> usize {
        let mut size = 1;
        let mut i = 0;
        while i < RANK {
            size *= self.shape[i];
            i += 1;
        }
        size
    }

    /// Returns the device the data lives on.
    pub fn device(&self) -> &D {
        &self.device
    }
}

impl<T, const RANK: usize, D: Device> Debug for Tensor<T, RANK, D>
where
    T: TensorElem,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("device", &self.device.name())
            .field("data_len", &self.data.len())
            .finish()
    }
}
