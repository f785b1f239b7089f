//! Automatic Differentiation (Autograd) module.
//!
//! # What is Autograd?
//!
//! Reverse-mode automatic differentiation: every operation on a [`Variable`] records a node
//! that knows how to push the output gradient back to its inputs. Calling
//! [`Variable::backward`] on the final scalar (task loss plus MoE auxiliary losses) walks the
//! recorded graph in reverse topological order.
//!
//! # How it Works
//!
//! 1. **Forward pass**: ops on `Variable`s build a DAG of `Rc<dyn GraphNode>` on the fly
//!    ("define-by-run"). Leaf variables (parameters, inputs) have no node, only a gradient cell.
//! 2. **Backward pass**: [`engine::backward`] sorts the DAG and calls each node once. A node
//!    reads the gradient of its output and *adds* its contribution into each input's cell, so a
//!    value used twice receives the sum of both paths.
//!
//! # Example: Simple Gradient Computation
//!
//! $f(x) = x^2$ at $x = 3$ gives $f'(3) = 6$.
//!
//! ```rust
//! use moe_rs::tensor::Tensor;
//! use moe_rs::autograd::Variable;
//!
//! let x = Variable::new(Tensor::new(vec![3.0], []).unwrap());
//! let y = (&x * &x).unwrap();
//! y.backward().unwrap();
//!
//! assert_eq!(x.grad().unwrap().data()[0], 6.0);
//! ```
//!
//! # Non-differentiable selection
//!
//! Top-k routing picks indices, and indices have no gradient. Routing code therefore computes
//! the selection on plain tensors and feeds the resulting `usize` indices into differentiable
//! gather/scatter ops ([`Variable::index_select`], [`Variable::gather_axis0`],
//! [`Variable::index_add`]). Gradients flow through the *weights* that were picked, never
//! through the choice itself.

use crate::tensor::{Cpu, Result, Tensor, TensorElem, TensorError};
use std::cell::RefCell;
use std::fmt::Debug;
use std::rc::Rc;

pub mod engine;
pub mod functional;
pub mod index;
pub mod ops;
pub mod reduce;

/// Shared, lazily-filled gradient slot of a variable.
pub type GradCell<T, const RANK: usize> = Rc<RefCell<Option<Tensor<T, RANK, Cpu>>>>;

/// A node in the computation graph.
pub trait GraphNode: Debug {
    /// Reads the output gradient and accumulates input gradients.
    fn backward(&self) -> Result<()>;
    /// Returns the nodes that produced this node's inputs.
    fn parents(&self) -> Vec<Rc<dyn GraphNode>>;
}

/// A tensor that participates in the computation graph.
#[derive(Clone, Debug)]
pub struct Variable<T, const RANK: usize>
where
    T: TensorElem,
{
    /// The forward value.
    pub data: Tensor<T, RANK, Cpu>,
    /// The gradient of the loss with respect to this variable, filled by `backward`.
    pub grad: GradCell<T, RANK>,
    /// The node that produced this variable; `None` for leaves.
    pub node: Option<Rc<dyn GraphNode>>,
}

impl<T, const RANK: usize> Variable<T, RANK>
where
    T: TensorElem + 'static,
{
    /// Creates a new leaf variable (a parameter or an input).
    pub fn new(data: Tensor<T, RANK, Cpu>) -> Self {
        Self {
            data,
            grad: Rc::new(RefCell::new(None)),
            node: None,
        }
    }

    /// Creates the output variable of an op whose node writes into `grad`.
    pub fn with_node(
        data: Tensor<T, RANK, Cpu>,
        grad: GradCell<T, RANK>,
        node: Rc<dyn GraphNode>,
    ) -> Self {
        Self {
            data,
            grad,
            node: Some(node),
        }
    }

    /// Returns the shape of the forward value.
    pub fn shape(&self) -> &[usize; RANK] {
        self.data.shape()
    }

    /// Returns a copy of the accumulated gradient, if any.
    pub fn grad(&self) -> Option<Tensor<T, RANK, Cpu>> {
        self.grad.borrow().clone()
    }

    /// Clears the accumulated gradient.
    pub fn zero_grad(&self) {
        *self.grad.borrow_mut() = None;
    }

    /// Returns a new leaf holding the same value, cut off from the graph.
    pub fn detach(&self) -> Self {
        Self::new(self.data.clone())
    }

    /// Runs the backward pass from this variable.
    ///
    /// The gradient is seeded with ones unless one was set explicitly beforehand.
    pub fn backward(&self) -> Result<()> {
        {
            let mut grad = self.grad.borrow_mut();
            if grad.is_none() {
                *grad = Some(Tensor::ones(*self.data.shape()));
            }
        }

        engine::backward(self.node.clone())
    }
}

/// Adds `delta` into `cell`, initializing it on first use.
pub(crate) fn accumulate<T, const RANK: usize>(
    cell: &GradCell<T, RANK>,
    delta: Tensor<T, RANK, Cpu>,
) -> Result<()>
where
    T: TensorElem,
{
    let mut slot = cell.borrow_mut();
    match slot.as_mut() {
        Some(existing) => {
            if existing.shape() != delta.shape() {
                return Err(TensorError::ShapeMismatch {
                    expected: existing.shape().to_vec(),
                    got: delta.shape().to_vec(),
                });
            }
            for (e, &d) in existing.data_mut().iter_mut().zip(delta.data()) {
                *e += d;
            }
        }
        None => *slot = Some(delta),
    }
    Ok(())
}

/// Collects the producer nodes of an op's inputs.
pub(crate) fn parents_of(nodes: &[&Option<Rc<dyn GraphNode>>]) -> Vec<Rc<dyn GraphNode>> {
    nodes.iter().filter_map(|n| (*n).clone()).collect()
}

/// Gives a fresh, empty gradient cell for an op output.
pub(crate) fn new_cell<T, const RANK: usize>() -> GradCell<T, RANK>
where
    T: TensorElem,
{
    Rc::new(RefCell::new(None))
}
