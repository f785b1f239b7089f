//! Reductions and normalizations: `sum`, `mean`, `sum_axis`, `softmax`, `logsumexp`.

use super::{GradCell, GraphNode, Variable, accumulate, new_cell, parents_of};
use crate::tensor::{Cpu, FloatElem, Result, Tensor, TensorElem, TensorError, scalar};
use std::rc::Rc;

/// Expands the result of reducing `reduced_axis` back to `shape`.
///
/// Reducing axis 1 leaves one value per row, reducing axis 0 one value per column.
fn broadcast_along<T: TensorElem>(
    reduced: &Tensor<T, 1, Cpu>,
    shape: [usize; 2],
    reduced_axis: usize,
) -> Tensor<T, 2, Cpu> {
    let [rows, cols] = shape;
    let r = reduced.data();
    let data = (0..rows * cols)
        .map(|i| if reduced_axis == 1 { r[i / cols] } else { r[i % cols] })
        .collect();
    // Length is rows * cols by construction.
    Tensor::new(data, shape).unwrap_or_else(|_| Tensor::zeros(shape))
}

/// Full reduction to a scalar, scaled by `factor` (1 for sum, 1/n for mean).
#[derive(Debug)]
struct SumNode<T: TensorElem, const RANK: usize> {
    in_shape: [usize; RANK],
    factor: T,
    input_grad: GradCell<T, RANK>,
    out_grad: GradCell<T, 0>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem, const RANK: usize> GraphNode for SumNode<T, RANK> {
    fn backward(&self) -> Result<()> {
        let out = self.out_grad.borrow();
        let Some(grad) = out.as_ref() else {
            return Ok(());
        };
        let g = grad.data()[0] * self.factor;
        accumulate(&self.input_grad, Tensor::full(g, self.in_shape))
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

#[derive(Debug)]
struct SumAxisNode<T: TensorElem> {
    in_shape: [usize; 2],
    axis: usize,
    input_grad: GradCell<T, 2>,
    out_grad: GradCell<T, 1>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem> GraphNode for SumAxisNode<T> {
    fn backward(&self) -> Result<()> {
        let out = self.out_grad.borrow();
        let Some(grad) = out.as_ref() else {
            return Ok(());
        };
        accumulate(&self.input_grad, broadcast_along(grad, self.in_shape, self.axis))
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

/// `y = softmax(x)` along `axis`; `dx = y * (g - sum_axis(g * y))`.
#[derive(Debug)]
struct SoftmaxNode<T: TensorElem> {
    out_data: Tensor<T, 2, Cpu>,
    axis: usize,
    input_grad: GradCell<T, 2>,
    out_grad: GradCell<T, 2>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem> GraphNode for SoftmaxNode<T> {
    fn backward(&self) -> Result<()> {
        let out = self.out_grad.borrow();
        let Some(grad) = out.as_ref() else {
            return Ok(());
        };
        let gy = (grad * &self.out_data)?;
        let dot = gy.sum_axis(self.axis)?;
        let dot = broadcast_along(&dot, *grad.shape(), self.axis);
        let dx = (&self.out_data * &(grad - &dot)?)?;
        accumulate(&self.input_grad, dx)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

/// `y = logsumexp(x)` along `axis`; `dx = softmax(x) * g` broadcast.
#[derive(Debug)]
struct LogSumExpNode<T: TensorElem> {
    probs: Tensor<T, 2, Cpu>,
    axis: usize,
    input_grad: GradCell<T, 2>,
    out_grad: GradCell<T, 1>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem> GraphNode for LogSumExpNode<T> {
    fn backward(&self) -> Result<()> {
        let out = self.out_grad.borrow();
        let Some(grad) = out.as_ref() else {
            return Ok(());
        };
        let g = broadcast_along(grad, *self.probs.shape(), self.axis);
        accumulate(&self.input_grad, (&self.probs * &g)?)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

fn check_axis(axis: usize) -> Result<()> {
    if axis > 1 {
        return Err(TensorError::IndexOutOfBounds {
            index: vec![axis],
            shape: vec![2],
        });
    }
    Ok(())
}

impl<T: TensorElem + 'static, const RANK: usize> Variable<T, RANK> {
    fn reduce_all(&self, factor: T) -> Variable<T, 0> {
        let total = self.data.sum() * factor;

        let out_grad = new_cell();
        let node = Rc::new(SumNode {
            in_shape: *self.data.shape(),
            factor,
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[&self.node]),
        });
        Variable::with_node(Tensor::full(total, []), out_grad, node)
    }

    /// Sum of all elements as a scalar variable.
    pub fn sum(&self) -> Variable<T, 0> {
        self.reduce_all(T::one())
    }
}

impl<T: FloatElem + 'static, const RANK: usize> Variable<T, RANK> {
    /// Mean of all elements. An empty tensor has mean 0.
    pub fn mean(&self) -> Variable<T, 0> {
        let n = self.data.size();
        let factor = if n == 0 {
            T::zero()
        } else {
            T::one() / scalar(n as f64)
        };
        self.reduce_all(factor)
    }
}

impl<T: TensorElem + 'static> Variable<T, 2> {
    /// Sums along `axis` (0 = over rows, 1 = over columns).
    pub fn sum_axis(&self, axis: usize) -> Result<Variable<T, 1>> {
        check_axis(axis)?;
        let data = self.data.sum_axis(axis)?;

        let out_grad = new_cell();
        let node = Rc::new(SumAxisNode {
            in_shape: *self.data.shape(),
            axis,
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[&self.node]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }
}

impl<T: FloatElem + 'static> Variable<T, 2> {
    /// Softmax along `axis`.
    ///
    /// For `[tokens, experts]` scores, `axis = 1` normalizes each token over experts and
    /// `axis = 0` normalizes each expert over tokens.
    pub fn softmax(&self, axis: usize) -> Result<Self> {
        check_axis(axis)?;
        let data = self.data.softmax(axis)?;

        let out_grad = new_cell();
        let node = Rc::new(SoftmaxNode {
            out_data: data.clone(),
            axis,
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[&self.node]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }

    /// `log(sum(exp(x)))` along `axis`.
    pub fn logsumexp(&self, axis: usize) -> Result<Variable<T, 1>> {
        check_axis(axis)?;
        let data = self.data.logsumexp(axis)?;

        let out_grad = new_cell();
        let node = Rc::new(LogSumExpNode {
            probs: self.data.softmax(axis)?,
            axis,
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[&self.node]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }
}
