//! Differentiable gather/scatter over rows, plus per-row scaling.
//!
//! Indices are plain `usize` data; only the gathered values carry gradients.

use super::{GradCell, GraphNode, Variable, accumulate, new_cell, parents_of};
use crate::tensor::{Cpu, Result, Tensor, TensorElem, TensorError};
use rayon::prelude::*;
use std::rc::Rc;

/// `y = x[indices]`; backward scatter-adds into the source rows.
#[derive(Debug)]
struct IndexSelectNode<T: TensorElem> {
    indices: Vec<usize>,
    in_shape: [usize; 2],
    input_grad: GradCell<T, 2>,
    out_grad: GradCell<T, 2>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem> GraphNode for IndexSelectNode<T> {
    fn backward(&self) -> Result<()> {
        let out = self.out_grad.borrow();
        let Some(grad) = out.as_ref() else {
            return Ok(());
        };
        let mut dx = Tensor::zeros(self.in_shape);
        dx.index_add(&self.indices, grad)?;
        accumulate(&self.input_grad, dx)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

/// `y = zeros.index_add(indices, src)`; backward gathers the output gradient rows.
#[derive(Debug)]
struct IndexAddNode<T: TensorElem> {
    indices: Vec<usize>,
    src_grad: GradCell<T, 2>,
    out_grad: GradCell<T, 2>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem> GraphNode for IndexAddNode<T> {
    fn backward(&self) -> Result<()> {
        let out = self.out_grad.borrow();
        let Some(grad) = out.as_ref() else {
            return Ok(());
        };
        accumulate(&self.src_grad, grad.index_select(&self.indices)?)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

/// `y[c, e] = x[indices[c, e], e]`.
#[derive(Debug)]
struct GatherAxis0Node<T: TensorElem> {
    indices: Tensor<usize, 2, Cpu>,
    in_shape: [usize; 2],
    input_grad: GradCell<T, 2>,
    out_grad: GradCell<T, 2>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem> GraphNode for GatherAxis0Node<T> {
    fn backward(&self) -> Result<()> {
        let out = self.out_grad.borrow();
        let Some(grad) = out.as_ref() else {
            return Ok(());
        };
        let [_, cols] = self.in_shape;
        let mut dx = Tensor::zeros(self.in_shape);
        let dx_data = dx.data_mut();
        for (flat, (&row, &g)) in self.indices.data().iter().zip(grad.data()).enumerate() {
            dx_data[row * cols + flat % cols] += g;
        }
        accumulate(&self.input_grad, dx)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

/// `y[r, :] = x[r, :] * w[r]`.
#[derive(Debug)]
struct ScaleRowsNode<T: TensorElem> {
    x_data: Tensor<T, 2, Cpu>,
    w_data: Tensor<T, 1, Cpu>,
    x_grad: GradCell<T, 2>,
    w_grad: GradCell<T, 1>,
    out_grad: GradCell<T, 2>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem> GraphNode for ScaleRowsNode<T> {
    fn backward(&self) -> Result<()> {
        let out = self.out_grad.borrow();
        let Some(grad) = out.as_ref() else {
            return Ok(());
        };
        let [rows, cols] = *grad.shape();

        let dx = scale_rows(grad, &self.w_data);

        // dw[r] = <g[r, :], x[r, :]>
        let mut dw = Tensor::zeros([rows]);
        if cols > 0 {
            dw.data_mut()
                .par_iter_mut()
                .zip(grad.data().par_chunks(cols))
                .zip(self.x_data.data().par_chunks(cols))
                .for_each(|((d, g), x)| {
                    *d = g.iter().zip(x).fold(T::zero(), |acc, (&a, &b)| acc + a * b);
                });
        }

        accumulate(&self.x_grad, dx)?;
        accumulate(&self.w_grad, dw)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

fn scale_rows<T: TensorElem>(x: &Tensor<T, 2, Cpu>, w: &Tensor<T, 1, Cpu>) -> Tensor<T, 2, Cpu> {
    let [_, cols] = *x.shape();
    let mut out = x.clone();
    if cols > 0 {
        out.data_mut()
            .par_chunks_mut(cols)
            .zip(w.data().par_iter())
            .for_each(|(row, &s)| row.iter_mut().for_each(|v| *v *= s));
    }
    out
}

impl<T: TensorElem + 'static> Variable<T, 2> {
    /// Gathers rows: output row `i` is row `indices[i]` of `self`.
    pub fn index_select(&self, indices: &[usize]) -> Result<Self> {
        let data = self.data.index_select(indices)?;

        let out_grad = new_cell();
        let node = Rc::new(IndexSelectNode {
            indices: indices.to_vec(),
            in_shape: *self.data.shape(),
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[&self.node]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }

    /// Scatter-adds the rows of `self` into a fresh `[num_rows, cols]` zero buffer.
    ///
    /// Row `i` lands on row `indices[i]`; rows sharing a destination are summed. Destinations
    /// that receive nothing stay zero.
    pub fn index_add(&self, indices: &[usize], num_rows: usize) -> Result<Self> {
        let [_, cols] = *self.data.shape();
        let mut data = Tensor::zeros([num_rows, cols]);
        data.index_add(indices, &self.data)?;

        let out_grad = new_cell();
        let node = Rc::new(IndexAddNode {
            indices: indices.to_vec(),
            src_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[&self.node]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }

    /// Column-wise gather: `out[c, e] = self[indices[c, e], e]`.
    ///
    /// With `self` as `[tokens, experts]` gate scores and `indices` as `[capacity, experts]`
    /// slot assignments, this picks each slot's gate weight.
    pub fn gather_axis0(&self, indices: &Tensor<usize, 2, Cpu>) -> Result<Self> {
        let [rows, cols] = *self.data.shape();
        let [_, idx_cols] = *indices.shape();
        if idx_cols != cols {
            return Err(TensorError::ShapeMismatch {
                expected: vec![cols],
                got: vec![idx_cols],
            });
        }
        if let Some(&bad) = indices.data().iter().find(|&&r| r >= rows) {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![bad],
                shape: vec![rows, cols],
            });
        }

        let src = self.data.data();
        let picked = indices
            .data()
            .iter()
            .enumerate()
            .map(|(flat, &row)| src[row * cols + flat % cols])
            .collect();
        let data = Tensor::new(picked, *indices.shape())?;

        let out_grad = new_cell();
        let node = Rc::new(GatherAxis0Node {
            indices: indices.clone(),
            in_shape: [rows, cols],
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[&self.node]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }

    /// Multiplies row `r` by `weights[r]`.
    pub fn scale_rows(&self, weights: &Variable<T, 1>) -> Result<Self> {
        let [rows, _] = *self.data.shape();
        if weights.data.shape() != &[rows] {
            return Err(TensorError::ShapeMismatch {
                expected: vec![rows],
                got: weights.data.shape().to_vec(),
            });
        }
        let data = scale_rows(&self.data, &weights.data);

        let out_grad = new_cell();
        let node = Rc::new(ScaleRowsNode {
            x_data: self.data.clone(),
            w_data: weights.data.clone(),
            x_grad: self.grad.clone(),
            w_grad: weights.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[&self.node, &weights.node]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }
}
