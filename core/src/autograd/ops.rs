//! Element-wise, matmul and shape nodes.

use super::{GradCell, GraphNode, Variable, accumulate, new_cell, parents_of};
use crate::tensor::{Cpu, FloatElem, Result, Tensor, TensorElem, TensorError, TensorOps, scalar};
use rayon::prelude::*;
use std::fmt::Debug;
use std::ops::{Add, Div, Mul, Sub};
use std::rc::Rc;

#[derive(Debug, Clone, Copy)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Same-shape binary arithmetic.
#[derive(Debug)]
struct BinaryNode<T: TensorElem, const RANK: usize> {
    op: BinaryOp,
    lhs_data: Tensor<T, RANK, Cpu>,
    rhs_data: Tensor<T, RANK, Cpu>,
    lhs_grad: GradCell<T, RANK>,
    rhs_grad: GradCell<T, RANK>,
    out_grad: GradCell<T, RANK>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem, const RANK: usize> GraphNode for BinaryNode<T, RANK> {
    fn backward(&self) -> Result<()> {
        let out = self.out_grad.borrow();
        let Some(grad) = out.as_ref() else {
            return Ok(());
        };

        let (dl, dr) = match self.op {
            // d(x+y) = (g, g)
            BinaryOp::Add => (grad.clone(), grad.clone()),
            // d(x-y) = (g, -g)
            BinaryOp::Sub => (grad.clone(), grad.map(|g| T::zero() - g)),
            // d(x*y) = (g*y, g*x)
            BinaryOp::Mul => ((grad * &self.rhs_data)?, (grad * &self.lhs_data)?),
            // d(x/y) = (g/y, -g*x/y^2)
            BinaryOp::Div => {
                let dl = (grad / &self.rhs_data)?;
                let y_sq = (&self.rhs_data * &self.rhs_data)?;
                let dr = (&(grad * &self.lhs_data)? / &y_sq)?.map(|v| T::zero() - v);
                (dl, dr)
            }
        };

        accumulate(&self.lhs_grad, dl)?;
        accumulate(&self.rhs_grad, dr)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

fn binary<T: TensorElem + 'static, const RANK: usize>(
    op: BinaryOp,
    lhs: &Variable<T, RANK>,
    rhs: &Variable<T, RANK>,
) -> Result<Variable<T, RANK>> {
    let data = match op {
        BinaryOp::Add => (&lhs.data + &rhs.data)?,
        BinaryOp::Sub => (&lhs.data - &rhs.data)?,
        BinaryOp::Mul => (&lhs.data * &rhs.data)?,
        BinaryOp::Div => (&lhs.data / &rhs.data)?,
    };

    let out_grad = new_cell();
    let node = Rc::new(BinaryNode {
        op,
        lhs_data: lhs.data.clone(),
        rhs_data: rhs.data.clone(),
        lhs_grad: lhs.grad.clone(),
        rhs_grad: rhs.grad.clone(),
        out_grad: out_grad.clone(),
        parents: parents_of(&[&lhs.node, &rhs.node]),
    });

    Ok(Variable::with_node(data, out_grad, node))
}

macro_rules! impl_var_bin_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<T: TensorElem + 'static, const RANK: usize> $trait for &Variable<T, RANK> {
            type Output = Result<Variable<T, RANK>>;

            fn $method(self, rhs: Self) -> Self::Output {
                binary($op, self, rhs)
            }
        }
    };
}

impl_var_bin_op!(Add, add, BinaryOp::Add);
impl_var_bin_op!(Sub, sub, BinaryOp::Sub);
impl_var_bin_op!(Mul, mul, BinaryOp::Mul);
impl_var_bin_op!(Div, div, BinaryOp::Div);

/// Matrix multiplication (batched over leading axes).
#[derive(Debug)]
struct MatMulNode<T: TensorElem, const RANK: usize> {
    lhs_data: Tensor<T, RANK, Cpu>,
    rhs_data: Tensor<T, RANK, Cpu>,
    lhs_grad: GradCell<T, RANK>,
    rhs_grad: GradCell<T, RANK>,
    out_grad: GradCell<T, RANK>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem, const RANK: usize> GraphNode for MatMulNode<T, RANK> {
    fn backward(&self) -> Result<()> {
        let out = self.out_grad.borrow();
        let Some(grad) = out.as_ref() else {
            return Ok(());
        };

        // dA = G @ B^T, dB = A^T @ G
        let da = grad.matmul(&self.rhs_data.transpose()?)?;
        let db = self.lhs_data.transpose()?.matmul(grad)?;

        accumulate(&self.lhs_grad, da)?;
        accumulate(&self.rhs_grad, db)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

/// Element-wise unary op with a precomputed local derivative `dy/dx`.
#[derive(Debug)]
struct UnaryNode<T: TensorElem, const RANK: usize> {
    derivative: Tensor<T, RANK, Cpu>,
    input_grad: GradCell<T, RANK>,
    out_grad: GradCell<T, RANK>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem, const RANK: usize> GraphNode for UnaryNode<T, RANK> {
    fn backward(&self) -> Result<()> {
        let out = self.out_grad.borrow();
        let Some(grad) = out.as_ref() else {
            return Ok(());
        };
        accumulate(&self.input_grad, (grad * &self.derivative)?)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

/// Shape change without data movement.
#[derive(Debug)]
struct ReshapeNode<T: TensorElem, const IN: usize, const OUT: usize> {
    in_shape: [usize; IN],
    input_grad: GradCell<T, IN>,
    out_grad: GradCell<T, OUT>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem, const IN: usize, const OUT: usize> GraphNode for ReshapeNode<T, IN, OUT> {
    fn backward(&self) -> Result<()> {
        let out = self.out_grad.borrow();
        let Some(grad) = out.as_ref() else {
            return Ok(());
        };
        accumulate(&self.input_grad, grad.clone().reshape(self.in_shape)?)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

/// Swap of the last two axes.
#[derive(Debug)]
struct TransposeNode<T: TensorElem, const RANK: usize> {
    input_grad: GradCell<T, RANK>,
    out_grad: GradCell<T, RANK>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem, const RANK: usize> GraphNode for TransposeNode<T, RANK> {
    fn backward(&self) -> Result<()> {
        let out = self.out_grad.borrow();
        let Some(grad) = out.as_ref() else {
            return Ok(());
        };
        accumulate(&self.input_grad, grad.transpose()?)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

/// `x[r, :] + b` for every row `r`.
#[derive(Debug)]
struct AddBiasNode<T: TensorElem> {
    input_grad: GradCell<T, 2>,
    bias_grad: GradCell<T, 1>,
    out_grad: GradCell<T, 2>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem> GraphNode for AddBiasNode<T> {
    fn backward(&self) -> Result<()> {
        let out = self.out_grad.borrow();
        let Some(grad) = out.as_ref() else {
            return Ok(());
        };
        accumulate(&self.bias_grad, grad.sum_axis(0)?)?;
        accumulate(&self.input_grad, grad.clone())
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

impl<T: TensorElem + 'static, const RANK: usize> Variable<T, RANK> {
    /// Matrix multiplication over the last two axes.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        let data = self.data.matmul(&rhs.data)?;

        let out_grad = new_cell();
        let node = Rc::new(MatMulNode {
            lhs_data: self.data.clone(),
            rhs_data: rhs.data.clone(),
            lhs_grad: self.grad.clone(),
            rhs_grad: rhs.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[&self.node, &rhs.node]),
        });

        Ok(Variable::with_node(data, out_grad, node))
    }

    /// Applies `y = f(x)` whose derivative at each element is `derivative`.
    fn unary(&self, data: Tensor<T, RANK, Cpu>, derivative: Tensor<T, RANK, Cpu>) -> Self {
        let out_grad = new_cell();
        let node = Rc::new(UnaryNode {
            derivative,
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[&self.node]),
        });
        Variable::with_node(data, out_grad, node)
    }

    /// Multiplies by a constant.
    pub fn scale(&self, factor: T) -> Self {
        let data = self.data.scale(factor);
        self.unary(data, Tensor::full(factor, *self.data.shape()))
    }

    /// Swaps the last two axes.
    pub fn transpose(&self) -> Result<Self> {
        let data = self.data.transpose()?;

        let out_grad = new_cell();
        let node = Rc::new(TransposeNode {
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[&self.node]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }

    /// Reinterprets the value with a new shape of equal size (rank may change).
    pub fn reshape<const NEW_RANK: usize>(
        &self,
        new_shape: [usize; NEW_RANK],
    ) -> Result<Variable<T, NEW_RANK>> {
        let data = self.data.clone().reshape(new_shape)?;

        let out_grad = new_cell();
        let node = Rc::new(ReshapeNode {
            in_shape: *self.data.shape(),
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[&self.node]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }
}

impl<T: FloatElem + 'static, const RANK: usize> Variable<T, RANK> {
    /// `e^x`.
    pub fn exp(&self) -> Self {
        let data = self.data.map(|x| x.exp());
        let derivative = data.clone();
        self.unary(data, derivative)
    }

    /// Natural logarithm.
    pub fn log(&self) -> Self {
        let data = self.data.map(|x| x.ln());
        let derivative = self.data.map(|x| T::one() / x);
        self.unary(data, derivative)
    }

    /// `max(0, x)`; the derivative at 0 is taken as 0.
    pub fn relu(&self) -> Self {
        let data = self.data.map(|x| if x > T::zero() { x } else { T::zero() });
        let derivative = self
            .data
            .map(|x| if x > T::zero() { T::one() } else { T::zero() });
        self.unary(data, derivative)
    }

    /// GELU, tanh approximation:
    /// $0.5 x (1 + \tanh[\sqrt{2/\pi}(x + 0.044715 x^3)])$.
    pub fn gelu(&self) -> Self {
        let s = scalar::<T>((2.0 / std::f64::consts::PI).sqrt());
        let c = scalar::<T>(0.044715);
        let half = scalar::<T>(0.5);
        let three = scalar::<T>(3.0);

        let data = self
            .data
            .map(|x| half * x * (T::one() + (s * (x + c * x * x * x)).tanh()));
        let derivative = self.data.map(|x| {
            let t = (s * (x + c * x * x * x)).tanh();
            half * (T::one() + t) + half * x * (T::one() - t * t) * s * (T::one() + three * c * x * x)
        });
        self.unary(data, derivative)
    }
}

impl<T: TensorElem + 'static> Variable<T, 2> {
    /// Adds a `[cols]` bias to every row of a `[rows, cols]` variable.
    pub fn add_bias(&self, bias: &Variable<T, 1>) -> Result<Self> {
        let [_, cols] = *self.data.shape();
        if bias.data.shape() != &[cols] {
            return Err(TensorError::ShapeMismatch {
                expected: vec![cols],
                got: bias.data.shape().to_vec(),
            });
        }

        let mut data = self.data.clone();
        if cols > 0 {
            let b = bias.data.data();
            data.data_mut().par_chunks_mut(cols).for_each(|row| {
                for (r, &bv) in row.iter_mut().zip(b) {
                    *r += bv;
                }
            });
        }

        let out_grad = new_cell();
        let node = Rc::new(AddBiasNode {
            input_grad: self.grad.clone(),
            bias_grad: bias.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[&self.node, &bias.node]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar_var(v: f64) -> Variable<f64, 0> {
        Variable::new(Tensor::new(vec![v], []).unwrap())
    }

    fn grad_of<const R: usize>(v: &Variable<f64, R>) -> Vec<f64> {
        v.grad().unwrap().data().to_vec()
    }

    #[test]
    fn test_chain_rule() {
        // y = (a + b) * c with a=2, b=3, c=4
        // dy/da = dy/db = c = 4, dy/dc = a + b = 5
        let a = scalar_var(2.0);
        let b = scalar_var(3.0);
        let c = scalar_var(4.0);

        let y = (&(&a + &b).unwrap() * &c).unwrap();
        y.backward().unwrap();

        assert_eq!(grad_of(&a), vec![4.0]);
        assert_eq!(grad_of(&b), vec![4.0]);
        assert_eq!(grad_of(&c), vec![5.0]);
    }

    #[test]
    fn test_sub_div_backward() {
        // y = a / b - a with a = 6, b = 3
        // dy/da = 1/b - 1 = -2/3, dy/db = -a/b^2 = -2/3
        let a = scalar_var(6.0);
        let b = scalar_var(3.0);
        let y = (&(&a / &b).unwrap() - &a).unwrap();
        y.backward().unwrap();

        assert!((grad_of(&a)[0] + 2.0 / 3.0).abs() < 1e-12);
        assert!((grad_of(&b)[0] + 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_reuse_accumulates() {
        // y = x * x * x, dy/dx = 3x^2 = 27 at x = 3
        let x = scalar_var(3.0);
        let y = (&(&x * &x).unwrap() * &x).unwrap();
        y.backward().unwrap();
        assert_eq!(grad_of(&x), vec![27.0]);
    }

    #[test]
    fn test_matmul_backward() {
        // L = sum(A @ B), A = [[1,2],[3,4]], B = [[5,6],[7,8]]
        // dL/dA = ones @ B^T = [[11, 15], [11, 15]]
        // dL/dB = A^T @ ones = [[4, 4], [6, 6]]
        let a = Variable::new(Tensor::new(vec![1.0, 2.0, 3.0, 4.0], [2, 2]).unwrap());
        let b = Variable::new(Tensor::new(vec![5.0, 6.0, 7.0, 8.0], [2, 2]).unwrap());

        let c = a.matmul(&b).unwrap();
        c.backward().unwrap();

        assert_eq!(grad_of(&a), vec![11.0, 15.0, 11.0, 15.0]);
        assert_eq!(grad_of(&b), vec![4.0, 4.0, 6.0, 6.0]);
    }

    #[test]
    fn test_transpose_backward() {
        // L = sum(X^T * W) routes W's layout back onto X.
        let x = Variable::new(Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]).unwrap());
        let w = Variable::new(Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [3, 2]).unwrap());
        let xt = x.transpose().unwrap();
        assert_eq!(xt.shape(), &[3, 2]);
        (&xt * &w).unwrap().sum().backward().unwrap();
        assert_eq!(grad_of(&x), vec![1.0, 3.0, 5.0, 2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_batched_matmul_backward() {
        // Per-batch grads stay in their own batch.
        let a = Variable::new(Tensor::new(vec![1.0, 2.0, 3.0, 4.0], [2, 1, 2]).unwrap());
        let w = Variable::new(Tensor::new(vec![1.0, 1.0, 0.0, 0.0], [2, 2, 1]).unwrap());
        let y = a.matmul(&w).unwrap();
        assert_eq!(y.data.data(), &[3.0, 0.0]);
        y.backward().unwrap();

        assert_eq!(grad_of(&a), vec![1.0, 1.0, 0.0, 0.0]);
        assert_eq!(grad_of(&w), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_exp_log() {
        let x = scalar_var(2.0);
        let y = x.log();
        y.backward().unwrap();
        assert_eq!(grad_of(&x), vec![0.5]);

        let z = scalar_var(0.0);
        let e = z.exp();
        e.backward().unwrap();
        assert_eq!(grad_of(&z), vec![1.0]);
    }

    #[test]
    fn test_relu() {
        let x = Variable::new(Tensor::new(vec![-1.0, 0.0, 2.0], [3]).unwrap());
        let y = x.relu();
        assert_eq!(y.data.data(), &[0.0, 0.0, 2.0]);
        y.backward().unwrap();
        assert_eq!(grad_of(&x), vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_gelu_matches_finite_difference() {
        let points = [-2.0, -0.5, 0.0, 0.7, 3.0];
        let x = Variable::new(Tensor::new(points.to_vec(), [5]).unwrap());
        let y = x.gelu();
        y.backward().unwrap();
        let g = grad_of(&x);

        // gelu(1) ~ 0.8412
        let one = Variable::new(Tensor::new(vec![1.0f64], [1]).unwrap()).gelu();
        assert!((one.data.data()[0] - 0.8412).abs() < 1e-3);

        let eps = 1e-6;
        for (i, &p) in points.iter().enumerate() {
            let f = |v: f64| {
                Variable::new(Tensor::new(vec![v], [1]).unwrap())
                    .gelu()
                    .data
                    .data()[0]
            };
            let numeric = (f(p + eps) - f(p - eps)) / (2.0 * eps);
            assert!((g[i] - numeric).abs() < 1e-6, "at {p}: {} vs {numeric}", g[i]);
        }
    }

    #[test]
    fn test_scale_and_reshape() {
        let x = Variable::new(Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [1, 2, 3]).unwrap());
        let flat: Variable<f64, 2> = x.reshape([2, 3]).unwrap();
        let y = flat.scale(2.0);
        assert_eq!(y.data.data(), &[2.0, 4.0, 6.0, 8.0, 10.0, 12.0]);

        y.backward().unwrap();
        let g = x.grad().unwrap();
        assert_eq!(g.shape(), &[1, 2, 3]);
        assert_eq!(g.data(), &[2.0; 6]);

        assert!(x.reshape([4]).is_err());
    }

    #[test]
    fn test_add_bias() {
        let x = Variable::new(Tensor::new(vec![1.0, 1.0, 2.0, 2.0], [2, 2]).unwrap());
        let b = Variable::new(Tensor::new(vec![0.5, -0.5], [2]).unwrap());
        let y = x.add_bias(&b).unwrap();
        assert_eq!(y.data.data(), &[1.5, 0.5, 2.5, 1.5]);

        y.backward().unwrap();
        assert_eq!(grad_of(&b), vec![2.0, 2.0]);
        assert_eq!(grad_of(&x), vec![1.0; 4]);

        let wrong = Variable::new(Tensor::new(vec![0.0; 3], [3]).unwrap());
        assert!(x.add_bias(&wrong).is_err());
    }
}
