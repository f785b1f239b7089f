//! Tensor operations.
//!
//! # Overview
//!
//! The numeric engine under the autograd tape:
//! - **Element-wise arithmetic**: `+`, `-`, `*`, `/` on same-shape tensors.
//! - **Matrix multiplication**: plain and batched (`[E, C, H] x [E, H, S]`).
//! - **Reductions**: full sums, per-axis sums, softmax and log-sum-exp on `[rows, cols]`.
//! - **Indexing**: row gather, row scatter-add and top-k, the building blocks of MoE dispatch.
//!
//! Shapes must match exactly for element-wise ops; there is no implicit broadcasting. Row-wise
//! broadcasts that the MoE code needs (bias add, per-row gate weights) are explicit ops on
//! [`Variable`](crate::autograd::Variable).
//!
//! > [!TIP]
//! > Element-wise and row-wise loops run on `rayon`. Each output element is written by exactly
//! > one task, so results do not depend on scheduling.
//!
//! # Examples
//!
//! ```rust
//! use moe_rs::tensor::Tensor;
//!
//! let a = Tensor::<f32, 1>::new(vec![1.0, 2.0], [2]).unwrap();
//! let b = Tensor::<f32, 1>::new(vec![3.0, 4.0], [2]).unwrap();
//! let c = (&a + &b).unwrap();
//! assert_eq!(c.data(), &[4.0, 6.0]);
//! ```

use super::{Cpu, Device, FloatElem, Result, Tensor, TensorElem, TensorError};

use rayon::prelude::*;
use std::ops::{Add, Div, Mul, Sub};

/// Implements a binary arithmetic trait (e.g. `Add`) for `&Tensor`, returning `Result`.
macro_rules! impl_bin_op {
    ($trait:ident, $method:ident) => {
        impl<T, const RANK: usize> $trait for &Tensor<T, RANK, Cpu>
        where
            T: TensorElem,
        {
            type Output = Result<Tensor<T, RANK, Cpu>>;

            fn $method(self, rhs: Self) -> Self::Output {
                self.zip_map(rhs, |a, b| a.$method(b))
            }
        }
    };
}

impl_bin_op!(Add, add);
impl_bin_op!(Sub, sub);
impl_bin_op!(Mul, mul);
impl_bin_op!(Div, div);

/// Device-generic tensor operations.
pub trait TensorOps<T: TensorElem, const RANK: usize>: Sized {
    /// Swaps the last two axes.
    fn transpose(&self) -> Result<Self>;
}

impl<T, const RANK: usize, D: Device> TensorOps<T, RANK> for Tensor<T, RANK, D>
where
    T: TensorElem,
{
    fn transpose(&self) -> Result<Self> {
        let data = D::transpose(&self.data, &self.shape)?;

        let mut shape = self.shape;
        if RANK >= 2 {
            shape.swap(RANK - 1, RANK - 2);
        }

        Ok(Tensor {
            shape,
            strides: super::compute_strides(&shape),
            data,
            device: self.device.clone(),
        })
    }
}

fn check_axis(axis: usize, shape: &[usize]) -> Result<()> {
    if axis >= shape.len() {
        return Err(TensorError::IndexOutOfBounds {
            index: vec![axis],
            shape: shape.to_vec(),
        });
    }
    Ok(())
}

impl<T, const RANK: usize> Tensor<T, RANK, Cpu>
where
    T: TensorElem,
{
    /// Applies `f` element-wise.
    ///
    /// ```rust
    /// use moe_rs::tensor::Tensor;
    /// let t = Tensor::<f32, 1>::new(vec![1.0, 2.0, 3.0], [3]).unwrap();
    /// assert_eq!(t.map(|x| x * x).data(), &[1.0, 4.0, 9.0]);
    /// ```
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(T) -> T + Sync + Send,
    {
        let mut out = Tensor::zeros(self.shape);
        out.data
            .par_iter_mut()
            .zip(self.data.par_iter())
            .for_each(|(o, &x)| *o = f(x));
        out
    }

    /// Combines two same-shape tensors element-wise.
    pub fn zip_map<F>(&self, rhs: &Self, f: F) -> Result<Self>
    where
        F: Fn(T, T) -> T + Sync + Send,
    {
        if self.shape != rhs.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: rhs.shape.to_vec(),
            });
        }

        let mut out = Tensor::zeros(self.shape);
        out.data
            .par_iter_mut()
            .zip(self.data.par_iter())
            .zip(rhs.data.par_iter())
            .for_each(|((o, &a), &b)| *o = f(a, b));
        Ok(out)
    }

    /// Multiplies every element by `factor`.
    pub fn scale(&self, factor: T) -> Self {
        self.map(|x| x * factor)
    }

    /// Sum of all elements.
    pub fn sum(&self) -> T {
        self.data.iter().fold(T::zero(), |acc, &x| acc + x)
    }

    /// Matrix multiplication over the last two axes; leading axes are batch axes.
    ///
    /// - `[M, K] x [K, N] -> [M, N]`
    /// - `[B, M, K] x [B, K, N] -> [B, M, N]`
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        const { assert!(RANK >= 2, "Matmul requires rank >= 2") };

        if self.shape[..RANK - 2] != rhs.shape[..RANK - 2] {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: rhs.shape.to_vec(),
            });
        }

        let data = moe_rs_kernels::cpu_matmul(&self.data, &rhs.data, &self.shape, &rhs.shape)?;

        let mut shape = self.shape;
        shape[RANK - 1] = rhs.shape[RANK - 1];
        Tensor::new(data, shape)
    }
}

impl<T> Tensor<T, 2, Cpu>
where
    T: TensorElem,
{
    /// Gathers rows: output row `i` is input row `indices[i]`.
    pub fn index_select(&self, indices: &[usize]) -> Result<Self> {
        let [_, cols] = self.shape;
        let data = moe_rs_kernels::cpu_index_select(&self.data, cols, indices)?;
        Tensor::new(data, [indices.len(), cols])
    }

    /// Scatter-adds rows of `src` into `self`: row `i` of `src` is added to row `indices[i]`.
    ///
    /// Rows sharing a destination accumulate.
    pub fn index_add(&mut self, indices: &[usize], src: &Self) -> Result<()> {
        let [_, cols] = self.shape;
        if src.shape != [indices.len(), cols] {
            return Err(TensorError::ShapeMismatch {
                expected: vec![indices.len(), cols],
                got: src.shape.to_vec(),
            });
        }
        moe_rs_kernels::cpu_index_add(&mut self.data, cols, indices, &src.data)?;
        Ok(())
    }

    /// Top-`k` of every row, largest first; ties go to the lower column index.
    pub fn topk(&self, k: usize) -> Result<(Self, Tensor<usize, 2, Cpu>)> {
        let [rows, _] = self.shape;
        let (values, indices) = moe_rs_kernels::cpu_topk(&self.data, &self.shape, k)?;
        Ok((Tensor::new(values, [rows, k])?, Tensor::new(indices, [rows, k])?))
    }

    /// Sums along `axis`, dropping it.
    pub fn sum_axis(&self, axis: usize) -> Result<Tensor<T, 1, Cpu>> {
        check_axis(axis, &self.shape)?;
        let [rows, cols] = self.shape;

        if axis == 1 {
            let mut out = Tensor::zeros([rows]);
            if cols > 0 {
                out.data
                    .par_iter_mut()
                    .zip(self.data.par_chunks(cols))
                    .for_each(|(o, row)| *o = row.iter().fold(T::zero(), |acc, &x| acc + x));
            }
            Ok(out)
        } else {
            let mut out = Tensor::zeros([cols]);
            if cols > 0 {
                for row in self.data.chunks_exact(cols) {
                    for (o, &x) in out.data.iter_mut().zip(row) {
                        *o += x;
                    }
                }
            }
            Ok(out)
        }
    }
}

impl<T> Tensor<T, 2, Cpu>
where
    T: FloatElem,
{
    /// Runs `f` on every row of the tensor laid out so that `axis` is the row axis.
    fn along_axis<F>(&self, axis: usize, f: F) -> Result<Self>
    where
        F: Fn(&[T], &mut [T]) + Sync + Send,
    {
        check_axis(axis, &self.shape)?;
        let src = if axis == 1 {
            self.clone()
        } else {
            self.transpose()?
        };

        let [_, cols] = src.shape;
        let mut out = Tensor::zeros(src.shape);
        if cols > 0 {
            out.data
                .par_chunks_mut(cols)
                .zip(src.data.par_chunks(cols))
                .for_each(|(o, x)| f(x, o));
        }

        if axis == 1 { Ok(out) } else { out.transpose() }
    }

    /// Numerically stable softmax along `axis` (0 = down columns, 1 = across rows).
    pub fn softmax(&self, axis: usize) -> Result<Self> {
        self.along_axis(axis, |x, out| {
            let max = x.iter().fold(T::neg_infinity(), |m, &v| m.max(v));
            let mut total = T::zero();
            for (o, &v) in out.iter_mut().zip(x) {
                *o = (v - max).exp();
                total += *o;
            }
            for o in out.iter_mut() {
                *o /= total;
            }
        })
    }

    /// `log(sum(exp(x)))` along `axis`, computed with the max subtracted first.
    pub fn logsumexp(&self, axis: usize) -> Result<Tensor<T, 1, Cpu>> {
        check_axis(axis, &self.shape)?;
        let src = if axis == 1 {
            self.clone()
        } else {
            self.transpose()?
        };
        let [rows, cols] = src.shape;

        let mut out = Tensor::zeros([rows]);
        if cols > 0 {
            out.data
                .par_iter_mut()
                .zip(src.data.par_chunks(cols))
                .for_each(|(o, x)| {
                    let max = x.iter().fold(T::neg_infinity(), |m, &v| m.max(v));
                    let total = x.iter().fold(T::zero(), |acc, &v| acc + (v - max).exp());
                    *o = max + total.ln();
                });
        }
        Ok(out)
    }
}

impl<T, const RANK: usize> Tensor<T, RANK, Cpu>
where
    T: FloatElem,
{
    /// Largest absolute element-wise difference; `None` on shape mismatch.
    pub fn max_abs_diff(&self, other: &Self) -> Option<T> {
        if self.shape != other.shape {
            return None;
        }
        Some(
            self.data
                .iter()
                .zip(&other.data)
                .fold(T::zero(), |m, (&a, &b)| m.max((a - b).abs())),
        )
    }

    /// `true` when shapes match and every element is within `atol`.
    pub fn all_close(&self, other: &Self, atol: T) -> bool {
        self.max_abs_diff(other).is_some_and(|d| d <= atol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic() {
        let a = Tensor::<f32, 1>::new(vec![1.0, 2.0], [2]).unwrap();
        let b = Tensor::<f32, 1>::new(vec![3.0, 4.0], [2]).unwrap();

        assert_eq!((&a + &b).unwrap().data(), &[4.0, 6.0]);
        assert_eq!((&a - &b).unwrap().data(), &[-2.0, -2.0]);
        assert_eq!((&a * &b).unwrap().data(), &[3.0, 8.0]);
        assert_eq!((&b / &a).unwrap().data(), &[3.0, 2.0]);

        let f = Tensor::<f32, 1>::new(vec![1.0, 2.0, 3.0], [3]).unwrap();
        assert!(matches!(&a + &f, Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_matmul_2d() {
        let a = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]).unwrap();
        let b = Tensor::<f32, 2>::new(vec![7.0, 8.0, 9.0, 1.0, 2.0, 3.0], [3, 2]).unwrap();

        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), &[2, 2]);
        // 1*7 + 2*9 + 3*2 = 31, 1*8 + 2*1 + 3*3 = 19
        // 4*7 + 5*9 + 6*2 = 85, 4*8 + 5*1 + 6*3 = 55
        assert_eq!(c.data(), &[31.0, 19.0, 85.0, 55.0]);
    }

    #[test]
    fn test_matmul_3d_batch_mismatch() {
        let a = Tensor::<f32, 3>::zeros([2, 1, 3]);
        let b = Tensor::<f32, 3>::zeros([3, 3, 2]);
        assert!(matches!(
            a.matmul(&b),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_transpose() {
        let t = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]).unwrap();
        let t_t = t.transpose().unwrap();
        assert_eq!(t_t.shape(), &[3, 2]);
        assert_eq!(t_t.data(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_index_select_and_add() {
        let x = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [3, 2]).unwrap();
        let picked = x.index_select(&[2, 2, 0]).unwrap();
        assert_eq!(picked.shape(), &[3, 2]);
        assert_eq!(picked.data(), &[5.0, 6.0, 5.0, 6.0, 1.0, 2.0]);

        let mut out = Tensor::<f32, 2>::zeros([3, 2]);
        out.index_add(&[2, 2, 0], &picked).unwrap();
        assert_eq!(out.data(), &[1.0, 2.0, 0.0, 0.0, 10.0, 12.0]);

        let wrong = Tensor::<f32, 2>::zeros([2, 2]);
        assert!(out.index_add(&[0, 1, 2], &wrong).is_err());
        assert!(matches!(
            x.index_select(&[3]),
            Err(TensorError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_topk() {
        let x = Tensor::<f32, 2>::new(vec![0.2, 0.5, 0.3, 0.9, 0.05, 0.05], [2, 3]).unwrap();
        let (v, i) = x.topk(2).unwrap();
        assert_eq!(i.data(), &[1, 2, 0, 1]);
        assert_eq!(v.data(), &[0.5, 0.3, 0.9, 0.05]);
        assert!(x.topk(4).is_err());
    }

    #[test]
    fn test_sum_axis() {
        let x = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]).unwrap();
        assert_eq!(x.sum_axis(0).unwrap().data(), &[5.0, 7.0, 9.0]);
        assert_eq!(x.sum_axis(1).unwrap().data(), &[6.0, 15.0]);
        assert_eq!(x.sum(), 21.0);
        assert!(x.sum_axis(2).is_err());
    }

    #[test]
    fn test_softmax_axes() {
        let x = Tensor::<f64, 2>::new(vec![1.0, 2.0, 3.0, 1.0, 1.0, 1.0], [2, 3]).unwrap();

        let rows = x.softmax(1).unwrap();
        for r in rows.sum_axis(1).unwrap().data() {
            assert!((r - 1.0).abs() < 1e-12);
        }
        // Uniform row
        assert!((rows.data()[3] - 1.0 / 3.0).abs() < 1e-12);

        let cols = x.softmax(0).unwrap();
        for c in cols.sum_axis(0).unwrap().data() {
            assert!((c - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_softmax_large_logits() {
        let x = Tensor::<f32, 2>::new(vec![1000.0, 1000.0], [1, 2]).unwrap();
        let p = x.softmax(1).unwrap();
        assert!((p.data()[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_logsumexp() {
        let x = Tensor::<f64, 2>::new(vec![0.0, 0.0, 1.0, 2.0], [2, 2]).unwrap();
        let lse = x.logsumexp(1).unwrap();
        // log(e^0 + e^0) = ln 2
        assert!((lse.data()[0] - 2.0f64.ln()).abs() < 1e-12);
        // log(e^1 + e^2)
        let expected = (1.0f64.exp() + 2.0f64.exp()).ln();
        assert!((lse.data()[1] - expected).abs() < 1e-12);

        let lse0 = x.logsumexp(0).unwrap();
        assert!((lse0.data()[0] - (1.0f64 + 1.0f64.exp()).ln()).abs() < 1e-12);
    }

    #[test]
    fn test_all_close() {
        let a = Tensor::<f32, 1>::new(vec![1.0, 2.0], [2]).unwrap();
        let b = Tensor::<f32, 1>::new(vec![1.0, 2.00001], [2]).unwrap();
        assert!(a.all_close(&b, 1e-4));
        assert!(!a.all_close(&b, 1e-6));
        let c = Tensor::<f32, 1>::new(vec![1.0], [1]).unwrap();
        assert!(!a.all_close(&c, 1.0));
    }
}
