//! Function transforms over scalar-valued functions of a tensor.

use crate::autograd::Variable;
use crate::tensor::{Cpu, Result, Tensor, TensorElem};

type CpuTensor<T, const RANK: usize> = Tensor<T, RANK, Cpu>;

/// Returns a function computing `df/dx` for a scalar-valued `f`.
///
/// Inputs that `f` ignores get a zero gradient.
///
/// ```rust
/// use moe_rs::autograd::{Variable, functional::grad};
/// use moe_rs::tensor::Tensor;
///
/// let square_sum = |x: Variable<f64, 1>| (&x * &x).unwrap().sum();
/// let g = grad(square_sum)(Tensor::new(vec![1.0, 3.0], [2]).unwrap()).unwrap();
/// assert_eq!(g.data(), &[2.0, 6.0]);
/// ```
pub fn grad<F, T, const RANK: usize>(f: F) -> impl Fn(CpuTensor<T, RANK>) -> Result<CpuTensor<T, RANK>>
where
    F: Fn(Variable<T, RANK>) -> Variable<T, 0>,
    T: TensorElem + 'static,
{
    let vg = value_and_grad(f);
    move |x| vg(x).map(|(_, g)| g)
}

/// Returns a function computing `(f(x), df/dx)` for a scalar-valued `f`.
pub fn value_and_grad<F, T, const RANK: usize>(
    f: F,
) -> impl Fn(CpuTensor<T, RANK>) -> Result<(T, CpuTensor<T, RANK>)>
where
    F: Fn(Variable<T, RANK>) -> Variable<T, 0>,
    T: TensorElem + 'static,
{
    move |x| {
        let shape = *x.shape();
        let x_var = Variable::new(x);
        let y = f(x_var.clone());
        y.backward()?;

        let g = x_var.grad().unwrap_or_else(|| Tensor::zeros(shape));
        Ok((y.data.data()[0], g))
    }
}
