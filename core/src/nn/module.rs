use crate::autograd::Variable;
use crate::optim::Optimizer;
use crate::tensor::{Result, TensorElem};
use std::fmt::Debug;

/// A mutable handle to one trainable parameter.
///
/// Parameters come in different ranks (bias vectors, weight matrices, stacked per-expert
/// weights), so they are exposed through this closed set rather than a single generic type.
#[derive(Debug)]
pub enum Parameter<'a, T: TensorElem> {
    Vector(&'a mut Variable<T, 1>),
    Matrix(&'a mut Variable<T, 2>),
    Stack(&'a mut Variable<T, 3>),
}

impl<T: TensorElem + 'static> Parameter<'_, T> {
    /// Number of scalar elements.
    pub fn size(&self) -> usize {
        match self {
            Parameter::Vector(v) => v.data.size(),
            Parameter::Matrix(v) => v.data.size(),
            Parameter::Stack(v) => v.data.size(),
        }
    }

    /// Clears the accumulated gradient.
    pub fn zero_grad(&self) {
        match self {
            Parameter::Vector(v) => v.zero_grad(),
            Parameter::Matrix(v) => v.zero_grad(),
            Parameter::Stack(v) => v.zero_grad(),
        }
    }

    /// Applies one optimizer update if a gradient is present.
    pub fn step<O: Optimizer<T>>(&mut self, optimizer: &O) -> Result<()> {
        match self {
            Parameter::Vector(v) => step_variable(v, optimizer),
            Parameter::Matrix(v) => step_variable(v, optimizer),
            Parameter::Stack(v) => step_variable(v, optimizer),
        }
    }
}

fn step_variable<T, O, const RANK: usize>(var: &mut Variable<T, RANK>, optimizer: &O) -> Result<()>
where
    T: TensorElem + 'static,
    O: Optimizer<T>,
{
    match var.grad() {
        Some(grad) => optimizer.update(&mut var.data, &grad),
        None => Ok(()),
    }
}

/// A neural network component that owns trainable parameters.
///
/// Parameters live on the autograd tape (`Rc`-shared gradient cells), so modules are
/// single-threaded values; parallelism happens inside the tensor kernels.
pub trait Module<T: TensorElem + 'static>: Debug {
    /// Every trainable parameter, in a stable order.
    fn parameters_mut(&mut self) -> Vec<Parameter<'_, T>>;

    /// Total number of trainable scalars.
    fn num_parameters(&mut self) -> usize {
        self.parameters_mut().iter().map(Parameter::size).sum()
    }

    /// Clears the gradients of all parameters.
    fn zero_grad(&mut self) {
        for p in self.parameters_mut() {
            p.zero_grad();
        }
    }

    /// Applies `optimizer` to every parameter that received a gradient.
    fn apply_gradients<O: Optimizer<T>>(&mut self, optimizer: &O) -> Result<()>
    where
        Self: Sized,
    {
        for mut p in self.parameters_mut() {
            p.step(optimizer)?;
        }
        Ok(())
    }
}
