use super::error::{MoeError, Result, check_dim};
use crate::autograd::Variable;
use crate::nn::{Activation, InitType, Module, Parameter, init_tensor};
use crate::tensor::{FloatElem, Tensor};
use rand::Rng;

/// Per-expert computation over dense expert batches.
///
/// Shape contract: `[n_experts, capacity, input_dim] -> [n_experts, capacity, output_dim]`.
/// Slot `(e, c)` of the output must depend only on slot `(e, c)` of the input.
pub trait Expert<T: FloatElem + 'static>: Module<T> {
    fn n_experts(&self) -> usize;
    fn input_dim(&self) -> usize;
    fn output_dim(&self) -> usize;
    fn forward(&self, x: &Variable<T, 3>) -> Result<Variable<T, 3>>;
}

/// Two-layer feed-forward network per expert, all experts in one batched matmul.
///
/// `y[e] = act(x[e] @ lin1[e]) @ lin2[e]`
#[derive(Debug)]
pub struct ExpertFF<T: FloatElem> {
    /// `[n_experts, input_dim, expert_size]`
    pub lin1: Variable<T, 3>,
    /// `[n_experts, expert_size, output_dim]`
    pub lin2: Variable<T, 3>,
    activation: Activation,
}

impl<T: FloatElem + 'static> ExpertFF<T> {
    /// # Errors
    ///
    /// `DimensionMismatch` if the two stacks disagree on `n_experts` or `expert_size`.
    pub fn new(lin1: Tensor<T, 3>, lin2: Tensor<T, 3>, activation: Activation) -> Result<Self> {
        let [e1, _, s1] = *lin1.shape();
        let [e2, s2, _] = *lin2.shape();
        check_dim("expert stack count", e1, e2)?;
        check_dim("expert hidden width", s1, s2)?;
        Ok(Self {
            lin1: Variable::new(lin1),
            lin2: Variable::new(lin2),
            activation,
        })
    }

    /// Randomly initialized experts.
    ///
    /// `lin1` uses `fan_in = input_dim`; `lin2` uses `fan_in = n_experts * expert_size`, the
    /// total hidden width, so the summed layer output keeps the same scale however the width is
    /// split between experts.
    #[allow(clippy::too_many_arguments)]
    pub fn init<R: Rng + ?Sized>(
        n_experts: usize,
        input_dim: usize,
        expert_size: usize,
        output_dim: usize,
        activation: Activation,
        init_type: InitType,
        init_scale: f64,
        rng: &mut R,
    ) -> Result<Self> {
        if n_experts == 0 {
            return Err(MoeError::InvalidConfig(
                "n_experts must be positive".to_string(),
            ));
        }
        let lin1 = init_tensor(
            [n_experts, input_dim, expert_size],
            input_dim,
            init_type,
            init_scale,
            rng,
        )?;
        let lin2 = init_tensor(
            [n_experts, expert_size, output_dim],
            n_experts * expert_size,
            init_type,
            init_scale,
            rng,
        )?;
        Self::new(lin1, lin2, activation)
    }

    pub fn expert_size(&self) -> usize {
        self.lin1.shape()[2]
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }
}

impl<T: FloatElem + 'static> Expert<T> for ExpertFF<T> {
    fn n_experts(&self) -> usize {
        self.lin1.shape()[0]
    }

    fn input_dim(&self) -> usize {
        self.lin1.shape()[1]
    }

    fn output_dim(&self) -> usize {
        self.lin2.shape()[2]
    }

    fn forward(&self, x: &Variable<T, 3>) -> Result<Variable<T, 3>> {
        let [experts, _, width] = *x.shape();
        check_dim("expert batch count", self.n_experts(), experts)?;
        check_dim("expert input width", self.input_dim(), width)?;

        let hidden = self.activation.apply(&x.matmul(&self.lin1)?);
        Ok(hidden.matmul(&self.lin2)?)
    }
}

impl<T: FloatElem + 'static> Module<T> for ExpertFF<T> {
    fn parameters_mut(&mut self) -> Vec<Parameter<'_, T>> {
        vec![
            Parameter::Stack(&mut self.lin1),
            Parameter::Stack(&mut self.lin2),
        ]
    }
}
