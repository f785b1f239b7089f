use super::config::SoftmaxOver;
use super::error::{Result, check_dim};
use crate::autograd::Variable;
use crate::nn::{InitType, Linear, Module, Parameter};
use crate::tensor::{FloatElem, Tensor};
use rand::Rng;

/// Scores produced by the gate for one forward pass.
#[derive(Debug, Clone)]
pub struct GateOutput<T: FloatElem> {
    /// Raw projections, `[tokens, experts]`.
    pub logits: Variable<T, 2>,
    /// `logits` after the configured softmax, `[tokens, experts]`.
    pub probs: Variable<T, 2>,
}

/// Gate: projects every token onto one score per expert.
///
/// A bias-free linear map `[dmodel, n_experts]` followed by a softmax over experts (each token
/// row sums to 1) or over tokens (each expert column sums to 1).
#[derive(Debug)]
pub struct Gate<T: FloatElem> {
    proj: Linear<T>,
    softmax_over: SoftmaxOver,
}

impl<T: FloatElem + 'static> Gate<T> {
    /// Wraps an existing `[dmodel, n_experts]` weight.
    pub fn new(weight: Tensor<T, 2>, softmax_over: SoftmaxOver) -> Result<Self> {
        Ok(Self {
            proj: Linear::new(weight, None)?,
            softmax_over,
        })
    }

    /// Randomly initialized gate with `fan_in = dmodel`.
    pub fn init<R: Rng + ?Sized>(
        dmodel: usize,
        n_experts: usize,
        softmax_over: SoftmaxOver,
        init_type: InitType,
        init_scale: f64,
        rng: &mut R,
    ) -> Result<Self> {
        Ok(Self {
            proj: Linear::init(dmodel, n_experts, false, init_type, init_scale, rng)?,
            softmax_over,
        })
    }

    pub fn dmodel(&self) -> usize {
        self.proj.in_features()
    }

    pub fn n_experts(&self) -> usize {
        self.proj.out_features()
    }

    pub fn softmax_over(&self) -> SoftmaxOver {
        self.softmax_over
    }

    /// The `[dmodel, n_experts]` projection.
    pub fn weight(&self) -> &Variable<T, 2> {
        &self.proj.weight
    }

    /// Scores a flattened `[tokens, dmodel]` batch.
    pub fn forward_flat(&self, x: &Variable<T, 2>) -> Result<GateOutput<T>> {
        check_dim("gate input width", self.dmodel(), x.shape()[1])?;
        let logits = self.proj.forward(x)?;
        let probs = logits.softmax(self.softmax_over.axis())?;
        Ok(GateOutput { logits, probs })
    }

    /// Scores a `[batch, seq, dmodel]` batch, flattening it to `[batch * seq, dmodel]`.
    pub fn forward(&self, x: &Variable<T, 3>) -> Result<GateOutput<T>> {
        let [batch, seq, width] = *x.shape();
        check_dim("gate input width", self.dmodel(), width)?;
        let flat = x.reshape([batch * seq, width])?;
        self.forward_flat(&flat)
    }
}

impl<T: FloatElem + 'static> Module<T> for Gate<T> {
    fn parameters_mut(&mut self) -> Vec<Parameter<'_, T>> {
        self.proj.parameters_mut()
    }
}
