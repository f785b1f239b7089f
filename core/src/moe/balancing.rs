//! Auxiliary routing losses.
//!
//! Both return a differentiable scalar for the training loop to add to its task loss; neither
//! runs a backward pass itself.

use super::error::{Result, check_dim};
use crate::autograd::Variable;
use crate::tensor::{Cpu, FloatElem, Tensor, scalar};

fn zero<T: FloatElem + 'static>() -> Variable<T, 0> {
    Variable::new(Tensor::zeros([]))
}

/// Switch-Transformer load-balancing loss (count based):
///
/// $$ L = w \cdot E \sum_e \bar{p}_e \cdot \frac{c_e}{N} $$
///
/// where $\bar{p}_e$ is the mean gate probability of expert $e$ over the $N$ tokens and $c_e$
/// is the number of tokens that picked $e$ before capacity was applied. The counts are
/// constants, so only the probabilities receive gradient. A perfectly uniform router with
/// `top_k = 1` scores exactly `w`.
///
/// Under expert choice every count is the capacity `C`, so the loss is the constant
/// `w * E * C / N`. Its gradient is uniform over the probabilities and vanishes through an
/// experts-axis softmax, so it carries no balancing signal in that mode.
pub fn load_balancing_loss<T: FloatElem + 'static>(
    probs: &Variable<T, 2>,
    tokens_per_expert: &Tensor<T, 1, Cpu>,
    weight: f64,
) -> Result<Variable<T, 0>> {
    let [n_tokens, n_experts] = *probs.shape();
    check_dim("balancing loss expert count", n_experts, tokens_per_expert.shape()[0])?;
    if n_tokens == 0 {
        return Ok(zero());
    }

    let inv_n = scalar::<T>(1.0 / n_tokens as f64);
    let mean_prob = probs.sum_axis(0)?.scale(inv_n);
    let density = Variable::new(tokens_per_expert.scale(inv_n));
    Ok((&mean_prob * &density)?
        .sum()
        .scale(scalar(weight * n_experts as f64)))
}

/// Router z-loss: `w * mean_tokens(logsumexp_e(logits)^2)`.
///
/// Penalizes large gate logits, which keeps the softmax out of its saturated region.
pub fn z_loss<T: FloatElem + 'static>(
    logits: &Variable<T, 2>,
    weight: f64,
) -> Result<Variable<T, 0>> {
    let [n_tokens, _] = *logits.shape();
    if n_tokens == 0 {
        return Ok(zero());
    }
    let lse = logits.logsumexp(1)?;
    Ok((&lse * &lse)?.mean().scale(scalar(weight)))
}
