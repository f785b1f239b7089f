use super::error::{Result, check_dim};
use super::router::RoutingDecision;
use crate::autograd::Variable;
use crate::tensor::FloatElem;
use tracing::trace;

/// Moves tokens between token order and dense per-expert batches.
///
/// `extract` copies the routed rows without weighting them. `merge` multiplies each expert
/// output row by its slot's gate value and scatter-adds it back to the token it came from. The
/// gate weight therefore enters exactly once, after the expert, and its gradient reaches the
/// gate through the merge.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    n_experts: usize,
}

impl Dispatcher {
    pub fn new(n_experts: usize) -> Self {
        Self { n_experts }
    }

    /// `[tokens, hidden] -> [n_experts, capacity, hidden]`.
    ///
    /// `out[e, slot] = tokens[indices[slot, e]]`. Padding slots hold a copy of some token; their
    /// zero gate value removes them again in [`Dispatcher::merge`].
    pub fn extract<T: FloatElem + 'static>(
        &self,
        tokens: &Variable<T, 2>,
        decision: &RoutingDecision<T>,
    ) -> Result<Variable<T, 3>> {
        let [n_tokens, hidden] = *tokens.shape();
        check_dim("dispatch expert count", self.n_experts, decision.n_experts())?;
        check_dim("dispatch token count", decision.n_tokens, n_tokens)?;

        let order = decision.expert_major_indices()?;
        trace!(
            rows = order.len(),
            hidden,
            capacity = decision.capacity,
            "extract expert batches"
        );
        let rows = tokens.index_select(&order)?;
        Ok(rows.reshape([self.n_experts, decision.capacity, hidden])?)
    }

    /// `[n_experts, capacity, out] -> [n_tokens, out]`.
    ///
    /// `out[indices[slot, e]] += expert_output[e, slot] * values[slot, e]`. Tokens served by
    /// several experts receive the sum of their contributions; tokens served by none stay zero.
    pub fn merge<T: FloatElem + 'static>(
        &self,
        expert_output: &Variable<T, 3>,
        decision: &RoutingDecision<T>,
        n_tokens: usize,
    ) -> Result<Variable<T, 2>> {
        let [experts, capacity, out_dim] = *expert_output.shape();
        check_dim("merge expert count", self.n_experts, experts)?;
        check_dim("merge expert count", self.n_experts, decision.n_experts())?;
        check_dim("merge capacity", decision.capacity, capacity)?;
        check_dim("merge token count", decision.n_tokens, n_tokens)?;

        let order = decision.expert_major_indices()?;
        let weights = decision.values.transpose()?.reshape([experts * capacity])?;
        trace!(rows = order.len(), out_dim, n_tokens, "merge expert outputs");

        let rows = expert_output.reshape([experts * capacity, out_dim])?;
        let weighted = rows.scale_rows(&weights)?;
        Ok(weighted.index_add(&order, n_tokens)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moe::router::{Router, TokenChoiceRouter};
    use crate::tensor::Tensor;

    fn setup() -> (Variable<f64, 2>, Variable<f64, 2>) {
        // 3 tokens of width 2, 2 experts.
        let tokens = Variable::new(Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [3, 2]).unwrap());
        let scores =
            Variable::new(Tensor::new(vec![0.7, 0.3, 0.2, 0.8, 0.6, 0.4], [3, 2]).unwrap());
        (tokens, scores)
    }

    #[test]
    fn test_extract_layout() {
        let (tokens, scores) = setup();
        // capacity = min(floor(2.0 * 3 / 2), 3) = 3
        let d = TokenChoiceRouter::new(2, 1, 2.0).unwrap().route(&scores).unwrap();
        let batches = Dispatcher::new(2).extract(&tokens, &d).unwrap();
        assert_eq!(batches.shape(), &[2, 3, 2]);

        // Expert 0 takes tokens 0 and 2 then pads with token 1; expert 1 takes token 1 then pads.
        let b = batches.data.data();
        assert_eq!(&b[..6], &[1.0, 2.0, 5.0, 6.0, 3.0, 4.0]);
        assert_eq!(&b[6..8], &[3.0, 4.0]);
    }

    #[test]
    fn test_merge_identity_expert_weights_by_gate() {
        let (tokens, scores) = setup();
        let d = TokenChoiceRouter::new(2, 1, 2.0).unwrap().route(&scores).unwrap();
        let dispatcher = Dispatcher::new(2);
        let batches = dispatcher.extract(&tokens, &d).unwrap();
        let out = dispatcher.merge(&batches, &d, 3).unwrap();

        // Every token hits one expert, so out = gate value * token.
        let expected = Tensor::new(vec![0.7, 1.4, 2.4, 3.2, 3.0, 3.6], [3, 2]).unwrap();
        assert!(out.data.all_close(&expected, 1e-12));
    }

    #[test]
    fn test_merge_accumulates_across_experts() {
        let (tokens, scores) = setup();
        let d = TokenChoiceRouter::new(2, 2, 1.0).unwrap().route(&scores).unwrap();
        assert_eq!(d.capacity, 3);
        let dispatcher = Dispatcher::new(2);
        let out = dispatcher
            .merge(&dispatcher.extract(&tokens, &d).unwrap(), &d, 3)
            .unwrap();
        // Both experts see every token and the gate row sums to 1.
        assert!(out.data.all_close(&tokens.data, 1e-12));
    }

    #[test]
    fn test_merge_shape_checks() {
        let (tokens, scores) = setup();
        let d = TokenChoiceRouter::new(2, 1, 2.0).unwrap().route(&scores).unwrap();
        let dispatcher = Dispatcher::new(2);
        let wrong = Variable::new(Tensor::<f64, 3>::zeros([2, 2, 2]));
        assert!(dispatcher.merge(&wrong, &d, 3).is_err());
        let batches = dispatcher.extract(&tokens, &d).unwrap();
        assert!(dispatcher.merge(&batches, &d, 4).is_err());
        assert!(Dispatcher::new(3).extract(&tokens, &d).is_err());
    }
}
