//! Capacity-limited assignment of tokens to experts.
//!
//! Both routers produce a [`RoutingDecision`]: a `[capacity, n_experts]` table whose column `e`
//! lists the tokens expert `e` will process, plus the gate weight of every slot.
//!
//! # Token choice
//!
//! 1. Each token picks its `top_k` experts.
//! 2. The picks form a `[tokens, experts]` 0/1 assignment mask.
//! 3. Each expert keeps the first `capacity` tokens that picked it. Later ones are dropped for
//!    that expert and are not re-routed.
//!
//! # Expert choice
//!
//! Each expert takes its `capacity` highest-scoring tokens directly. Every expert is full, but a
//! token may be taken by any number of experts, including none.
//!
//! Ties are broken towards the lower index in every top-k, so a decision is a pure function of
//! the scores.

use super::config::check_capacity_factor;
use super::error::{MoeError, Result, check_dim};
use crate::autograd::Variable;
use crate::tensor::{Cpu, FloatElem, Tensor, TensorOps, scalar};
use tracing::{debug, warn};

/// `min(floor(capacity_factor * n_tokens * top_k / n_experts), n_tokens)`.
///
/// ```rust
/// use moe_rs::moe::compute_capacity;
///
/// assert_eq!(compute_capacity(1.0, 22, 1, 5), 4);
/// assert_eq!(compute_capacity(5.0, 22, 1, 5), 22);
/// ```
pub fn compute_capacity(
    capacity_factor: f64,
    n_tokens: usize,
    top_k: usize,
    n_experts: usize,
) -> usize {
    if n_experts == 0 {
        return 0;
    }
    let raw = capacity_factor * n_tokens as f64 * top_k as f64 / n_experts as f64;
    // Float-to-int `as` saturates and maps NaN to 0.
    (raw.floor() as usize).min(n_tokens)
}

/// Which token sits in every `(slot, expert)` cell, and at what weight.
#[derive(Debug, Clone)]
pub struct RoutingDecision<T: FloatElem> {
    /// `[capacity, n_experts]` token indices into the flattened batch.
    pub indices: Tensor<usize, 2, Cpu>,
    /// `[capacity, n_experts]` gate weights; zero on empty slots.
    pub values: Variable<T, 2>,
    /// `[capacity, n_experts]`, 1 where the slot holds a routed token and 0 where it is padding.
    pub slot_mask: Tensor<T, 2, Cpu>,
    /// Tokens that asked for each expert before capacity was applied, `[n_experts]`.
    pub tokens_per_expert: Tensor<T, 1, Cpu>,
    pub capacity: usize,
    pub n_tokens: usize,
    /// Fraction of requested `(token, expert)` assignments that did not get a slot. For expert
    /// choice, the fraction of tokens no expert took.
    pub dropped_ratio: f64,
}

impl<T: FloatElem + 'static> RoutingDecision<T> {
    pub fn n_experts(&self) -> usize {
        self.indices.shape()[1]
    }

    /// Token indices in expert-major order: all of expert 0's slots, then expert 1's, and so on.
    pub fn expert_major_indices(&self) -> crate::tensor::Result<Vec<usize>> {
        Ok(self.indices.transpose()?.into_vec())
    }

    /// Occupied slots per expert; never exceeds `capacity`.
    pub fn routed_per_expert(&self) -> Vec<usize> {
        let mut counts = vec![0; self.n_experts()];
        let n = self.n_experts();
        if n == 0 {
            return counts;
        }
        for row in self.slot_mask.data().chunks_exact(n) {
            for (c, &m) in counts.iter_mut().zip(row) {
                if m > T::zero() {
                    *c += 1;
                }
            }
        }
        counts
    }

    /// Number of experts that will process each token.
    pub fn experts_per_token(&self) -> Vec<usize> {
        let mut counts = vec![0; self.n_tokens];
        for (&token, &m) in self.indices.data().iter().zip(self.slot_mask.data()) {
            if m > T::zero() {
                counts[token] += 1;
            }
        }
        counts
    }

    /// Tokens that no expert will process.
    pub fn dropped_tokens(&self) -> Vec<usize> {
        self.experts_per_token()
            .iter()
            .enumerate()
            .filter(|&(_, &n)| n == 0)
            .map(|(t, _)| t)
            .collect()
    }
}

/// Turns `[tokens, experts]` gate scores into a [`RoutingDecision`].
pub trait Router {
    fn n_experts(&self) -> usize;

    /// Slots per expert for a batch of `n_tokens`.
    fn capacity(&self, n_tokens: usize) -> usize;

    fn route<T: FloatElem + 'static>(&self, scores: &Variable<T, 2>) -> Result<RoutingDecision<T>>;
}

fn check_top_k(top_k: usize, n_experts: usize) -> Result<()> {
    if top_k == 0 || top_k > n_experts {
        return Err(MoeError::InvalidConfig(format!(
            "top_k must be in 1..={n_experts}, got {top_k}"
        )));
    }
    Ok(())
}

fn warn_if_empty(capacity: usize, n_tokens: usize) {
    if capacity == 0 && n_tokens > 0 {
        warn!(n_tokens, "expert capacity is 0, every token is dropped");
    }
}

fn sum_to_f64<T: FloatElem>(t: &Tensor<T, 2, Cpu>) -> f64 {
    t.sum().to_f64().unwrap_or(0.0)
}

/// Tokens pick experts; each expert keeps at most `capacity` of them.
#[derive(Debug, Clone)]
pub struct TokenChoiceRouter {
    n_experts: usize,
    top_k: usize,
    capacity_factor: f64,
}

impl TokenChoiceRouter {
    /// # Errors
    ///
    /// `InvalidConfig` if `top_k` is 0 or exceeds `n_experts`, or `capacity_factor` is not a
    /// positive finite number.
    pub fn new(n_experts: usize, top_k: usize, capacity_factor: f64) -> Result<Self> {
        check_top_k(top_k, n_experts)?;
        check_capacity_factor(capacity_factor)?;
        Ok(Self {
            n_experts,
            top_k,
            capacity_factor,
        })
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }
}

impl Router for TokenChoiceRouter {
    fn n_experts(&self) -> usize {
        self.n_experts
    }

    fn capacity(&self, n_tokens: usize) -> usize {
        compute_capacity(self.capacity_factor, n_tokens, self.top_k, self.n_experts)
    }

    fn route<T: FloatElem + 'static>(&self, scores: &Variable<T, 2>) -> Result<RoutingDecision<T>> {
        let [n_tokens, n_experts] = *scores.shape();
        check_dim("router score width", self.n_experts, n_experts)?;
        let capacity = self.capacity(n_tokens);
        warn_if_empty(capacity, n_tokens);

        // Token -> expert picks as a [tokens, experts] count mask.
        let (_, picks) = scores.data.topk(self.top_k)?;
        let mut assignment = Tensor::<T, 2>::zeros([n_tokens, n_experts]);
        {
            let mask = assignment.data_mut();
            for (token, row) in picks.data().chunks_exact(self.top_k).enumerate() {
                for &expert in row {
                    mask[token * n_experts + expert] += T::one();
                }
            }
        }
        let tokens_per_expert = assignment.sum_axis(0)?;

        // Expert -> token: the first `capacity` requesting tokens win.
        let (kept, slots) = assignment.transpose()?.topk(capacity)?;
        let slot_mask = kept.transpose()?;
        let indices = slots.transpose()?;

        let picked = scores.gather_axis0(&indices)?;
        let values = (&picked * &Variable::new(slot_mask.clone()))?;

        let requested = (n_tokens * self.top_k) as f64;
        let dropped_ratio = if requested > 0.0 {
            (requested - sum_to_f64(&slot_mask)) / requested
        } else {
            0.0
        };
        debug!(
            n_tokens,
            n_experts,
            capacity,
            dropped_ratio,
            "token-choice routing"
        );

        Ok(RoutingDecision {
            indices,
            values,
            slot_mask,
            tokens_per_expert,
            capacity,
            n_tokens,
            dropped_ratio,
        })
    }
}

/// Experts pick their `capacity` best tokens.
///
/// `top_k` here only sizes the capacity (the average number of experts per token); there is no
/// per-token selection step.
#[derive(Debug, Clone)]
pub struct ExpertChoiceRouter {
    n_experts: usize,
    top_k: usize,
    capacity_factor: f64,
}

impl ExpertChoiceRouter {
    /// # Errors
    ///
    /// Same conditions as [`TokenChoiceRouter::new`].
    pub fn new(n_experts: usize, top_k: usize, capacity_factor: f64) -> Result<Self> {
        check_top_k(top_k, n_experts)?;
        check_capacity_factor(capacity_factor)?;
        Ok(Self {
            n_experts,
            top_k,
            capacity_factor,
        })
    }
}

impl Router for ExpertChoiceRouter {
    fn n_experts(&self) -> usize {
        self.n_experts
    }

    fn capacity(&self, n_tokens: usize) -> usize {
        compute_capacity(self.capacity_factor, n_tokens, self.top_k, self.n_experts)
    }

    fn route<T: FloatElem + 'static>(&self, scores: &Variable<T, 2>) -> Result<RoutingDecision<T>> {
        let [n_tokens, n_experts] = *scores.shape();
        check_dim("router score width", self.n_experts, n_experts)?;
        let capacity = self.capacity(n_tokens);
        warn_if_empty(capacity, n_tokens);

        let (_, slots) = scores.data.transpose()?.topk(capacity)?;
        let indices = slots.transpose()?;
        let values = scores.gather_axis0(&indices)?;
        let slot_mask = Tensor::ones([capacity, n_experts]);
        let tokens_per_expert = Tensor::full(scalar(capacity as f64), [n_experts]);

        let mut decision = RoutingDecision {
            indices,
            values,
            slot_mask,
            tokens_per_expert,
            capacity,
            n_tokens,
            dropped_ratio: 0.0,
        };
        if n_tokens > 0 {
            decision.dropped_ratio = decision.dropped_tokens().len() as f64 / n_tokens as f64;
        }
        debug!(
            n_tokens,
            n_experts,
            capacity,
            dropped_ratio = decision.dropped_ratio,
            "expert-choice routing"
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(data: Vec<f64>, shape: [usize; 2]) -> Variable<f64, 2> {
        Variable::new(Tensor::new(data, shape).unwrap())
    }

    #[test]
    fn test_compute_capacity() {
        assert_eq!(compute_capacity(1.0, 8, 1, 4), 2);
        assert_eq!(compute_capacity(1.25, 8, 1, 4), 2);
        assert_eq!(compute_capacity(1.0, 8, 2, 4), 4);
        // Capped at the number of tokens.
        assert_eq!(compute_capacity(100.0, 8, 1, 4), 8);
        // Degenerate but legal.
        assert_eq!(compute_capacity(0.1, 8, 1, 4), 0);
        assert_eq!(compute_capacity(1.0, 0, 1, 4), 0);
    }

    #[test]
    fn test_invalid_router_config() {
        assert!(TokenChoiceRouter::new(4, 0, 1.0).is_err());
        assert!(TokenChoiceRouter::new(4, 5, 1.0).is_err());
        assert!(TokenChoiceRouter::new(4, 1, 0.0).is_err());
        assert!(ExpertChoiceRouter::new(4, 5, 1.0).is_err());
        assert!(ExpertChoiceRouter::new(4, 1, -2.0).is_err());
    }

    #[test]
    fn test_token_choice_assignment_and_overflow() {
        // 4 tokens, 2 experts, capacity = floor(1.0 * 4 * 1 / 2) = 2.
        // Tokens 0, 1, 2 prefer expert 0; token 3 prefers expert 1.
        let s = scores(vec![0.9, 0.1, 0.8, 0.2, 0.7, 0.3, 0.4, 0.6], [4, 2]);
        let router = TokenChoiceRouter::new(2, 1, 1.0).unwrap();
        let d = router.route(&s).unwrap();

        assert_eq!(d.capacity, 2);
        assert_eq!(d.tokens_per_expert.data(), &[3.0, 1.0]);
        // Expert 0 keeps tokens 0 and 1 (lowest index wins), token 2 is dropped.
        assert_eq!(d.expert_major_indices().unwrap()[..2], [0, 1]);
        assert_eq!(d.routed_per_expert(), vec![2, 1]);
        assert_eq!(d.dropped_tokens(), vec![2]);
        assert!((d.dropped_ratio - 0.25).abs() < 1e-12);

        // Slot (0, 1) holds token 3 with its gate score; slot (1, 1) is padding.
        assert_eq!(d.indices.data()[1], 3);
        let v = d.values.data.data();
        assert_eq!(v, &[0.9, 0.6, 0.8, 0.0]);
    }

    #[test]
    fn test_token_choice_top_k_2() {
        let s = scores(vec![0.5, 0.3, 0.2, 0.1, 0.2, 0.7], [2, 3]);
        let router = TokenChoiceRouter::new(3, 2, 10.0).unwrap();
        let d = router.route(&s).unwrap();
        assert_eq!(d.capacity, 2);
        assert_eq!(d.experts_per_token(), vec![2, 2]);
        assert_eq!(d.tokens_per_expert.data(), &[1.0, 2.0, 1.0]);
        assert_eq!(d.dropped_ratio, 0.0);
    }

    #[test]
    fn test_zero_capacity_drops_everything() {
        let s = scores(vec![0.5; 8], [4, 2]);
        let d = TokenChoiceRouter::new(2, 1, 0.1).unwrap().route(&s).unwrap();
        assert_eq!(d.capacity, 0);
        assert_eq!(d.indices.shape(), &[0, 2]);
        assert_eq!(d.dropped_ratio, 1.0);
        assert_eq!(d.dropped_tokens(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_width_mismatch() {
        let s = scores(vec![0.5; 6], [2, 3]);
        let err = TokenChoiceRouter::new(2, 1, 1.0).unwrap().route(&s);
        assert!(matches!(err, Err(MoeError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_expert_choice_fills_every_slot() {
        // 4 tokens, 2 experts, capacity 2: both experts want token 0.
        let s = scores(vec![0.9, 0.8, 0.1, 0.2, 0.5, 0.1, 0.3, 0.7], [4, 2]);
        let router = ExpertChoiceRouter::new(2, 1, 1.0).unwrap();
        let d = router.route(&s).unwrap();

        assert_eq!(d.capacity, 2);
        assert_eq!(d.routed_per_expert(), vec![2, 2]);
        assert_eq!(d.expert_major_indices().unwrap(), vec![0, 2, 0, 3]);
        assert_eq!(d.experts_per_token(), vec![2, 0, 1, 1]);
        assert_eq!(d.dropped_tokens(), vec![1]);
        assert!((d.dropped_ratio - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_dropped_slots_get_no_gate_gradient() {
        let s = scores(vec![0.9, 0.1, 0.8, 0.2, 0.7, 0.3, 0.4, 0.6], [4, 2]);
        let d = TokenChoiceRouter::new(2, 1, 1.0).unwrap().route(&s).unwrap();
        d.values.sum().backward().unwrap();
        let g = s.grad().unwrap();
        // Only (0,0), (1,0), (3,1) were kept.
        assert_eq!(g.data(), &[1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
    }
}
